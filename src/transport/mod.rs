//! Chat transport: the Bot API surface the relay consumes
//!
//! `ChatTransport` covers exactly the calls the relay makes. `TelegramClient`
//! talks to the real Bot API; `MemoryTransport` scripts updates and records
//! outbound traffic for tests.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod memory;
pub mod telegram;

pub use memory::{MemoryTransport, SentMessage};
pub use telegram::TelegramClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub date: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// One entry of the `getUpdates` feed
///
/// Kinds other than messages and callback queries are not requested, so
/// both fields being `None` only happens for unknown update kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_query: Option<CallbackQuery>,
}

impl Update {
    /// A private-chat text message from `user_id`
    pub fn text(update_id: i64, chat_id: i64, user_id: i64, text: &str) -> Self {
        Self {
            update_id,
            message: Some(Message {
                message_id: update_id,
                from: Some(User::new(user_id)),
                chat: Chat::private(chat_id),
                date: 0,
                text: Some(text.to_string()),
            }),
            callback_query: None,
        }
    }

    /// A button press carrying `data`
    pub fn callback(update_id: i64, chat_id: i64, user_id: i64, data: &str) -> Self {
        Self {
            update_id,
            message: None,
            callback_query: Some(CallbackQuery {
                id: format!("cbq-{update_id}"),
                from: User::new(user_id),
                message: Some(Message {
                    message_id: update_id,
                    from: None,
                    chat: Chat::private(chat_id),
                    date: 0,
                    text: None,
                }),
                data: Some(data.to_string()),
            }),
        }
    }
}

impl User {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            is_bot: false,
            first_name: String::new(),
            username: None,
        }
    }
}

impl Chat {
    pub fn private(id: i64) -> Self {
        Self {
            id,
            kind: "private".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl InlineKeyboardButton {
    pub fn callback(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: Some(data.into()),
            url: None,
        }
    }

    pub fn link(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: None,
            url: Some(url.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

impl InlineKeyboardMarkup {
    pub fn new(rows: Vec<Vec<InlineKeyboardButton>>) -> Self {
        Self {
            inline_keyboard: rows,
        }
    }

    /// Every callback payload in row order
    pub fn callback_data(&self) -> Vec<&str> {
        self.inline_keyboard
            .iter()
            .flatten()
            .filter_map(|b| b.callback_data.as_deref())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Html,
}

impl ParseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Html => "HTML",
        }
    }
}

/// Formatting and controls for an outbound message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub parse_mode: Option<ParseMode>,
    pub reply_markup: Option<InlineKeyboardMarkup>,
    pub disable_web_page_preview: bool,
}

impl SendOptions {
    pub fn html() -> Self {
        Self {
            parse_mode: Some(ParseMode::Html),
            ..Default::default()
        }
    }

    pub fn with_keyboard(mut self, markup: InlineKeyboardMarkup) -> Self {
        self.reply_markup = Some(markup);
        self
    }
}

/// Identity returned by `getMe`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotInfo {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// Bot API calls used by the relay
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Long-poll for updates with id >= `offset`, waiting up to `wait`
    async fn get_updates(&self, offset: i64, wait: Duration) -> Result<Vec<Update>>;

    /// Send a message and return its id
    async fn send_message(&self, chat_id: i64, text: &str, options: &SendOptions) -> Result<i64>;

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        options: &SendOptions,
    ) -> Result<()>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()>;

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()>;

    async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<()>;

    async fn get_me(&self) -> Result<BotInfo>;
}
