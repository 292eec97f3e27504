//! Telegram Bot API client
//!
//! API Reference: https://core.telegram.org/bots/api

use super::{BotInfo, ChatTransport, SendOptions, Update};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use std::time::Duration;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org/bot";

/// Timeout for every call except `getUpdates`
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Telegram Bot API client
pub struct TelegramClient {
    client: reqwest::Client,
    token: String,
    api_base: String,
    request_timeout: Duration,
    /// Added to the long-poll wait to form the `getUpdates` request timeout
    poll_margin: Duration,
}

impl TelegramClient {
    /// Create a client for `token`; `poll_margin` pads the long-poll timeout
    pub fn new(token: impl Into<String>, poll_margin: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
            api_base: TELEGRAM_API_BASE.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            poll_margin,
        }
    }

    /// Point the client at a different API host (local Bot API server)
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Build API URL for a method
    fn api_url(&self, method: &str) -> String {
        format!("{}{}/{}", self.api_base, self.token, method)
    }

    /// Call a Bot API method and return its `result`
    async fn api_call(
        &self,
        method: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let resp = self
            .client
            .post(self.api_url(method))
            .timeout(timeout)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;

        if !status.is_success() || body.get("ok") != Some(&serde_json::Value::Bool(true)) {
            let description = body["description"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string();
            return Err(RelayError::Telegram {
                status: status.as_u16(),
                description,
            });
        }

        Ok(body["result"].clone())
    }

    fn message_body(chat_id: i64, text: &str, options: &SendOptions) -> Result<serde_json::Value> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(parse_mode) = options.parse_mode {
            body["parse_mode"] = serde_json::Value::String(parse_mode.as_str().to_string());
        }
        if let Some(markup) = &options.reply_markup {
            body["reply_markup"] = serde_json::to_value(markup)?;
        }
        if options.disable_web_page_preview {
            body["link_preview_options"] = serde_json::json!({ "is_disabled": true });
        }
        Ok(body)
    }
}

fn is_not_modified(err: &RelayError) -> bool {
    matches!(err, RelayError::Telegram { description, .. } if description.contains("message is not modified"))
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn get_updates(&self, offset: i64, wait: Duration) -> Result<Vec<Update>> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": wait.as_secs(),
            "allowed_updates": ["message", "callback_query"],
        });
        let result = self
            .api_call("getUpdates", &body, wait + self.poll_margin)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn send_message(&self, chat_id: i64, text: &str, options: &SendOptions) -> Result<i64> {
        let body = Self::message_body(chat_id, text, options)?;
        let result = self
            .api_call("sendMessage", &body, self.request_timeout)
            .await?;
        Ok(result["message_id"].as_i64().unwrap_or(0))
    }

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        options: &SendOptions,
    ) -> Result<()> {
        let mut body = Self::message_body(chat_id, text, options)?;
        body["message_id"] = message_id.into();
        match self
            .api_call("editMessageText", &body, self.request_timeout)
            .await
        {
            Err(e) if is_not_modified(&e) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
        });
        self.api_call("deleteMessage", &body, self.request_timeout)
            .await?;
        Ok(())
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        let mut body = serde_json::json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = serde_json::Value::String(text.to_string());
        }
        self.api_call("answerCallbackQuery", &body, self.request_timeout)
            .await?;
        Ok(())
    }

    async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<()> {
        let body = serde_json::json!({ "drop_pending_updates": drop_pending_updates });
        self.api_call("deleteWebhook", &body, self.request_timeout)
            .await?;
        Ok(())
    }

    async fn get_me(&self) -> Result<BotInfo> {
        let result = self
            .api_call("getMe", &serde_json::json!({}), self.request_timeout)
            .await?;
        Ok(serde_json::from_value(result)?)
    }
}
