//! In-memory chat transport
//!
//! Update batches are queued up front and handed out one per `get_updates`
//! call; every outbound call is recorded.

use super::{BotInfo, ChatTransport, SendOptions, Update};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Longest an empty `get_updates` waits before returning no updates
const IDLE_POLL: Duration = Duration::from_millis(20);

/// A message as the transport last saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub text: String,
    pub options: SendOptions,
    /// Number of times the message was edited after sending
    pub edits: usize,
    pub deleted: bool,
}

#[derive(Default)]
struct State {
    batches: VecDeque<Result<Vec<Update>>>,
    offsets: Vec<i64>,
    sent: Vec<SentMessage>,
    answered_callbacks: Vec<String>,
    webhook_deletes: usize,
    next_message_id: i64,
    fail_side_actions: bool,
}

/// Chat transport backed by process memory
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a batch returned by a later `get_updates`
    pub fn push_updates(&self, updates: Vec<Update>) {
        self.state().batches.push_back(Ok(updates));
    }

    /// Queue a failing `get_updates`
    pub fn push_error(&self, error: RelayError) {
        self.state().batches.push_back(Err(error));
    }

    /// Make edits, deletes, callback answers and webhook removal fail
    pub fn fail_side_actions(&self, fail: bool) {
        self.state().fail_side_actions = fail;
    }

    pub fn pending_batches(&self) -> usize {
        self.state().batches.len()
    }

    /// Offsets passed to `get_updates`, in call order
    pub fn offsets(&self) -> Vec<i64> {
        self.state().offsets.clone()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state().sent.clone()
    }

    /// Current text of every undeleted message sent to `chat_id`
    pub fn texts(&self, chat_id: i64) -> Vec<String> {
        self.state()
            .sent
            .iter()
            .filter(|m| m.chat_id == chat_id && !m.deleted)
            .map(|m| m.text.clone())
            .collect()
    }

    /// Most recent undeleted message for `chat_id`
    pub fn last(&self, chat_id: i64) -> Option<SentMessage> {
        self.state()
            .sent
            .iter()
            .rev()
            .find(|m| m.chat_id == chat_id && !m.deleted)
            .cloned()
    }

    pub fn answered_callbacks(&self) -> Vec<String> {
        self.state().answered_callbacks.clone()
    }

    pub fn webhook_deletes(&self) -> usize {
        self.state().webhook_deletes
    }

    fn side_action(state: &State, method: &str) -> Result<()> {
        if state.fail_side_actions {
            return Err(RelayError::Telegram {
                status: 400,
                description: format!("{method} rejected"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for MemoryTransport {
    async fn get_updates(&self, offset: i64, wait: Duration) -> Result<Vec<Update>> {
        let next = {
            let mut state = self.state();
            state.offsets.push(offset);
            state.batches.pop_front()
        };
        match next {
            Some(batch) => batch.map(|updates| {
                updates
                    .into_iter()
                    .filter(|u| u.update_id >= offset)
                    .collect()
            }),
            None => {
                tokio::time::sleep(wait.min(IDLE_POLL)).await;
                Ok(Vec::new())
            }
        }
    }

    async fn send_message(&self, chat_id: i64, text: &str, options: &SendOptions) -> Result<i64> {
        let mut state = self.state();
        state.next_message_id += 1;
        let message_id = state.next_message_id;
        state.sent.push(SentMessage {
            chat_id,
            message_id,
            text: text.to_string(),
            options: options.clone(),
            edits: 0,
            deleted: false,
        });
        Ok(message_id)
    }

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        options: &SendOptions,
    ) -> Result<()> {
        let mut state = self.state();
        Self::side_action(&state, "editMessageText")?;
        let message = state
            .sent
            .iter_mut()
            .find(|m| m.chat_id == chat_id && m.message_id == message_id && !m.deleted)
            .ok_or_else(|| RelayError::Telegram {
                status: 400,
                description: "Bad Request: message to edit not found".to_string(),
            })?;
        message.text = text.to_string();
        message.options = options.clone();
        message.edits += 1;
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let mut state = self.state();
        Self::side_action(&state, "deleteMessage")?;
        if let Some(message) = state
            .sent
            .iter_mut()
            .find(|m| m.chat_id == chat_id && m.message_id == message_id)
        {
            message.deleted = true;
        }
        Ok(())
    }

    async fn answer_callback_query(&self, callback_id: &str, _text: Option<&str>) -> Result<()> {
        let mut state = self.state();
        state.answered_callbacks.push(callback_id.to_string());
        Self::side_action(&state, "answerCallbackQuery")
    }

    async fn delete_webhook(&self, _drop_pending_updates: bool) -> Result<()> {
        let mut state = self.state();
        state.webhook_deletes += 1;
        Self::side_action(&state, "deleteWebhook")
    }

    async fn get_me(&self) -> Result<BotInfo> {
        Ok(BotInfo {
            id: 1,
            first_name: "relay".to_string(),
            username: Some("relay_bot".to_string()),
        })
    }
}
