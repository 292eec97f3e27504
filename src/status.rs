//! Progress message for a running invocation
//!
//! The first update sends a message; later updates edit that same message.
//! Identical text is not re-sent. Failures are logged and swallowed.

use crate::transport::{ChatTransport, SendOptions};
use std::sync::Arc;

pub struct StatusMessage {
    transport: Arc<dyn ChatTransport>,
    chat_id: i64,
    enabled: bool,
    message_id: Option<i64>,
    last_text: Option<String>,
}

impl StatusMessage {
    pub fn new(transport: Arc<dyn ChatTransport>, chat_id: i64, enabled: bool) -> Self {
        Self {
            transport,
            chat_id,
            enabled,
            message_id: None,
            last_text: None,
        }
    }

    pub fn message_id(&self) -> Option<i64> {
        self.message_id
    }

    pub async fn set(&mut self, text: &str) {
        if !self.enabled || self.last_text.as_deref() == Some(text) {
            return;
        }
        self.last_text = Some(text.to_string());

        let options = SendOptions::default();
        match self.message_id {
            None => match self.transport.send_message(self.chat_id, text, &options).await {
                Ok(id) => self.message_id = Some(id),
                Err(e) => tracing::warn!(chat_id = self.chat_id, "Failed to send status: {}", e),
            },
            Some(id) => {
                if let Err(e) = self
                    .transport
                    .edit_message_text(self.chat_id, id, text, &options)
                    .await
                {
                    tracing::warn!(chat_id = self.chat_id, "Failed to update status: {}", e);
                }
            }
        }
    }
}
