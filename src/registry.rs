//! Per-chat session registry
//!
//! Maps a chat id to its relay-side state and tracks which chats have an
//! agent invocation in flight. The registry is an owned object shared by
//! `Arc`; nothing here is global.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Relay-side state for one chat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSession {
    pub chat_id: i64,
    /// `{prefix}-{chat_id}`; remote root sessions owned by this chat carry it as a title prefix
    pub session_key: String,
    pub remote_session_id: Option<String>,
    pub current_agent: String,
    pub working_directory: String,
    /// Replayed by the permission "retry" button
    pub last_user_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Values a fresh `ChatSession` starts with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDefaults {
    pub agent: String,
    pub working_directory: String,
    pub session_prefix: String,
}

impl SessionDefaults {
    pub fn session_key(&self, chat_id: i64) -> String {
        format!("{}-{}", self.session_prefix, chat_id)
    }
}

/// Per-chat state map plus in-flight markers
pub struct SessionRegistry {
    sessions: DashMap<i64, ChatSession>,
    in_flight: Arc<DashMap<i64, ()>>,
    defaults: SessionDefaults,
}

/// Marks a chat busy until dropped
///
/// Dropping the guard clears the marker whether the invocation finished,
/// failed or unwound.
#[derive(Debug)]
pub struct InFlightGuard {
    chat_id: i64,
    in_flight: Arc<DashMap<i64, ()>>,
}

impl InFlightGuard {
    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.chat_id);
    }
}

impl SessionRegistry {
    pub fn new(defaults: SessionDefaults) -> Self {
        Self {
            sessions: DashMap::new(),
            in_flight: Arc::new(DashMap::new()),
            defaults,
        }
    }

    /// Snapshot of the chat's state, created on first access
    ///
    /// Every call counts as activity.
    pub fn get_or_create(&self, chat_id: i64) -> ChatSession {
        let now = Utc::now();
        let mut entry = self.sessions.entry(chat_id).or_insert_with(|| {
            tracing::debug!(chat_id, "Creating chat session");
            ChatSession {
                chat_id,
                session_key: self.defaults.session_key(chat_id),
                remote_session_id: None,
                current_agent: self.defaults.agent.clone(),
                working_directory: self.defaults.working_directory.clone(),
                last_user_message: None,
                created_at: now,
                last_activity: now,
            }
        });
        entry.last_activity = now;
        entry.clone()
    }

    /// Snapshot without creating or touching the entry
    pub fn get(&self, chat_id: i64) -> Option<ChatSession> {
        self.sessions.get(&chat_id).map(|s| s.clone())
    }

    /// Mutate a chat's state in place; returns false if the chat is unknown
    pub fn update<F>(&self, chat_id: i64, f: F) -> bool
    where
        F: FnOnce(&mut ChatSession),
    {
        match self.sessions.get_mut(&chat_id) {
            Some(mut session) => {
                f(&mut session);
                true
            }
            None => false,
        }
    }

    /// Remove chats idle for longer than `max_age`
    ///
    /// Chats with an invocation in flight are kept regardless of age.
    pub fn sweep_idle(&self, max_age: Duration) -> usize {
        self.sweep_idle_at(Utc::now(), max_age)
    }

    fn sweep_idle_at(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let before = self.sessions.len();
        self.sessions.retain(|chat_id, session| {
            now.signed_duration_since(session.last_activity) <= max_age
                || self.in_flight.contains_key(chat_id)
        });
        let removed = before.saturating_sub(self.sessions.len());

        if removed > 0 {
            tracing::info!(removed, "Cleared inactive chat sessions");
        }
        removed
    }

    /// Mark the chat busy, or `None` if it already is
    pub fn try_begin(&self, chat_id: i64) -> Option<InFlightGuard> {
        match self.in_flight.entry(chat_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(InFlightGuard {
                    chat_id,
                    in_flight: Arc::clone(&self.in_flight),
                })
            }
        }
    }

    pub fn is_in_flight(&self, chat_id: i64) -> bool {
        self.in_flight.contains_key(&chat_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshots of every chat
    pub fn sessions(&self) -> Vec<ChatSession> {
        self.sessions.iter().map(|r| r.value().clone()).collect()
    }
}
