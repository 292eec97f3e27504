//! In-memory session service
//!
//! Keeps a flat list of sessions, pending permissions and pending questions
//! behind a lock, and records every call made against it. Useful for tests
//! and for running the relay without a backing server.

use super::{
    ListFilter, MessagePart, PendingPermission, PendingQuestionRequest, PermissionReply,
    RemoteSession, ServerHealth, SessionService, SessionTime,
};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// A call observed by [`MemorySessionService`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    List { search: Option<String> },
    Get(String),
    Create { title: Option<String> },
    Children(String),
    Delete(String),
    Prompt {
        session_id: String,
        text: String,
        agent: Option<String>,
    },
    ListPermissions,
    ReplyPermission {
        request_id: String,
        reply: PermissionReply,
    },
    ListQuestions,
    ReplyQuestion {
        request_id: String,
        answers: Vec<Vec<String>>,
    },
    RejectQuestion(String),
    Config,
    Health,
}

struct State {
    sessions: Vec<RemoteSession>,
    permissions: Vec<PendingPermission>,
    questions: Vec<PendingQuestionRequest>,
    calls: Vec<RemoteCall>,
    next_id: u64,
    clock: i64,
    reply: String,
    prompt_delay: Duration,
    failing_deletes: HashSet<String>,
    fail_pending_lists: bool,
    fail_replies: Option<String>,
    fail_prompts: Option<String>,
}

/// Session service backed by process memory
pub struct MemorySessionService {
    state: Mutex<State>,
}

impl Default for MemorySessionService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                sessions: Vec::new(),
                permissions: Vec::new(),
                questions: Vec::new(),
                calls: Vec::new(),
                next_id: 1,
                clock: 1_700_000_000_000,
                reply: "ok".to_string(),
                prompt_delay: Duration::ZERO,
                failing_deletes: HashSet::new(),
                fail_pending_lists: false,
                fail_replies: None,
                fail_prompts: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a session with an explicit id, parent and update time
    pub fn insert_session(&self, id: &str, title: &str, parent_id: Option<&str>, updated: i64) {
        let mut state = self.state();
        state.sessions.push(RemoteSession {
            id: id.to_string(),
            title: Some(title.to_string()),
            parent_id: parent_id.map(str::to_string),
            time: SessionTime {
                created: updated,
                updated,
            },
            ..Default::default()
        });
    }

    pub fn push_permission(&self, permission: PendingPermission) {
        self.state().permissions.push(permission);
    }

    pub fn push_question(&self, question: PendingQuestionRequest) {
        self.state().questions.push(question);
    }

    /// Text returned by every prompt; empty yields a reply with no parts
    pub fn set_reply(&self, reply: impl Into<String>) {
        self.state().reply = reply.into();
    }

    /// Delay every prompt by `delay` before answering
    pub fn set_prompt_delay(&self, delay: Duration) {
        self.state().prompt_delay = delay;
    }

    /// Make deleting `id` fail
    pub fn fail_delete(&self, id: &str) {
        self.state().failing_deletes.insert(id.to_string());
    }

    /// Make permission and question listing fail
    pub fn fail_pending_lists(&self, fail: bool) {
        self.state().fail_pending_lists = fail;
    }

    /// Make permission and question replies fail with `message`
    pub fn fail_replies(&self, message: impl Into<String>) {
        self.state().fail_replies = Some(message.into());
    }

    /// Make every prompt fail with `message`
    pub fn fail_prompts(&self, message: impl Into<String>) {
        self.state().fail_prompts = Some(message.into());
    }

    pub fn clear_reply_failure(&self) {
        self.state().fail_replies = None;
    }

    pub fn sessions(&self) -> Vec<RemoteSession> {
        self.state().sessions.clone()
    }

    pub fn session(&self, id: &str) -> Option<RemoteSession> {
        self.state().sessions.iter().find(|s| s.id == id).cloned()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    /// Ids passed to `delete_session`, in call order
    pub fn deletes(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                RemoteCall::Delete(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn prompt_count(&self) -> usize {
        self.count(|c| matches!(c, RemoteCall::Prompt { .. }))
    }

    pub fn count(&self, pred: impl Fn(&RemoteCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    fn reply_failure(state: &State, operation: &str) -> Result<()> {
        match &state.fail_replies {
            Some(message) => Err(RelayError::remote(operation, message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SessionService for MemorySessionService {
    async fn list_sessions(&self, _dir: &str, filter: &ListFilter) -> Result<Vec<RemoteSession>> {
        let mut state = self.state();
        state.calls.push(RemoteCall::List {
            search: filter.search.clone(),
        });

        let search = filter.search.as_deref().map(str::to_lowercase);
        let matches = state
            .sessions
            .iter()
            .filter(|s| !filter.roots || s.is_root())
            .filter(|s| match &search {
                Some(term) => s
                    .title
                    .as_deref()
                    .is_some_and(|t| t.to_lowercase().contains(term.as_str())),
                None => true,
            })
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(matches)
    }

    async fn get_session(&self, _dir: &str, id: &str) -> Result<RemoteSession> {
        let mut state = self.state();
        state.calls.push(RemoteCall::Get(id.to_string()));
        state
            .sessions
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| RelayError::SessionNotFound(id.to_string()))
    }

    async fn create_session(&self, dir: &str, title: Option<&str>) -> Result<RemoteSession> {
        let mut state = self.state();
        state.calls.push(RemoteCall::Create {
            title: title.map(str::to_string),
        });

        let id = format!("ses_mem_{:04}", state.next_id);
        state.next_id += 1;
        state.clock += 1;
        let session = RemoteSession {
            id,
            title: title.map(str::to_string),
            directory: Some(dir.to_string()),
            time: SessionTime {
                created: state.clock,
                updated: state.clock,
            },
            ..Default::default()
        };
        state.sessions.push(session.clone());
        Ok(session)
    }

    async fn list_children(&self, _dir: &str, id: &str) -> Result<Vec<RemoteSession>> {
        let mut state = self.state();
        state.calls.push(RemoteCall::Children(id.to_string()));
        Ok(state
            .sessions
            .iter()
            .filter(|s| s.parent_id.as_deref() == Some(id))
            .cloned()
            .collect())
    }

    async fn delete_session(&self, _dir: &str, id: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(RemoteCall::Delete(id.to_string()));
        if state.failing_deletes.contains(id) {
            return Err(RelayError::remote("Session delete", "HTTP 500: injected"));
        }
        let before = state.sessions.len();
        state.sessions.retain(|s| s.id != id);
        if state.sessions.len() == before {
            return Err(RelayError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn prompt(
        &self,
        _dir: &str,
        session_id: &str,
        text: &str,
        agent: Option<&str>,
    ) -> Result<Vec<MessagePart>> {
        let delay = {
            let mut state = self.state();
            state.calls.push(RemoteCall::Prompt {
                session_id: session_id.to_string(),
                text: text.to_string(),
                agent: agent.map(str::to_string),
            });
            if !state.sessions.iter().any(|s| s.id == session_id) {
                return Err(RelayError::SessionNotFound(session_id.to_string()));
            }
            if let Some(message) = &state.fail_prompts {
                return Err(RelayError::remote("Prompt", message));
            }
            state.prompt_delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.clock += 1;
        let now = state.clock;
        if let Some(session) = state.sessions.iter_mut().find(|s| s.id == session_id) {
            session.time.updated = now;
        }
        if state.reply.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(vec![MessagePart::text(state.reply.clone())])
        }
    }

    async fn list_permissions(&self, _dir: &str) -> Result<Vec<PendingPermission>> {
        let mut state = self.state();
        state.calls.push(RemoteCall::ListPermissions);
        if state.fail_pending_lists {
            return Err(RelayError::remote("Permission list", "unavailable"));
        }
        Ok(state.permissions.clone())
    }

    async fn reply_permission(
        &self,
        _dir: &str,
        request_id: &str,
        reply: PermissionReply,
        _message: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state();
        state.calls.push(RemoteCall::ReplyPermission {
            request_id: request_id.to_string(),
            reply,
        });
        Self::reply_failure(&state, "Permission reply")?;
        state.permissions.retain(|p| p.id != request_id);
        Ok(())
    }

    async fn list_questions(&self, _dir: &str) -> Result<Vec<PendingQuestionRequest>> {
        let mut state = self.state();
        state.calls.push(RemoteCall::ListQuestions);
        if state.fail_pending_lists {
            return Err(RelayError::remote("Question list", "unavailable"));
        }
        Ok(state.questions.clone())
    }

    async fn reply_question(
        &self,
        _dir: &str,
        request_id: &str,
        answers: &[Vec<String>],
    ) -> Result<()> {
        let mut state = self.state();
        state.calls.push(RemoteCall::ReplyQuestion {
            request_id: request_id.to_string(),
            answers: answers.to_vec(),
        });
        Self::reply_failure(&state, "Question reply")?;
        state.questions.retain(|q| q.id != request_id);
        Ok(())
    }

    async fn reject_question(&self, _dir: &str, request_id: &str) -> Result<()> {
        let mut state = self.state();
        state
            .calls
            .push(RemoteCall::RejectQuestion(request_id.to_string()));
        Self::reply_failure(&state, "Question reject")?;
        state.questions.retain(|q| q.id != request_id);
        Ok(())
    }

    async fn config(&self, _dir: &str) -> Result<serde_json::Value> {
        self.state().calls.push(RemoteCall::Config);
        Ok(serde_json::json!({}))
    }

    async fn health(&self) -> Result<ServerHealth> {
        self.state().calls.push(RemoteCall::Health);
        Ok(ServerHealth {
            healthy: true,
            version: "memory".to_string(),
        })
    }
}
