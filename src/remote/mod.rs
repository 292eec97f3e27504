//! Remote agent-session service: the capability trait the relay drives
//!
//! The service is an opencode-compatible REST server. Historically two client
//! shapes were used side by side for different calls; here they collapse into
//! one `SessionService` trait carrying the union of the operations the relay
//! needs. Every call is scoped to a working directory.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod http;
pub mod memory;

pub use http::HttpSessionService;
pub use memory::{MemorySessionService, RemoteCall};

/// Session timestamps in milliseconds since the epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
}

/// A session as reported by the remote service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSession {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "parentID", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, rename = "projectID", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default)]
    pub time: SessionTime,
}

impl RemoteSession {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn title_or_untitled(&self) -> &str {
        self.title.as_deref().filter(|t| !t.is_empty()).unwrap_or("Untitled")
    }
}

/// Filters for listing sessions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Only sessions without a parent
    pub roots: bool,
    /// Full-text title search
    pub search: Option<String>,
    pub limit: Option<usize>,
}

impl ListFilter {
    pub fn roots() -> Self {
        Self {
            roots: true,
            ..Default::default()
        }
    }

    pub fn search(mut self, term: impl Into<String>) -> Self {
        self.search = Some(term.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Tool call a pending request is attached to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRef {
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "callID")]
    pub call_id: String,
}

/// A permission the agent is waiting on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPermission {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub permission: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub always: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionInfo {
    #[serde(default)]
    pub header: String,
    pub question: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multiple: bool,
}

/// A multi-question form the agent is waiting on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingQuestionRequest {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub questions: Vec<QuestionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolRef>,
}

/// Decision sent back for a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionReply {
    Once,
    Always,
    Reject,
}

impl PermissionReply {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Always => "always",
            Self::Reject => "reject",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "once" => Some(Self::Once),
            "always" => Some(Self::Always),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// One part of an assistant reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
        }
    }

    /// Text content if this is a non-empty text part
    pub fn as_text(&self) -> Option<&str> {
        if self.kind == "text" {
            self.text.as_deref().filter(|t| !t.is_empty())
        } else {
            None
        }
    }
}

/// Result of the global health probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHealth {
    pub healthy: bool,
    #[serde(default)]
    pub version: String,
}

/// Capability interface over the remote agent-session service
///
/// `dir` is the working directory the call is scoped to.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// List sessions matching the filter, in server order
    async fn list_sessions(&self, dir: &str, filter: &ListFilter) -> Result<Vec<RemoteSession>>;

    /// Fetch one session
    async fn get_session(&self, dir: &str, id: &str) -> Result<RemoteSession>;

    /// Create a root session with an optional title
    async fn create_session(&self, dir: &str, title: Option<&str>) -> Result<RemoteSession>;

    /// Direct children of a session
    async fn list_children(&self, dir: &str, id: &str) -> Result<Vec<RemoteSession>>;

    /// Delete one session
    async fn delete_session(&self, dir: &str, id: &str) -> Result<()>;

    /// Send a text prompt and wait for the assistant reply
    async fn prompt(
        &self,
        dir: &str,
        session_id: &str,
        text: &str,
        agent: Option<&str>,
    ) -> Result<Vec<MessagePart>>;

    /// Permissions awaiting a decision
    async fn list_permissions(&self, dir: &str) -> Result<Vec<PendingPermission>>;

    /// Answer a permission request
    async fn reply_permission(
        &self,
        dir: &str,
        request_id: &str,
        reply: PermissionReply,
        message: Option<&str>,
    ) -> Result<()>;

    /// Question forms awaiting answers
    async fn list_questions(&self, dir: &str) -> Result<Vec<PendingQuestionRequest>>;

    /// Submit one answer list per question
    async fn reply_question(&self, dir: &str, request_id: &str, answers: &[Vec<String>])
        -> Result<()>;

    /// Dismiss a question form without answering
    async fn reject_question(&self, dir: &str, request_id: &str) -> Result<()>;

    /// Server configuration (connectivity probe)
    async fn config(&self, dir: &str) -> Result<serde_json::Value>;

    /// Global health probe
    async fn health(&self) -> Result<ServerHealth>;
}
