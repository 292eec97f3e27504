//! Inline-keyboard callback payloads
//!
//! Every button the relay renders carries a short tagged string of the form
//! `{kind}:{action}[:{id}[:{question}:{option}]]`. This module is the only
//! place that builds or parses those strings; the two must round-trip
//! exactly.

use crate::remote::PermissionReply;
use std::fmt;

/// Telegram rejects callback data longer than this
pub const MAX_CALLBACK_BYTES: usize = 64;

/// Menu actions reachable from the `/start` keyboard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    Help,
    Status,
    New,
    List,
    Reset,
    ResetChild,
}

impl MenuAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::Status => "status",
            Self::New => "new",
            Self::List => "list",
            Self::Reset => "reset",
            Self::ResetChild => "reset_child",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "help" => Some(Self::Help),
            "status" => Some(Self::Status),
            "new" => Some(Self::New),
            "list" => Some(Self::List),
            "reset" => Some(Self::Reset),
            "reset_child" => Some(Self::ResetChild),
            _ => None,
        }
    }
}

/// What a permission button asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionAction {
    /// Forward a decision to the remote service
    Reply(PermissionReply),
    /// Replay the chat's last message locally; nothing is sent upstream
    Retry,
}

impl PermissionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reply(reply) => reply.as_str(),
            Self::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retry" => Some(Self::Retry),
            other => PermissionReply::parse(other).map(Self::Reply),
        }
    }
}

/// Decoded callback payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackData {
    /// `agent:{name}`: switch persona
    Agent(String),
    /// `action:{menu}`: menu button
    Menu(MenuAction),
    /// `perm:{decision}:{request_id}`
    Permission {
        action: PermissionAction,
        request_id: String,
    },
    /// `q:ans:{request_id}:{question}:{option}`
    QuestionAnswer {
        request_id: String,
        question: usize,
        option: usize,
    },
    /// `q:rej:{request_id}`
    QuestionReject { request_id: String },
}

impl CallbackData {
    /// Parse a callback payload; unknown shapes yield `None`
    pub fn parse(data: &str) -> Option<Self> {
        let (kind, rest) = data.split_once(':')?;
        match kind {
            "agent" if !rest.is_empty() => Some(Self::Agent(rest.to_string())),
            "action" => MenuAction::parse(rest).map(Self::Menu),
            "perm" => {
                let (action, request_id) = rest.split_once(':')?;
                if request_id.is_empty() {
                    return None;
                }
                Some(Self::Permission {
                    action: PermissionAction::parse(action)?,
                    request_id: request_id.to_string(),
                })
            }
            "q" => {
                let (action, tail) = rest.split_once(':')?;
                match action {
                    "ans" => {
                        let mut parts = tail.rsplitn(3, ':');
                        let option = parts.next()?.parse().ok()?;
                        let question = parts.next()?.parse().ok()?;
                        let request_id = parts.next().filter(|id| !id.is_empty())?;
                        Some(Self::QuestionAnswer {
                            request_id: request_id.to_string(),
                            question,
                            option,
                        })
                    }
                    "rej" if !tail.is_empty() => Some(Self::QuestionReject {
                        request_id: tail.to_string(),
                    }),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Encode for use as `callback_data`
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CallbackData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(name) => write!(f, "agent:{name}"),
            Self::Menu(action) => write!(f, "action:{}", action.as_str()),
            Self::Permission { action, request_id } => {
                write!(f, "perm:{}:{request_id}", action.as_str())
            }
            Self::QuestionAnswer {
                request_id,
                question,
                option,
            } => write!(f, "q:ans:{request_id}:{question}:{option}"),
            Self::QuestionReject { request_id } => write!(f, "q:rej:{request_id}"),
        }
    }
}
