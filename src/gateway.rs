//! Session-tree gateway
//!
//! Resolves a chat to a concrete remote root session and manages the tree
//! of sessions hanging off it. Ownership is decided purely by title prefix:
//! a remote root session belongs to a chat when its title starts with the
//! chat's `session_key`. That test is a heuristic. `telegram-4` also claims
//! `telegram-42-1700000000`, and any unrelated session whose title happens
//! to share the prefix is treated as the chat's own.

use crate::error::{RelayError, Result};
use crate::registry::ChatSession;
use crate::remote::{ListFilter, RemoteSession, ServerHealth, SessionService};
use reqwest::Url;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Pause between deletions during a group reset
pub const DEFAULT_DELETE_PAUSE: Duration = Duration::from_millis(100);

/// Reply used when the agent produced no text parts
pub const EMPTY_REPLY: &str = "[No text response from agent]";

/// Outcome of [`SessionTreeGateway::reset_group`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupReset {
    pub deleted_count: usize,
    pub root_session_id: Option<String>,
    pub new_session_id: String,
}

/// Outcome of [`SessionTreeGateway::reset_child`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildReset {
    pub deleted_session_id: String,
    pub parent_session_id: String,
}

/// Connectivity probe result
#[derive(Debug, Clone)]
pub struct Probe {
    pub config: serde_json::Value,
    pub health: ServerHealth,
}

struct Node {
    id: String,
    children: Vec<usize>,
}

/// Post-order over an arena rooted at index 0; each node appears once
fn deletion_order(arena: &[Node]) -> Vec<usize> {
    if arena.is_empty() {
        return Vec::new();
    }
    let mut visited = vec![false; arena.len()];
    let mut order = Vec::with_capacity(arena.len());
    let mut stack = vec![(0usize, 0usize)];
    visited[0] = true;

    while let Some(top) = stack.len().checked_sub(1) {
        let (node, cursor) = stack[top];
        match arena[node].children.get(cursor) {
            Some(&child) => {
                stack[top].1 += 1;
                if !visited[child] {
                    visited[child] = true;
                    stack.push((child, 0));
                }
            }
            None => {
                order.push(node);
                stack.pop();
            }
        }
    }
    order
}

pub struct SessionTreeGateway {
    service: Arc<dyn SessionService>,
    default_directory: String,
    web_url: String,
    delete_pause: Duration,
}

impl SessionTreeGateway {
    pub fn new(
        service: Arc<dyn SessionService>,
        default_directory: impl Into<String>,
        web_url: impl Into<String>,
    ) -> Self {
        Self {
            service,
            default_directory: default_directory.into(),
            web_url: web_url.into().trim_end_matches('/').to_string(),
            delete_pause: DEFAULT_DELETE_PAUSE,
        }
    }

    pub fn with_delete_pause(mut self, pause: Duration) -> Self {
        self.delete_pause = pause;
        self
    }

    pub fn service(&self) -> &Arc<dyn SessionService> {
        &self.service
    }

    pub fn web_url(&self) -> &str {
        &self.web_url
    }

    /// Bind the chat to a remote session, finding or creating one
    pub async fn ensure_session(&self, chat: &mut ChatSession) -> Result<String> {
        if let Some(id) = &chat.remote_session_id {
            return Ok(id.clone());
        }

        let candidates = self
            .service
            .list_sessions(
                &chat.working_directory,
                &ListFilter::roots().search(chat.session_key.clone()),
            )
            .await?;

        let owned = candidates
            .into_iter()
            .filter(|s| Self::owned_by(s, chat))
            .max_by_key(|s| s.time.updated);

        let id = match owned {
            Some(session) => {
                tracing::info!(chat_id = chat.chat_id, session_id = %session.id, "Reusing remote session");
                session.id
            }
            None => {
                let created = self
                    .service
                    .create_session(&chat.working_directory, Some(&chat.session_key))
                    .await?;
                tracing::info!(chat_id = chat.chat_id, session_id = %created.id, "Created remote session");
                created.id
            }
        };

        chat.remote_session_id = Some(id.clone());
        Ok(id)
    }

    fn owned_by(session: &RemoteSession, chat: &ChatSession) -> bool {
        session.is_root()
            && session
                .title
                .as_deref()
                .is_some_and(|t| t.starts_with(&chat.session_key))
    }

    /// Root sessions owned by the chat, in server order
    pub async fn list_for_chat(&self, chat: &ChatSession) -> Result<Vec<RemoteSession>> {
        let sessions = self
            .service
            .list_sessions(
                &chat.working_directory,
                &ListFilter::roots().search(chat.session_key.clone()),
            )
            .await?;
        Ok(sessions
            .into_iter()
            .filter(|s| Self::owned_by(s, chat))
            .collect())
    }

    /// Root sessions owned by the chat, most recently updated first
    pub async fn list_for_chat_by_recency(&self, chat: &ChatSession) -> Result<Vec<RemoteSession>> {
        let mut sessions = self.list_for_chat(chat).await?;
        sessions.sort_by(|a, b| b.time.updated.cmp(&a.time.updated));
        Ok(sessions)
    }

    /// Create a fresh root session and bind the chat to it
    pub async fn create_new(&self, chat: &mut ChatSession) -> Result<RemoteSession> {
        let title = format!("{}-{}", chat.session_key, chrono::Utc::now().timestamp());
        let created = self
            .service
            .create_session(&chat.working_directory, Some(&title))
            .await?;
        chat.remote_session_id = Some(created.id.clone());
        tracing::info!(chat_id = chat.chat_id, session_id = %created.id, "Started new remote session");
        Ok(created)
    }

    /// Bind the chat to the `index`-th (1-based) session by recency
    pub async fn switch_to(&self, chat: &mut ChatSession, index: usize) -> Result<RemoteSession> {
        let sessions = self.list_for_chat_by_recency(chat).await?;
        let total = sessions.len();
        let target = index
            .checked_sub(1)
            .and_then(|i| sessions.into_iter().nth(i))
            .ok_or_else(|| {
                RelayError::InvalidSelection(if total == 0 {
                    format!("session {index} does not exist; no sessions yet")
                } else {
                    format!("session {index} does not exist; choose 1-{total}")
                })
            })?;

        chat.remote_session_id = Some(target.id.clone());
        tracing::info!(chat_id = chat.chat_id, session_id = %target.id, "Switched remote session");
        Ok(target)
    }

    /// Delete the whole tree the current session belongs to and start over
    pub async fn reset_group(&self, chat: &mut ChatSession) -> Result<GroupReset> {
        let current = self.ensure_session(chat).await?;
        let dir = chat.working_directory.clone();

        let mut deleted_count = 0;
        let root_session_id = match self.find_root(&dir, &current).await {
            Ok(root) => {
                let order = self.collect_tree(&dir, &root).await?;
                for (i, id) in order.iter().enumerate() {
                    if i > 0 && !self.delete_pause.is_zero() {
                        tokio::time::sleep(self.delete_pause).await;
                    }
                    match self.service.delete_session(&dir, id).await {
                        Ok(()) => deleted_count += 1,
                        Err(e) => {
                            tracing::warn!(session_id = %id, "Session delete failed (ignored): {}", e)
                        }
                    }
                }
                Some(root)
            }
            Err(RelayError::SessionNotFound(id)) => {
                tracing::warn!(session_id = %id, "Current session is gone; nothing to delete");
                None
            }
            Err(e) => return Err(e),
        };

        let created = self
            .service
            .create_session(&dir, Some(&chat.session_key))
            .await?;
        chat.remote_session_id = Some(created.id.clone());

        tracing::info!(
            chat_id = chat.chat_id,
            deleted_count,
            new_session_id = %created.id,
            "Session group reset"
        );

        Ok(GroupReset {
            deleted_count,
            root_session_id,
            new_session_id: created.id,
        })
    }

    /// Follow `parent_id` links to the top of the tree
    async fn find_root(&self, dir: &str, session_id: &str) -> Result<String> {
        let mut seen = HashSet::new();
        let mut current = self.service.get_session(dir, session_id).await?;
        while let Some(parent) = current.parent_id.take() {
            if !seen.insert(current.id.clone()) {
                tracing::warn!(session_id = %current.id, "Parent chain loops; stopping walk");
                break;
            }
            current = self.service.get_session(dir, &parent).await?;
        }
        Ok(current.id)
    }

    /// Fetch the subtree under `root` and return ids children-first
    async fn collect_tree(&self, dir: &str, root: &str) -> Result<Vec<String>> {
        let mut arena = vec![Node {
            id: root.to_string(),
            children: Vec::new(),
        }];
        let mut index: HashMap<String, usize> = HashMap::from([(root.to_string(), 0)]);
        let mut queue = VecDeque::from([0usize]);

        while let Some(i) = queue.pop_front() {
            let children = self.service.list_children(dir, &arena[i].id).await?;
            for child in children {
                let j = match index.get(&child.id) {
                    Some(&j) => j,
                    None => {
                        let j = arena.len();
                        index.insert(child.id.clone(), j);
                        arena.push(Node {
                            id: child.id,
                            children: Vec::new(),
                        });
                        queue.push_back(j);
                        j
                    }
                };
                if j != i && !arena[i].children.contains(&j) {
                    arena[i].children.push(j);
                }
            }
        }

        Ok(deletion_order(&arena)
            .into_iter()
            .map(|i| arena[i].id.clone())
            .collect())
    }

    /// Delete only the current child session and fall back to its parent
    pub async fn reset_child(&self, chat: &mut ChatSession) -> Result<ChildReset> {
        let current = chat
            .remote_session_id
            .clone()
            .ok_or(RelayError::NoActiveSession)?;
        let info = self
            .service
            .get_session(&chat.working_directory, &current)
            .await?;
        let parent = info
            .parent_id
            .ok_or_else(|| RelayError::RootSession(current.clone()))?;

        self.service
            .delete_session(&chat.working_directory, &current)
            .await?;
        chat.remote_session_id = Some(parent.clone());

        Ok(ChildReset {
            deleted_session_id: current,
            parent_session_id: parent,
        })
    }

    /// Send `text` to the chat's session as `agent` and join the text reply
    ///
    /// A bound session that no longer exists is dropped and resolved again
    /// once.
    pub async fn prompt(&self, chat: &mut ChatSession, text: &str, agent: &str) -> Result<String> {
        let message = if chat.working_directory != self.default_directory {
            format!("[Working in: {}]\n\n{}", chat.working_directory, text)
        } else {
            text.to_string()
        };

        let session_id = self.ensure_session(chat).await?;
        let parts = match self
            .service
            .prompt(&chat.working_directory, &session_id, &message, Some(agent))
            .await
        {
            Err(RelayError::SessionNotFound(stale)) => {
                tracing::warn!(chat_id = chat.chat_id, session_id = %stale, "Bound session vanished; resolving again");
                chat.remote_session_id = None;
                let session_id = self.ensure_session(chat).await?;
                self.service
                    .prompt(&chat.working_directory, &session_id, &message, Some(agent))
                    .await?
            }
            other => other?,
        };

        let texts: Vec<&str> = parts.iter().filter_map(|p| p.as_text()).collect();
        if texts.is_empty() {
            return Ok(EMPTY_REPLY.to_string());
        }
        Ok(texts.join("\n"))
    }

    /// Web UI link for a session
    pub fn session_web_url(&self, session_id: &str, project_id: Option<&str>) -> String {
        let project = project_id.filter(|p| !p.is_empty()).unwrap_or("global");
        match Url::parse(&self.web_url) {
            Ok(mut url) if !url.cannot_be_a_base() => {
                if let Ok(mut path) = url.path_segments_mut() {
                    path.pop_if_empty().extend([project, "session", session_id]);
                }
                url.to_string()
            }
            _ => format!("{}/{}/session/{}", self.web_url, project, session_id),
        }
    }

    /// Check the remote service answers config and health requests
    pub async fn probe(&self) -> Result<Probe> {
        let config = self.service.config(&self.default_directory).await?;
        let health = self.service.health().await?;
        if !health.healthy {
            return Err(RelayError::remote("Global health check", "server reports unhealthy"));
        }
        Ok(Probe { config, health })
    }
}
