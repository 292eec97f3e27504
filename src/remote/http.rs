//! HTTP client for an opencode-compatible session server

use super::{
    ListFilter, MessagePart, PendingPermission, PendingQuestionRequest, PermissionReply,
    RemoteSession, ServerHealth, SessionService,
};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// Longest server error text carried into a user-facing message
const MAX_ERROR_CHARS: usize = 200;

#[derive(Deserialize)]
struct PromptResponse {
    #[serde(default)]
    parts: Vec<MessagePart>,
}

/// `SessionService` over REST
pub struct HttpSessionService {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpSessionService {
    /// Create a client for `base_url` with a per-request timeout
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| RelayError::Config(format!("Invalid remote base_url '{}': {}", base_url, e)))?;
        if parsed.cannot_be_a_base() {
            return Err(RelayError::Config(format!(
                "Remote base_url '{}' cannot carry a path",
                base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: parsed,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Append percent-encoded path segments to the base URL
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Turn a non-2xx response into a `Remote` error for `operation`
    async fn check(operation: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RelayError::remote(
            operation,
            format!("HTTP {}: {}", status.as_u16(), error_message(&body)),
        ))
    }

    async fn send(&self, operation: &str, request: reqwest::RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| RelayError::remote(operation, e))?;
        Self::check(operation, response).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        self.send(operation, request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| RelayError::remote(operation, format!("invalid response body: {}", e)))
    }
}

/// Pull a readable message out of an error body
fn error_message(body: &str) -> String {
    let from_json = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            [
                v.pointer("/data/message"),
                v.get("message"),
                v.get("error"),
                v.pointer("/errors/0/message"),
            ]
            .into_iter()
            .flatten()
            .find_map(|m| m.as_str().map(str::to_string))
        });

    let message = from_json.unwrap_or_else(|| body.trim().to_string());
    if message.is_empty() {
        return "empty response".to_string();
    }
    if message.chars().count() > MAX_ERROR_CHARS {
        let mut cut: String = message.chars().take(MAX_ERROR_CHARS).collect();
        cut.push('…');
        cut
    } else {
        message
    }
}

#[async_trait]
impl SessionService for HttpSessionService {
    async fn list_sessions(&self, dir: &str, filter: &ListFilter) -> Result<Vec<RemoteSession>> {
        let mut query: Vec<(&str, String)> = vec![("directory", dir.to_string())];
        if filter.roots {
            query.push(("roots", "true".to_string()));
        }
        if let Some(search) = &filter.search {
            query.push(("search", search.clone()));
        }
        if let Some(limit) = filter.limit {
            query.push(("limit", limit.to_string()));
        }

        let request = self.client.get(self.url(&["session"])).query(&query);
        self.call("Session list", request).await
    }

    async fn get_session(&self, dir: &str, id: &str) -> Result<RemoteSession> {
        let response = self
            .client
            .get(self.url(&["session", id]))
            .query(&[("directory", dir)])
            .send()
            .await
            .map_err(|e| RelayError::remote("Session get", e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RelayError::SessionNotFound(id.to_string()));
        }
        Self::check("Session get", response)
            .await?
            .json()
            .await
            .map_err(|e| RelayError::remote("Session get", format!("invalid response body: {}", e)))
    }

    async fn create_session(&self, dir: &str, title: Option<&str>) -> Result<RemoteSession> {
        let body = match title {
            Some(title) => serde_json::json!({ "title": title }),
            None => serde_json::json!({}),
        };
        let request = self
            .client
            .post(self.url(&["session"]))
            .query(&[("directory", dir)])
            .json(&body);
        self.call("Session creation", request).await
    }

    async fn list_children(&self, dir: &str, id: &str) -> Result<Vec<RemoteSession>> {
        let request = self
            .client
            .get(self.url(&["session", id, "children"]))
            .query(&[("directory", dir)]);
        self.call("Session children", request).await
    }

    async fn delete_session(&self, dir: &str, id: &str) -> Result<()> {
        let request = self
            .client
            .delete(self.url(&["session", id]))
            .query(&[("directory", dir)]);
        self.send("Session delete", request).await?;
        Ok(())
    }

    async fn prompt(
        &self,
        dir: &str,
        session_id: &str,
        text: &str,
        agent: Option<&str>,
    ) -> Result<Vec<MessagePart>> {
        let mut body = serde_json::json!({
            "parts": [{ "type": "text", "text": text }],
        });
        if let Some(agent) = agent {
            body["agent"] = serde_json::Value::String(agent.to_string());
        }

        let request = self
            .client
            .post(self.url(&["session", session_id, "message"]))
            .query(&[("directory", dir)])
            .json(&body);
        let response: PromptResponse = self.call("Prompt", request).await?;
        Ok(response.parts)
    }

    async fn list_permissions(&self, dir: &str) -> Result<Vec<PendingPermission>> {
        let request = self
            .client
            .get(self.url(&["permission"]))
            .query(&[("directory", dir)]);
        self.call("Permission list", request).await
    }

    async fn reply_permission(
        &self,
        dir: &str,
        request_id: &str,
        reply: PermissionReply,
        message: Option<&str>,
    ) -> Result<()> {
        let mut body = serde_json::json!({ "reply": reply });
        if let Some(message) = message {
            body["message"] = serde_json::Value::String(message.to_string());
        }
        let request = self
            .client
            .post(self.url(&["permission", request_id, "reply"]))
            .query(&[("directory", dir)])
            .json(&body);
        self.send("Permission reply", request).await?;
        Ok(())
    }

    async fn list_questions(&self, dir: &str) -> Result<Vec<PendingQuestionRequest>> {
        let request = self
            .client
            .get(self.url(&["question"]))
            .query(&[("directory", dir)]);
        self.call("Question list", request).await
    }

    async fn reply_question(
        &self,
        dir: &str,
        request_id: &str,
        answers: &[Vec<String>],
    ) -> Result<()> {
        let request = self
            .client
            .post(self.url(&["question", request_id, "reply"]))
            .query(&[("directory", dir)])
            .json(&serde_json::json!({ "answers": answers }));
        self.send("Question reply", request).await?;
        Ok(())
    }

    async fn reject_question(&self, dir: &str, request_id: &str) -> Result<()> {
        let request = self
            .client
            .post(self.url(&["question", request_id, "reject"]))
            .query(&[("directory", dir)]);
        self.send("Question reject", request).await?;
        Ok(())
    }

    async fn config(&self, dir: &str) -> Result<serde_json::Value> {
        let request = self
            .client
            .get(self.url(&["config"]))
            .query(&[("directory", dir)]);
        self.call("Server connection", request).await
    }

    async fn health(&self) -> Result<ServerHealth> {
        let request = self.client.get(self.url(&["global", "health"]));
        self.call("Global health check", request).await
    }
}
