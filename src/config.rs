//! Relay configuration
//!
//! Loaded from HCL (or JSON, detected by a leading `{`) and then overlaid
//! with environment variables. A relay with no config file at all still
//! runs when `TELEGRAM_BOT_TOKEN` is set.

use crate::error::{RelayError, Result};
use crate::registry::SessionDefaults;
use crate::transport::InlineKeyboardButton;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the current directory
pub const LOCAL_CONFIG_FILE: &str = "relay.hcl";

/// Main relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub telegram: TelegramConfig,
    pub remote: RemoteConfig,
    pub agent: AgentConfig,
    pub notifier: NotifierConfig,
    pub session: SessionConfig,
    pub render: RenderConfig,
    pub status: StatusConfig,
    pub keyboard: KeyboardConfig,

    /// How long `stop()` waits for in-flight work after polling ends
    pub shutdown_grace_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            remote: RemoteConfig::default(),
            agent: AgentConfig::default(),
            notifier: NotifierConfig::default(),
            session: SessionConfig::default(),
            render: RenderConfig::default(),
            status: StatusConfig::default(),
            keyboard: KeyboardConfig::default(),
            shutdown_grace_ms: 2000,
        }
    }
}

/// Telegram Bot API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Bot token, or the name of an environment variable holding it
    pub bot_token: String,

    /// Telegram user ids allowed to talk to the bot; `"*"` admits everyone
    pub allowed_users: Vec<String>,

    /// Server-side long-poll wait for `getUpdates`
    pub poll_timeout_secs: u64,

    /// Added to the long-poll wait to get the client request timeout
    pub request_margin_secs: u64,

    /// Pause after a non-timeout polling failure
    pub retry_backoff_ms: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            allowed_users: Vec::new(),
            poll_timeout_secs: 30,
            request_margin_secs: 5,
            retry_backoff_ms: 1000,
        }
    }
}

/// Remote agent-session service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,

    /// Web UI root used for session links; defaults to `base_url`
    pub web_url: Option<String>,

    /// Upper bound for a single request, prompts included
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4096".to_string(),
            web_url: None,
            request_timeout_secs: 300,
        }
    }
}

impl RemoteConfig {
    pub fn web_url(&self) -> &str {
        self.web_url.as_deref().unwrap_or(&self.base_url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub default_agent: String,

    /// Names accepted as `/<persona> message` overrides and `agent:` buttons
    pub personas: Vec<String>,

    pub working_directory: String,

    /// Prefix of every session title owned by a chat
    pub session_prefix: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let working_directory = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
            .to_string_lossy()
            .to_string();
        Self {
            default_agent: "sisyphus".to_string(),
            personas: ["sisyphus", "oracle", "prometheus", "librarian", "metis"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            working_directory,
            session_prefix: "telegram".to_string(),
        }
    }
}

/// Pending permission/question surfacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Chats idle longer than this are forgotten
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 3600,
            sweep_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub max_message_bytes: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: crate::render::DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// The `/start` menu
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyboardConfig {
    pub enabled: bool,

    /// Custom rows; the built-in persona/action grid is used when unset
    pub rows: Option<Vec<Vec<InlineKeyboardButton>>>,
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rows: None,
        }
    }
}

impl RelayConfig {
    /// Parse configuration from an HCL string, or JSON when it starts with `{`
    pub fn from_hcl(content: &str) -> anyhow::Result<Self> {
        if content.trim_start().starts_with('{') {
            let config: RelayConfig = serde_json::from_str(content)
                .map_err(|e| anyhow::anyhow!("Failed to parse JSON config: {}", e))?;
            return Ok(config);
        }
        let config: RelayConfig = hcl::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse relay config: {}", e))?;
        Ok(config)
    }

    /// Overlay environment variables read through `lookup`
    ///
    /// Recognised: `TELEGRAM_BOT_TOKEN`, `ALLOWED_USERS` (comma list),
    /// `DEFAULT_AGENT`, `WORKING_DIRECTORY`, `SESSION_PREFIX`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(token) = non_empty("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(users) = non_empty("ALLOWED_USERS") {
            self.telegram.allowed_users = users
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(agent) = non_empty("DEFAULT_AGENT") {
            self.agent.default_agent = agent;
        }
        if let Some(dir) = non_empty("WORKING_DIRECTORY") {
            self.agent.working_directory = dir;
        }
        if let Some(prefix) = non_empty("SESSION_PREFIX") {
            self.agent.session_prefix = prefix;
        }
    }

    /// Bot token with environment-variable indirection resolved
    pub fn bot_token(&self) -> Result<String> {
        resolve_credential(&self.telegram.bot_token)
    }

    /// Check the values the relay cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(RelayError::Config(
                "telegram.bot_token is required (or set TELEGRAM_BOT_TOKEN)".to_string(),
            ));
        }
        let max = self.render.max_message_bytes;
        if !(64..=4096).contains(&max) {
            return Err(RelayError::Config(format!(
                "render.max_message_bytes must be between 64 and 4096, got {}",
                max
            )));
        }
        if !self.agent.personas.contains(&self.agent.default_agent) {
            return Err(RelayError::Config(format!(
                "agent.default_agent '{}' is not one of the configured personas",
                self.agent.default_agent
            )));
        }
        if self.agent.session_prefix.trim().is_empty() {
            return Err(RelayError::Config(
                "agent.session_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// `"*"` or an empty allow-list admits everyone
    pub fn is_user_allowed(&self, user_id: i64) -> bool {
        let users = &self.telegram.allowed_users;
        users.is_empty()
            || users
                .iter()
                .any(|u| u == "*" || u.trim() == user_id.to_string())
    }

    pub fn session_defaults(&self) -> SessionDefaults {
        SessionDefaults {
            agent: self.agent.default_agent.clone(),
            working_directory: self.agent.working_directory.clone(),
            session_prefix: self.agent.session_prefix.clone(),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.telegram.poll_timeout_secs)
    }

    pub fn request_margin(&self) -> Duration {
        Duration::from_secs(self.telegram.request_margin_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.telegram.retry_backoff_ms)
    }

    pub fn notifier_interval(&self) -> Duration {
        Duration::from_millis(self.notifier.poll_interval_ms.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session.sweep_interval_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Copy safe to print; the token is masked
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.telegram.bot_token.is_empty() {
            copy.telegram.bot_token = "***".to_string();
        }
        copy
    }
}

/// Resolve a credential reference
///
/// Tries the value as an environment variable name (as given, then
/// upper-cased) and falls back to treating it as the literal credential.
pub fn resolve_credential(credential_ref: &str) -> Result<String> {
    if let Ok(val) =
        std::env::var(credential_ref).or_else(|_| std::env::var(credential_ref.to_uppercase()))
    {
        return Ok(val);
    }
    if !credential_ref.is_empty() {
        return Ok(credential_ref.to_string());
    }
    Err(RelayError::Config(
        "Failed to resolve credential: empty reference".to_string(),
    ))
}

fn read_config(path: &Path) -> anyhow::Result<RelayConfig> {
    let content = std::fs::read_to_string(path)?;
    tracing::info!("Loading config from {}", path.display());
    RelayConfig::from_hcl(&content).map_err(|e| anyhow::anyhow!("Config parse error: {e}"))
}

/// Load configuration using the standard priority chain.
///
/// Priority: explicit path > `./relay.hcl` > `~/.config/a3s-relay/config.hcl`
///           > default. Environment overrides are applied last in every case.
pub fn load_config(explicit_path: Option<&PathBuf>) -> anyhow::Result<(RelayConfig, Option<PathBuf>)> {
    let (mut config, config_path) = if let Some(path) = explicit_path {
        (read_config(path)?, Some(path.clone()))
    } else if Path::new(LOCAL_CONFIG_FILE).exists() {
        let path = PathBuf::from(LOCAL_CONFIG_FILE);
        (read_config(&path)?, Some(path))
    } else if let Some(hcl_path) = dirs_next::config_dir()
        .map(|dir| dir.join("a3s-relay/config.hcl"))
        .filter(|p| p.exists())
    {
        (read_config(&hcl_path)?, Some(hcl_path))
    } else {
        tracing::info!("No config found, using defaults");
        (RelayConfig::default(), None)
    };

    config.apply_env(|name| std::env::var(name).ok());
    Ok((config, config_path))
}
