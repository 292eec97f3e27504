//! Update dispatch
//!
//! Turns Telegram updates into registry, gateway and notifier calls. Slash
//! commands are answered inline; prompts run on their own task so the
//! poller can move on to the next update while the agent works.

use crate::callback::{CallbackData, MenuAction, PermissionAction};
use crate::command::{self, Command, Inbound};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::gateway::SessionTreeGateway;
use crate::notifier::InteractionNotifier;
use crate::poller::UpdateHandler;
use crate::registry::{ChatSession, InFlightGuard, SessionRegistry};
use crate::remote::{RemoteSession, SessionService};
use crate::render::{escape_html, Renderer};
use crate::status::StatusMessage;
use crate::transport::{
    CallbackQuery, ChatTransport, InlineKeyboardButton, InlineKeyboardMarkup, Message,
    SendOptions, Update,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const UNAUTHORIZED_REPLY: &str = "⛔ You are not authorized to use this bot.";
pub const BUSY_REPLY: &str =
    "⏳ Still working on your previous message. Please wait for it to finish.";
pub const EMPTY_MESSAGE_REPLY: &str = "⚠️ Please provide a message.";
pub const SWITCH_USAGE: &str = "⚠️ Usage: /switch <number>\n\nUse /list to see available sessions.";

/// Format seconds as `1h 2m 3s`, `2m 3s` or `3s`
pub fn format_uptime(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn format_millis(millis: i64) -> String {
    if millis <= 0 {
        return "Unknown".to_string();
    }
    DateTime::from_timestamp_millis(millis)
        .map(format_time)
        .unwrap_or_else(|| "Unknown".to_string())
}

fn persona_blurb(name: &str) -> Option<&'static str> {
    match name {
        "sisyphus" => Some("Coding agent"),
        "oracle" => Some("Debugging/architecture"),
        "prometheus" => Some("Planning"),
        "librarian" => Some("Documentation"),
        "metis" => Some("Pre-planning consultant"),
        _ => None,
    }
}

fn persona_face(name: &str) -> String {
    let icon = match name {
        "sisyphus" => "🤖",
        "oracle" => "🔮",
        "prometheus" => "📋",
        "librarian" => "📚",
        "metis" => "🎯",
        _ => "👤",
    };
    let mut chars = name.chars();
    let title: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    format!("{} {}", icon, title)
}

/// Persona buttons three to a row, followed by the menu actions
pub fn default_keyboard(personas: &[String]) -> Vec<Vec<InlineKeyboardButton>> {
    let mut buttons: Vec<InlineKeyboardButton> = personas
        .iter()
        .map(|p| InlineKeyboardButton::callback(persona_face(p), CallbackData::Agent(p.clone()).encode()))
        .collect();
    for (text, action) in [
        ("ℹ️ Help", MenuAction::Help),
        ("📊 Status", MenuAction::Status),
        ("🆕 New", MenuAction::New),
        ("📋 List", MenuAction::List),
        ("🔄 Reset", MenuAction::Reset),
    ] {
        buttons.push(InlineKeyboardButton::callback(
            text,
            CallbackData::Menu(action).encode(),
        ));
    }
    buttons.chunks(3).map(|row| row.to_vec()).collect()
}

/// Dispatches updates for one bot
#[derive(Clone)]
pub struct Bot {
    config: Arc<RelayConfig>,
    registry: Arc<SessionRegistry>,
    gateway: Arc<SessionTreeGateway>,
    notifier: Arc<InteractionNotifier>,
    transport: Arc<dyn ChatTransport>,
    renderer: Renderer,
    started_at: Instant,
}

impl Bot {
    pub fn new(
        config: RelayConfig,
        service: Arc<dyn SessionService>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.session_defaults()));
        let gateway = Arc::new(SessionTreeGateway::new(
            service.clone(),
            config.agent.working_directory.clone(),
            config.remote.web_url(),
        ));
        let notifier = Arc::new(InteractionNotifier::new(service, transport.clone()));
        let renderer = Renderer::new(config.render.max_message_bytes);
        Self {
            config: Arc::new(config),
            registry,
            gateway,
            notifier,
            transport,
            renderer,
            started_at: Instant::now(),
        }
    }

    /// Override the pause between deletions during `/reset`
    pub fn with_delete_pause(mut self, pause: Duration) -> Self {
        let gateway = SessionTreeGateway::new(
            self.gateway.service().clone(),
            self.config.agent.working_directory.clone(),
            self.config.remote.web_url(),
        )
        .with_delete_pause(pause);
        self.gateway = Arc::new(gateway);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn gateway(&self) -> &Arc<SessionTreeGateway> {
        &self.gateway
    }

    pub fn notifier(&self) -> &Arc<InteractionNotifier> {
        &self.notifier
    }

    /// Wait until no invocation is in flight, or `timeout` passes
    ///
    /// Returns whether every invocation settled.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.registry.in_flight_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    async fn send_html(&self, chat_id: i64, text: &str) -> Result<i64> {
        self.transport
            .send_message(chat_id, text, &SendOptions::html())
            .await
    }

    async fn send_plain(&self, chat_id: i64, text: &str) -> Result<i64> {
        self.transport
            .send_message(chat_id, text, &SendOptions::default())
            .await
    }

    /// Allow-list gate shared by messages and button presses
    fn authorize(&self, user_id: i64) -> Result<()> {
        if self.config.is_user_allowed(user_id) {
            Ok(())
        } else {
            Err(RelayError::Unauthorized(user_id))
        }
    }

    async fn handle_message(&self, message: Message) -> Result<()> {
        let chat_id = message.chat.id;
        let Some(from) = message.from else {
            tracing::debug!(chat_id, "Ignoring message without sender");
            return Ok(());
        };
        if let Err(e) = self.authorize(from.id) {
            tracing::warn!(chat_id, "Refusing message: {}", e);
            self.send_plain(chat_id, UNAUTHORIZED_REPLY).await?;
            return Ok(());
        }
        let Some(text) = message.text else {
            tracing::debug!(chat_id, "Ignoring non-text message");
            return Ok(());
        };

        let chat = self.registry.get_or_create(chat_id);
        match command::parse(&text, &self.config.agent.personas) {
            Inbound::Command(cmd) => self.handle_command(chat, cmd).await,
            Inbound::Prompt { persona, text } => {
                self.begin_invocation(chat_id, persona, text).await
            }
            Inbound::Empty => {
                self.send_plain(chat_id, EMPTY_MESSAGE_REPLY).await?;
                Ok(())
            }
        }
    }

    async fn handle_command(&self, chat: ChatSession, cmd: Command) -> Result<()> {
        tracing::debug!(chat_id = chat.chat_id, command = ?cmd, "Handling command");
        match cmd {
            Command::Start => self.cmd_start(chat.chat_id).await,
            Command::Help => self.cmd_help(chat.chat_id).await,
            Command::Status => self.cmd_status(chat).await,
            Command::New => self.cmd_new(chat).await,
            Command::List => self.cmd_list(chat).await,
            Command::Switch(arg) => self.cmd_switch(chat, arg).await,
            Command::Cd(path) => self.cmd_cd(chat, path).await,
            Command::Reset => self.cmd_reset(chat).await,
            Command::ResetChild => self.cmd_reset_child(chat).await,
        }
    }

    fn persona_usage(&self) -> String {
        self.config
            .agent
            .personas
            .iter()
            .map(|p| format!("/{} [message] - Use {} agent\n", p, p))
            .collect()
    }

    async fn cmd_start(&self, chat_id: i64) -> Result<()> {
        let text = format!(
            "🤖 <b>a3s-relay</b> - agent sessions on Telegram\n\n\
             Commands:\n\
             {}\
             /status - Show session status\n\
             /new - Create new session\n\
             /list - List all sessions\n\
             /switch &lt;number&gt; - Switch to session by number\n\
             /cd [path] - Show/change working directory\n\
             /reset - Delete this session group and start over\n\
             /reset_child - Delete the current child session\n\n\
             Web UI: {}/\n\n\
             Or just send a message to use the default agent.",
            escape_html(&self.persona_usage()),
            escape_html(self.gateway.web_url()),
        );

        let mut options = SendOptions::html();
        if self.config.keyboard.enabled {
            let rows = self
                .config
                .keyboard
                .rows
                .clone()
                .unwrap_or_else(|| default_keyboard(&self.config.agent.personas));
            options = options.with_keyboard(InlineKeyboardMarkup::new(rows));
        }
        self.transport.send_message(chat_id, &text, &options).await?;
        Ok(())
    }

    async fn cmd_help(&self, chat_id: i64) -> Result<()> {
        let agents: String = self
            .config
            .agent
            .personas
            .iter()
            .map(|p| match persona_blurb(p) {
                Some(blurb) => format!("• {} - {}\n", p, blurb),
                None => format!("• {}\n", p),
            })
            .collect();
        let example = self
            .config
            .agent
            .personas
            .iter()
            .find(|p| p.as_str() != self.config.agent.default_agent)
            .unwrap_or(&self.config.agent.default_agent);

        let text = format!(
            "📖 <b>Help</b>\n\n\
             Send any message to run it through the current agent.\n\n\
             Available agents:\n\
             {}\n\
             Commands:\n\
             /status - Show session status\n\
             /new - Create new session\n\
             /list - List all sessions\n\
             /switch &lt;number&gt; - Switch to session by number\n\
             /cd [path] - Show/change working directory\n\
             /reset - Delete this session group and start over\n\
             /reset_child - Delete the current child session\n\n\
             Web UI: {}/\n\n\
             Example:\n\
             /{} explain this code\n\
             refactor this function",
            escape_html(&agents),
            escape_html(self.gateway.web_url()),
            escape_html(example),
        );
        self.send_html(chat_id, &text).await?;
        Ok(())
    }

    async fn cmd_status(&self, chat: ChatSession) -> Result<()> {
        let gateway_status = match self.gateway.service().health().await {
            Ok(health) if health.healthy && !health.version.is_empty() => {
                format!("✅ Connected ({})", health.version)
            }
            Ok(health) if health.healthy => "✅ Connected".to_string(),
            Ok(_) => "⚠️ Unhealthy".to_string(),
            Err(e) => {
                tracing::warn!(chat_id = chat.chat_id, "Health check failed: {}", e);
                "❌ Unreachable".to_string()
            }
        };

        let text = format!(
            "📊 <b>Bot Status</b>\n\n\
             <b>Session:</b> <code>{}</code>\n\
             <b>Agent:</b> {}\n\
             <b>Working Dir:</b> <code>{}</code>\n\
             <b>Gateway:</b> {}\n\
             <b>Uptime:</b> {}\n\
             <b>Active chats:</b> {}\n\n\
             <b>Chat created:</b> {}\n\
             <b>Last activity:</b> {}",
            escape_html(chat.remote_session_id.as_deref().unwrap_or("none")),
            escape_html(&chat.current_agent),
            escape_html(&chat.working_directory),
            escape_html(&gateway_status),
            format_uptime(self.started_at.elapsed().as_secs()),
            self.registry.len(),
            format_time(chat.created_at),
            format_time(chat.last_activity),
        );
        self.send_html(chat.chat_id, &text).await?;
        Ok(())
    }

    /// Store the remote binding a gateway call produced
    fn write_back(&self, chat: &ChatSession) {
        let remote_session_id = chat.remote_session_id.clone();
        self.registry
            .update(chat.chat_id, |s| s.remote_session_id = remote_session_id);
    }

    fn web_link(&self, session: &RemoteSession) -> String {
        self.gateway
            .session_web_url(&session.id, session.project_id.as_deref())
    }

    async fn cmd_new(&self, mut chat: ChatSession) -> Result<()> {
        match self.gateway.create_new(&mut chat).await {
            Ok(session) => {
                self.write_back(&chat);
                let text = format!(
                    "✅ <b>New session created</b>\n\n\
                     Session ID: <code>{}</code>\n\n\
                     View in web UI:\n{}\n\n\
                     Starting fresh conversation.",
                    escape_html(&session.id),
                    escape_html(&self.web_link(&session)),
                );
                self.send_html(chat.chat_id, &text).await?;
            }
            Err(e) => {
                tracing::error!(chat_id = chat.chat_id, "Session creation failed: {}", e);
                self.send_plain(chat.chat_id, &e.user_message("Session creation"))
                    .await?;
            }
        }
        Ok(())
    }

    async fn cmd_list(&self, chat: ChatSession) -> Result<()> {
        let sessions = match self.gateway.list_for_chat_by_recency(&chat).await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::error!(chat_id = chat.chat_id, "Session list failed: {}", e);
                self.send_plain(chat.chat_id, &e.user_message("Session list"))
                    .await?;
                return Ok(());
            }
        };

        if sessions.is_empty() {
            self.send_plain(
                chat.chat_id,
                "Sessions\n\nNo sessions found. Use /new to create one.",
            )
            .await?;
            return Ok(());
        }

        let current = chat.remote_session_id.as_deref();
        let listing = sessions
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let marker = if Some(s.id.as_str()) == current {
                    " (current)"
                } else {
                    ""
                };
                format!(
                    "{}. {}{}\n   {}\n   Updated: {}",
                    i + 1,
                    s.id,
                    marker,
                    s.title_or_untitled(),
                    format_millis(s.time.updated)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let text = format!(
            "Sessions ({} total)\n\n{}\n\nUse /switch <number> to switch sessions\nView in web UI: {}/",
            sessions.len(),
            listing,
            self.gateway.web_url()
        );
        self.send_plain(chat.chat_id, &text).await?;
        Ok(())
    }

    async fn cmd_switch(&self, mut chat: ChatSession, arg: Option<String>) -> Result<()> {
        let Some(arg) = arg else {
            self.send_plain(chat.chat_id, SWITCH_USAGE).await?;
            return Ok(());
        };
        let Ok(index) = arg.parse::<usize>() else {
            self.send_plain(
                chat.chat_id,
                "⚠️ Invalid number. Use /switch <number>\n\nExample: /switch 1",
            )
            .await?;
            return Ok(());
        };

        match self.gateway.switch_to(&mut chat, index).await {
            Ok(session) => {
                self.write_back(&chat);
                let text = format!(
                    "Switched to session\n\n\
                     Number: {}\n\
                     Title: {}\n\
                     Session ID: {}\n\n\
                     View in web UI:\n{}",
                    index,
                    session.title_or_untitled(),
                    session.id,
                    self.web_link(&session)
                );
                self.send_plain(chat.chat_id, &text).await?;
            }
            Err(RelayError::InvalidSelection(reason)) => {
                let text = format!(
                    "⚠️ Invalid session number: {}\n\n{}\nUse /list to see all sessions.",
                    index, reason
                );
                self.send_plain(chat.chat_id, &text).await?;
            }
            Err(e) => {
                tracing::error!(chat_id = chat.chat_id, "Session switch failed: {}", e);
                self.send_plain(chat.chat_id, &e.user_message("Session switch"))
                    .await?;
            }
        }
        Ok(())
    }

    async fn cmd_cd(&self, chat: ChatSession, path: Option<String>) -> Result<()> {
        let Some(path) = path else {
            let text = format!(
                "📁 <b>Current Working Directory</b>\n\n\
                 <code>{}</code>\n\n\
                 Use <code>/cd &lt;path&gt;</code> to change directory.",
                escape_html(&chat.working_directory)
            );
            self.send_html(chat.chat_id, &text).await?;
            return Ok(());
        };

        let new_path = if path.starts_with('/') {
            path
        } else {
            format!("{}/{}", chat.working_directory.trim_end_matches('/'), path)
        };
        tracing::info!(chat_id = chat.chat_id, directory = %new_path, "Working directory changed");
        let stored = new_path.clone();
        self.registry
            .update(chat.chat_id, |s| s.working_directory = stored);

        let text = format!(
            "✅ <b>Working directory changed</b>\n\n\
             New path: <code>{}</code>\n\n\
             All subsequent operations will use this directory.",
            escape_html(&new_path)
        );
        self.send_html(chat.chat_id, &text).await?;
        Ok(())
    }

    async fn cmd_reset(&self, mut chat: ChatSession) -> Result<()> {
        match self.gateway.reset_group(&mut chat).await {
            Ok(reset) => {
                self.write_back(&chat);
                let text = format!(
                    "✅ <b>Conversation history cleared</b>\n\n\
                     Deleted sessions: {}\n\
                     Old root: <code>{}</code>\n\
                     New session: <code>{}</code>\n\n\
                     Starting fresh conversation.",
                    reset.deleted_count,
                    escape_html(reset.root_session_id.as_deref().unwrap_or("none")),
                    escape_html(&reset.new_session_id),
                );
                self.send_html(chat.chat_id, &text).await?;
            }
            Err(e) => {
                tracing::error!(chat_id = chat.chat_id, "Group reset failed: {}", e);
                self.send_plain(chat.chat_id, &e.user_message("Reset"))
                    .await?;
            }
        }
        Ok(())
    }

    async fn cmd_reset_child(&self, mut chat: ChatSession) -> Result<()> {
        match self.gateway.reset_child(&mut chat).await {
            Ok(reset) => {
                self.write_back(&chat);
                let text = format!(
                    "✅ <b>Child session deleted</b>\n\n\
                     Deleted: <code>{}</code>\n\
                     Now on parent: <code>{}</code>",
                    escape_html(&reset.deleted_session_id),
                    escape_html(&reset.parent_session_id),
                );
                self.send_html(chat.chat_id, &text).await?;
            }
            Err(e) => {
                tracing::warn!(chat_id = chat.chat_id, "Child reset refused: {}", e);
                self.send_plain(chat.chat_id, &e.user_message("Child reset"))
                    .await?;
            }
        }
        Ok(())
    }

    /// Claim the chat and run the prompt on its own task
    ///
    /// A chat that already has an invocation running gets the busy notice
    /// and the message is dropped, persona override included.
    async fn begin_invocation(
        &self,
        chat_id: i64,
        persona: Option<String>,
        text: String,
    ) -> Result<()> {
        let Some(guard) = self.registry.try_begin(chat_id) else {
            tracing::info!(chat_id, "Chat busy; dropping message");
            self.send_plain(chat_id, BUSY_REPLY).await?;
            return Ok(());
        };
        if let Some(agent) = &persona {
            tracing::info!(chat_id, agent = %agent, "Agent switched");
        }
        self.registry.update(chat_id, |s| {
            if let Some(agent) = persona {
                s.current_agent = agent;
            }
            s.last_user_message = Some(text.clone());
        });

        let bot = self.clone();
        tokio::spawn(async move { bot.invoke(guard, text).await });
        Ok(())
    }

    async fn invoke(self, guard: InFlightGuard, text: String) {
        let chat_id = guard.chat_id();
        let Some(mut chat) = self.registry.get(chat_id) else {
            return;
        };
        let bound_before = chat.remote_session_id.clone();
        let agent = chat.current_agent.clone();
        tracing::info!(chat_id, agent = %agent, chars = text.chars().count(), "Invocation started");

        let mut status = StatusMessage::new(self.transport.clone(), chat_id, self.config.status.enabled);
        status.set(&format!("⏳ {} is working…", agent)).await;

        let result = match self.gateway.ensure_session(&mut chat).await {
            Ok(session_id) => {
                if bound_before.as_deref() != Some(session_id.as_str()) {
                    self.write_back(&chat);
                }
                let bound = chat.remote_session_id.clone();
                let result = self.prompt_with_notifier(&mut chat, &text, &agent).await;
                // The prompt may have re-resolved a vanished session
                if chat.remote_session_id != bound {
                    self.write_back(&chat);
                }
                result
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(reply) => {
                status.set(&format!("✅ {} finished", agent)).await;
                if let Err(e) = self.deliver(chat_id, &reply).await {
                    tracing::error!(chat_id, "Failed to deliver reply: {}", e);
                }
                tracing::info!(chat_id, chars = reply.chars().count(), "Invocation finished");
            }
            Err(e) => {
                tracing::error!(chat_id, "Invocation failed: {}", e);
                status.set(&format!("❌ {} failed", agent)).await;
                if let Err(send_err) = self.send_plain(chat_id, &e.user_message("Prompt")).await {
                    tracing::error!(chat_id, "Failed to report invocation error: {}", send_err);
                }
            }
        }
        drop(guard);
    }

    /// Run the prompt while the notifier polls on its interval
    async fn prompt_with_notifier(
        &self,
        chat: &mut ChatSession,
        text: &str,
        agent: &str,
    ) -> Result<String> {
        let watched = chat.clone();
        let notify = self.config.notifier.enabled;
        let period = self.config.notifier_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let prompt = self.gateway.prompt(chat, text, agent);
        tokio::pin!(prompt);
        loop {
            tokio::select! {
                result = &mut prompt => return result,
                _ = ticker.tick(), if notify => {
                    let sent = self.notifier.poll_and_notify(&watched).await;
                    if sent > 0 {
                        tracing::debug!(chat_id = watched.chat_id, sent, "Surfaced pending requests");
                    }
                }
            }
        }
    }

    /// Render and send an agent reply
    ///
    /// A chunk Telegram refuses as HTML is re-sent as plain text.
    async fn deliver(&self, chat_id: i64, reply: &str) -> Result<()> {
        let chunks = self.renderer.render(reply);
        let mut sent = 0;
        for chunk in chunks.iter().filter(|c| !c.is_blank()) {
            match self.send_html(chat_id, &chunk.html).await {
                Ok(_) => {}
                Err(RelayError::Telegram { description, .. }) => {
                    tracing::warn!(chat_id, "HTML chunk rejected ({}); sending as plain text", description);
                    self.send_plain(chat_id, &chunk.raw).await?;
                }
                Err(e) => return Err(e),
            }
            sent += 1;
        }
        tracing::debug!(chat_id, chunks = sent, "Reply delivered");
        Ok(())
    }

    async fn handle_callback(&self, query: CallbackQuery) -> Result<()> {
        let user_id = query.from.id;
        let chat_id = query.message.as_ref().map_or(user_id, |m| m.chat.id);

        if let Err(e) = self.transport.answer_callback_query(&query.id, None).await {
            tracing::warn!(chat_id, "Failed to answer callback query: {}", e);
        }
        if let Err(e) = self.authorize(user_id) {
            tracing::warn!(chat_id, "Refusing callback: {}", e);
            self.send_plain(chat_id, UNAUTHORIZED_REPLY).await?;
            return Ok(());
        }

        let Some(data) = query.data.as_deref().and_then(CallbackData::parse) else {
            tracing::debug!(chat_id, data = ?query.data, "Ignoring unknown callback data");
            return Ok(());
        };
        let chat = self.registry.get_or_create(chat_id);

        if matches!(data, CallbackData::Agent(_) | CallbackData::Menu(_)) {
            if let Some(message) = &query.message {
                if let Err(e) = self.transport.delete_message(chat_id, message.message_id).await {
                    tracing::warn!(chat_id, "Failed to delete menu message: {}", e);
                }
            }
        }

        match data {
            CallbackData::Agent(agent) => {
                if !self.config.agent.personas.contains(&agent) {
                    self.send_plain(chat_id, &format!("⚠️ Unknown agent: {}", agent))
                        .await?;
                    return Ok(());
                }
                tracing::info!(chat_id, user_id, agent = %agent, "Agent switched");
                let text = format!(
                    "✅ Agent switched to: {}\n\nSend me a message to use the {} agent.",
                    agent, agent
                );
                self.registry.update(chat_id, |s| s.current_agent = agent);
                self.send_plain(chat_id, &text).await?;
                Ok(())
            }
            CallbackData::Menu(action) => {
                let cmd = match action {
                    MenuAction::Help => Command::Help,
                    MenuAction::Status => Command::Status,
                    MenuAction::New => Command::New,
                    MenuAction::List => Command::List,
                    MenuAction::Reset => Command::Reset,
                    MenuAction::ResetChild => Command::ResetChild,
                };
                self.handle_command(chat, cmd).await
            }
            CallbackData::Permission {
                action: PermissionAction::Reply(reply),
                request_id,
            } => self.notifier.reply_permission(&chat, &request_id, reply).await,
            CallbackData::Permission {
                action: PermissionAction::Retry,
                request_id,
            } => {
                tracing::info!(chat_id, request_id = %request_id, "Retrying last message");
                match chat.last_user_message {
                    Some(text) => self.begin_invocation(chat_id, None, text).await,
                    None => {
                        self.send_plain(chat_id, "⚠️ Nothing to retry.").await?;
                        Ok(())
                    }
                }
            }
            CallbackData::QuestionAnswer {
                request_id,
                question,
                option,
            } => {
                self.notifier
                    .answer_question(&chat, &request_id, question, option)
                    .await
            }
            CallbackData::QuestionReject { request_id } => {
                self.notifier.reject_question(&chat, &request_id).await
            }
        }
    }
}

#[async_trait]
impl UpdateHandler for Bot {
    async fn handle_update(&self, update: Update) -> Result<()> {
        tracing::debug!(update_id = update.update_id, "Dispatching update");
        if let Some(query) = update.callback_query {
            self.handle_callback(query).await
        } else if let Some(message) = update.message {
            self.handle_message(message).await
        } else {
            tracing::debug!(update_id = update.update_id, "Ignoring unsupported update");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemorySessionService, RemoteCall};
    use crate::transport::MemoryTransport;

    const CHAT: i64 = 42;
    const USER: i64 = 1001;

    struct Harness {
        remote: Arc<MemorySessionService>,
        transport: Arc<MemoryTransport>,
        bot: Bot,
    }

    fn config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.telegram.bot_token = "123:abc".into();
        config.telegram.allowed_users = vec![USER.to_string()];
        config.agent.working_directory = "/work".into();
        config.agent.session_prefix = "bot".into();
        config.notifier.poll_interval_ms = 10;
        config
    }

    fn harness_with(config: RelayConfig) -> Harness {
        let remote = Arc::new(MemorySessionService::new());
        let transport = Arc::new(MemoryTransport::new());
        let bot = Bot::new(config, remote.clone(), transport.clone())
            .with_delete_pause(Duration::ZERO);
        Harness {
            remote,
            transport,
            bot,
        }
    }

    fn harness() -> Harness {
        harness_with(config())
    }

    impl Harness {
        async fn text(&self, update_id: i64, text: &str) {
            self.bot
                .handle_update(Update::text(update_id, CHAT, USER, text))
                .await
                .unwrap();
        }

        async fn press(&self, update_id: i64, data: &str) {
            self.bot
                .handle_update(Update::callback(update_id, CHAT, USER, data))
                .await
                .unwrap();
        }

        async fn settle(&self) {
            assert!(self.bot.wait_idle(Duration::from_secs(5)).await);
        }

        fn texts(&self) -> Vec<String> {
            self.transport.texts(CHAT)
        }

        fn last_text(&self) -> String {
            self.transport.last(CHAT).map(|m| m.text).unwrap_or_default()
        }
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(3), "3s");
        assert_eq!(format_uptime(123), "2m 3s");
        assert_eq!(format_uptime(3723), "1h 2m 3s");
        assert_eq!(format_uptime(0), "0s");
    }

    #[test]
    fn test_default_keyboard() {
        let personas = config().agent.personas;
        let rows = default_keyboard(&personas);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0][0].text, "🤖 Sisyphus");
        assert_eq!(rows[0][0].callback_data.as_deref(), Some("agent:sisyphus"));
        assert_eq!(rows[1][2].callback_data.as_deref(), Some("action:help"));
        assert_eq!(rows[3][0].callback_data.as_deref(), Some("action:reset"));
        for row in &rows {
            for button in row {
                let data = button.callback_data.as_deref().unwrap();
                assert!(CallbackData::parse(data).is_some(), "{data}");
            }
        }
    }

    #[tokio::test]
    async fn test_unauthorized_user_is_refused() {
        let h = harness();
        h.bot
            .handle_update(Update::text(1, CHAT, 9999, "hello"))
            .await
            .unwrap();
        assert_eq!(h.texts(), vec![UNAUTHORIZED_REPLY.to_string()]);
        assert!(h.remote.calls().is_empty());
        assert!(h.bot.registry().is_empty());
        assert!(matches!(
            h.bot.authorize(9999),
            Err(RelayError::Unauthorized(9999))
        ));
        assert!(h.bot.authorize(USER).is_ok());
    }

    #[tokio::test]
    async fn test_unauthorized_callback_is_answered_then_refused() {
        let h = harness();
        h.bot
            .handle_update(Update::callback(3, CHAT, 9999, "action:reset"))
            .await
            .unwrap();
        assert_eq!(h.transport.answered_callbacks(), vec!["cbq-3".to_string()]);
        assert_eq!(h.texts(), vec![UNAUTHORIZED_REPLY.to_string()]);
        assert!(h.remote.deletes().is_empty());
    }

    #[tokio::test]
    async fn test_prompt_round_trip() {
        let h = harness();
        h.remote.set_reply("Here is **the** answer");
        h.text(1, "refactor this function").await;
        h.settle().await;

        let texts = h.texts();
        assert_eq!(texts.len(), 2);
        assert_eq!(texts[0], "✅ sisyphus finished");
        assert_eq!(texts[1], "Here is <b>the</b> answer");

        let chat = h.bot.registry().get(CHAT).unwrap();
        let session_id = chat.remote_session_id.unwrap();
        assert_eq!(h.remote.session(&session_id).unwrap().title.as_deref(), Some("bot-42"));
        assert_eq!(chat.last_user_message.as_deref(), Some("refactor this function"));
        assert!(h.remote.calls().contains(&RemoteCall::Prompt {
            session_id,
            text: "refactor this function".into(),
            agent: Some("sisyphus".into()),
        }));
    }

    #[tokio::test]
    async fn test_second_message_while_busy_is_dropped() {
        let h = harness();
        h.remote.set_prompt_delay(Duration::from_millis(200));
        h.text(1, "first").await;
        h.text(2, "second").await;
        assert!(h.bot.registry().is_in_flight(CHAT));
        h.settle().await;

        assert_eq!(h.remote.prompt_count(), 1);
        let busy = h.texts().iter().filter(|t| t.as_str() == BUSY_REPLY).count();
        assert_eq!(busy, 1);
        assert!(!h.bot.registry().is_in_flight(CHAT));
    }

    #[tokio::test]
    async fn test_busy_persona_message_keeps_agent() {
        let h = harness();
        h.remote.set_prompt_delay(Duration::from_millis(200));
        h.text(1, "first").await;
        h.text(2, "/oracle second").await;
        assert_eq!(h.bot.registry().get(CHAT).unwrap().current_agent, "sisyphus");
        h.settle().await;

        assert_eq!(h.remote.prompt_count(), 1);
        let chat = h.bot.registry().get(CHAT).unwrap();
        assert_eq!(chat.current_agent, "sisyphus");
        assert_eq!(chat.last_user_message.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_different_chats_run_concurrently() {
        let h = harness();
        h.remote.set_prompt_delay(Duration::from_millis(100));
        h.text(1, "one").await;
        h.bot
            .handle_update(Update::text(2, 43, USER, "two"))
            .await
            .unwrap();
        assert_eq!(h.bot.registry().in_flight_count(), 2);
        h.settle().await;
        assert_eq!(h.remote.prompt_count(), 2);
    }

    #[tokio::test]
    async fn test_persona_override_sticks() {
        let h = harness();
        h.text(1, "/oracle explain this code").await;
        h.settle().await;

        assert_eq!(h.bot.registry().get(CHAT).unwrap().current_agent, "oracle");
        assert_eq!(
            h.remote.count(|c| matches!(
                c,
                RemoteCall::Prompt { agent: Some(a), text, .. } if a == "oracle" && text == "explain this code"
            )),
            1
        );
    }

    #[tokio::test]
    async fn test_empty_persona_message() {
        let h = harness();
        h.text(1, "/oracle").await;
        assert_eq!(h.texts(), vec![EMPTY_MESSAGE_REPLY.to_string()]);
        assert_eq!(h.remote.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_reply_placeholder() {
        let h = harness();
        h.remote.set_reply("");
        h.text(1, "hi").await;
        h.settle().await;
        assert_eq!(h.last_text(), crate::gateway::EMPTY_REPLY);
    }

    #[tokio::test]
    async fn test_prompt_failure_is_reported() {
        let h = harness();
        h.remote.fail_prompts("HTTP 502: upstream down");
        h.text(1, "hi").await;
        h.settle().await;

        assert_eq!(
            h.texts(),
            vec![
                "❌ sisyphus failed".to_string(),
                "❌ Prompt failed: HTTP 502: upstream down".to_string()
            ]
        );
        assert!(!h.bot.registry().is_in_flight(CHAT));
    }

    #[tokio::test]
    async fn test_status_disabled_sends_only_reply() {
        let mut config = config();
        config.status.enabled = false;
        let h = harness_with(config);
        h.remote.set_reply("done");
        h.text(1, "go").await;
        h.settle().await;
        assert_eq!(h.texts(), vec!["done".to_string()]);
    }

    #[tokio::test]
    async fn test_working_directory_prefix() {
        let h = harness();
        h.text(1, "/cd src").await;
        assert!(h.last_text().contains("/work/src"));
        h.text(2, "/cd /tmp/other").await;
        assert_eq!(h.bot.registry().get(CHAT).unwrap().working_directory, "/tmp/other");

        h.text(3, "build it").await;
        h.settle().await;
        assert_eq!(
            h.remote.count(|c| matches!(
                c,
                RemoteCall::Prompt { text, .. } if text == "[Working in: /tmp/other]\n\nbuild it"
            )),
            1
        );
    }

    #[tokio::test]
    async fn test_cd_without_argument_shows_directory() {
        let h = harness();
        h.text(1, "/cd").await;
        assert!(h.last_text().contains("<code>/work</code>"));
    }

    #[tokio::test]
    async fn test_switch_usage_and_selection() {
        let h = harness();
        h.remote.insert_session("ses_old", "bot-42", None, 1_700_000_000_000);
        h.remote.insert_session("ses_new", "bot-42-1700000500", None, 1_700_000_500_000);

        h.text(1, "/switch").await;
        assert_eq!(h.last_text(), SWITCH_USAGE);

        h.text(2, "/switch two").await;
        assert!(h.last_text().starts_with("⚠️ Invalid number."));

        h.text(3, "/switch 9").await;
        assert!(h.last_text().starts_with("⚠️ Invalid session number: 9"));
        assert!(h.last_text().contains("1-2"));

        h.text(4, "/switch 2").await;
        assert!(h.last_text().contains("Session ID: ses_old"));
        assert_eq!(
            h.bot.registry().get(CHAT).unwrap().remote_session_id.as_deref(),
            Some("ses_old")
        );
    }

    #[tokio::test]
    async fn test_list_marks_current() {
        let h = harness();
        h.text(1, "/list").await;
        assert!(h.last_text().contains("No sessions found"));

        h.remote.insert_session("ses_a", "bot-42", None, 1_700_000_000_000);
        h.remote.insert_session("ses_b", "unrelated", None, 1_700_000_900_000);
        h.text(2, "/switch 1").await;
        h.text(3, "/list").await;

        let listing = h.last_text();
        assert!(listing.starts_with("Sessions (1 total)"));
        assert!(listing.contains("1. ses_a (current)\n   bot-42\n   Updated: 2023-11-14"));
        assert!(!listing.contains("ses_b"));
    }

    #[tokio::test]
    async fn test_new_links_to_web_ui() {
        let h = harness();
        h.text(1, "/new").await;
        let text = h.last_text();
        assert!(text.starts_with("✅ <b>New session created</b>"));
        assert!(text.contains("http://localhost:4096/global/session/ses_mem_"));
        assert!(h.bot.registry().get(CHAT).unwrap().remote_session_id.is_some());
    }

    #[tokio::test]
    async fn test_reset_deletes_group() {
        let h = harness();
        h.remote.insert_session("ses_root", "bot-42", None, 1_700_000_000_000);
        h.remote.insert_session("ses_child", "sub", Some("ses_root"), 1_700_000_000_001);
        h.bot.registry().get_or_create(CHAT);
        h.bot
            .registry()
            .update(CHAT, |s| s.remote_session_id = Some("ses_child".into()));

        h.text(1, "/reset").await;

        assert_eq!(h.remote.deletes(), vec!["ses_child".to_string(), "ses_root".to_string()]);
        let text = h.last_text();
        assert!(text.contains("Deleted sessions: 2"));
        let bound = h.bot.registry().get(CHAT).unwrap().remote_session_id.unwrap();
        assert_ne!(bound, "ses_child");
        assert!(h.remote.session(&bound).is_some());
    }

    #[tokio::test]
    async fn test_reset_child_on_root_is_refused() {
        let h = harness();
        h.remote.insert_session("ses_root", "bot-42", None, 1_700_000_000_000);
        h.text(1, "/new").await;
        h.text(2, "/reset_child").await;
        assert!(h.last_text().starts_with("❌ Child reset failed:"));
        assert!(h.remote.deletes().is_empty());
    }

    #[tokio::test]
    async fn test_status_report() {
        let h = harness();
        h.text(1, "/status").await;
        let text = h.last_text();
        assert!(text.contains("<b>Session:</b> <code>none</code>"));
        assert!(text.contains("<b>Agent:</b> sisyphus"));
        assert!(text.contains("<b>Gateway:</b> ✅ Connected (memory)"));
        assert!(text.contains("<b>Active chats:</b> 1"));
    }

    #[tokio::test]
    async fn test_start_sends_keyboard() {
        let h = harness();
        h.text(1, "/start").await;
        let sent = h.transport.last(CHAT).unwrap();
        let markup = sent.options.reply_markup.unwrap();
        assert!(markup.callback_data().contains(&"agent:oracle"));
        assert!(sent.text.contains("/switch &lt;number&gt;"));

        let mut config = config();
        config.keyboard.enabled = false;
        let h = harness_with(config);
        h.text(1, "/start").await;
        assert!(h.transport.last(CHAT).unwrap().options.reply_markup.is_none());
    }

    #[tokio::test]
    async fn test_agent_button_switches_and_deletes_menu() {
        let h = harness();
        h.text(1, "/start").await;
        let menu_id = h.transport.last(CHAT).unwrap().message_id;

        let mut press = Update::callback(2, CHAT, USER, "agent:metis");
        if let Some(message) = press.callback_query.as_mut().and_then(|q| q.message.as_mut()) {
            message.message_id = menu_id;
        }
        h.bot.handle_update(press).await.unwrap();

        assert_eq!(h.transport.answered_callbacks(), vec!["cbq-2".to_string()]);
        assert_eq!(h.bot.registry().get(CHAT).unwrap().current_agent, "metis");
        assert!(h.last_text().starts_with("✅ Agent switched to: metis"));
        assert!(!h.transport.sent().iter().any(|m| m.message_id == menu_id && !m.deleted));
    }

    #[tokio::test]
    async fn test_unknown_agent_button() {
        let h = harness();
        h.press(1, "agent:hermes").await;
        assert_eq!(h.last_text(), "⚠️ Unknown agent: hermes");
        assert_eq!(h.bot.registry().get(CHAT).unwrap().current_agent, "sisyphus");
    }

    #[tokio::test]
    async fn test_menu_action_runs_command() {
        let h = harness();
        h.press(1, "action:help").await;
        assert!(h.last_text().starts_with("📖 <b>Help</b>"));
    }

    #[tokio::test]
    async fn test_side_action_failures_are_swallowed() {
        let h = harness();
        h.transport.fail_side_actions(true);
        h.press(1, "action:status").await;
        assert!(h.last_text().starts_with("📊 <b>Bot Status</b>"));
    }

    #[tokio::test]
    async fn test_permission_buttons() {
        let h = harness();
        h.press(1, "perm:always:per_1").await;
        assert!(h.remote.calls().contains(&RemoteCall::ReplyPermission {
            request_id: "per_1".into(),
            reply: crate::remote::PermissionReply::Always,
        }));
        assert_eq!(h.last_text(), "✅ Always allowed.");
    }

    #[tokio::test]
    async fn test_retry_replays_last_message() {
        let h = harness();
        h.press(1, "perm:retry:per_1").await;
        assert_eq!(h.last_text(), "⚠️ Nothing to retry.");

        h.text(2, "deploy").await;
        h.settle().await;
        h.press(3, "perm:retry:per_1").await;
        h.settle().await;

        assert_eq!(
            h.remote.count(|c| matches!(c, RemoteCall::Prompt { text, .. } if text == "deploy")),
            2
        );
        assert_eq!(
            h.remote.count(|c| matches!(c, RemoteCall::ReplyPermission { .. })),
            0
        );
    }

    #[tokio::test]
    async fn test_unparseable_callback_is_ignored() {
        let h = harness();
        h.press(1, "garbage").await;
        assert_eq!(h.transport.answered_callbacks().len(), 1);
        assert!(h.texts().is_empty());
    }
}
