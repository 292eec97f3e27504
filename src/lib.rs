//! # a3s-relay
//!
//! Telegram relay for remote agent sessions.
//!
//! ## Overview
//!
//! `a3s-relay` long-polls the Telegram Bot API and forwards each chat's
//! messages to a remote agent-session service (an opencode-compatible REST
//! server). Every chat is bound to a tree of remote sessions; replies come
//! back as Telegram HTML split to fit the per-message limit. While the agent
//! works, pending permission requests and question forms are surfaced as
//! inline keyboards and the user's answers are sent back upstream.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_relay::{Bot, RelayConfig, UpdatePoller, PollerConfig};
//! use a3s_relay::remote::MemorySessionService;
//! use a3s_relay::transport::MemoryTransport;
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_relay::Result<()> {
//! let config = RelayConfig::default();
//! let transport = Arc::new(MemoryTransport::new());
//! let bot = Bot::new(config, Arc::new(MemorySessionService::new()), transport.clone());
//!
//! let poller = Arc::new(UpdatePoller::new(transport, Arc::new(bot), PollerConfig::default()));
//! let handle = poller.spawn();
//! poller.stop().await;
//! let _ = handle.await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **SessionService** trait: the remote REST API, with HTTP and in-memory backends
//! - **ChatTransport** trait: the Bot API calls, with HTTP and in-memory backends
//! - **SessionRegistry**: per-chat state and in-flight markers
//! - **SessionTreeGateway**: root/child resolution and tree deletion
//! - **InteractionNotifier**: permission and question prompts
//! - **Renderer**: markdown to budgeted Telegram HTML chunks
//! - **UpdatePoller**: the long-poll loop driving a [`Bot`]

pub mod bot;
pub mod callback;
pub mod command;
pub mod config;
pub mod error;
pub mod gateway;
pub mod notifier;
pub mod poller;
pub mod registry;
pub mod remote;
pub mod render;
pub mod status;
pub mod transport;

// Re-export core types
pub use bot::Bot;
pub use callback::CallbackData;
pub use config::{load_config, RelayConfig};
pub use error::{RelayError, Result};
pub use gateway::{ChildReset, GroupReset, SessionTreeGateway};
pub use notifier::InteractionNotifier;
pub use poller::{PollerConfig, UpdateHandler, UpdatePoller};
pub use registry::{ChatSession, InFlightGuard, SessionDefaults, SessionRegistry};
pub use remote::{HttpSessionService, MemorySessionService, SessionService};
pub use render::{render, RenderedChunk, Renderer};
pub use status::StatusMessage;
pub use transport::{ChatTransport, MemoryTransport, TelegramClient};
