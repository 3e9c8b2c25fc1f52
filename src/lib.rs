//! resolvhook - A DNS forwarding proxy that turns resolved answers into automation.
//!
//! Queries are forwarded to upstream resolvers. Every A/AAAA answer is grouped
//! by domain and checked against a list of glob rules; a matching domain fires
//! the configured triggers (shell commands, JSON webhooks) before the answer is
//! relayed to the client. A typical use is keeping firewall sets in sync with
//! the addresses a monitored domain resolves to.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                            resolvhook                             │
//! │                                                                   │
//! │  ┌──────────────────┐  start/stop   ┌──────────────────┐          │
//! │  │   Supervisor     │──────────────▶│    DnsServer     │◀── UDP   │
//! │  │ (reload timer)   │  set_rules    │  (QueryRouter)   │          │
//! │  └────────┬─────────┘               └───┬─────────┬────┘          │
//! │           │ lifecycle                   │ match   │ forward       │
//! │           ▼                             ▼         ▼               │
//! │  ┌──────────────────────────────────────────┐  ┌───────────┐      │
//! │  │               Dispatcher                 │  │ upstreams │      │
//! │  │   shell commands  ·  JSON webhooks       │  └───────────┘      │
//! │  └──────────────────────────────────────────┘                     │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use resolvhook::command::ShellRunner;
//! use resolvhook::webhook::WebhookClient;
//! use resolvhook::{Dispatcher, Supervisor};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let dispatcher = Arc::new(Dispatcher::new(
//!         Arc::new(ShellRunner::detect()),
//!         WebhookClient::new().unwrap(),
//!     ));
//!     let shutdown = CancellationToken::new();
//!     resolvhook::supervisor::cancel_on_signals(shutdown.clone());
//!
//!     Supervisor::new("resolvhook.yml", dispatcher, shutdown)
//!         .run()
//!         .await
//!         .unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod command;
pub mod config;
pub mod error;
pub mod metrics;
pub mod router;
pub mod rules;
pub mod server;
pub mod supervisor;
pub mod telemetry;
pub mod trigger;
pub mod webhook;

// Re-export main types
pub use config::{CommandTrigger, Config, TriggerConfig, UpstreamConfig, WebhookTrigger};
pub use error::{ConfigError, RuleError, ServerError, SupervisorError, TriggerError};
pub use router::QueryRouter;
pub use rules::{Rule, RuleSet, SharedRules};
pub use server::DnsServer;
pub use supervisor::Supervisor;
pub use trigger::{Dispatcher, LifecycleState, MatchEvent};
