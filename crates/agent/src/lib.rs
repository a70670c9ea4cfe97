//! # Remote Agent Library
//!
//! This crate hosts interactive terminal sessions on behalf of a remote
//! control plane.
//!
//! ## Overview
//!
//! The agent runs on machines that should be reachable remotely. It provides:
//!
//! - **Session Engine**: reserve, connect, drive and reclaim PTY sessions
//! - **Sequencing**: strictly ordered input and retransmitted output
//! - **Transports**: WebSocket room, framed TCP socket and HTTP callbacks
//! - **Dispatcher**: routes scoped requests to channel handlers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Agent Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │          Dispatcher  ──►  terminal channel                 │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │   Session    │  │  Sequencer   │  │     Idle Reaper      │  │
//! │  │   Engine     │  │              │  │                      │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │                                                                  │
//! │  ┌───────────────────┐  ┌───────────────────────────────────┐  │
//! │  │   PTY Spawner     │  │  Transport (room / socket / http) │  │
//! │  └───────────────────┘  └───────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agent::{AgentOrchestrator, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!
//!     let mut orchestrator = AgentOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Serve until asked to stop...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Session engine, PTY adapter, sequencing and idle reaping
//! - [`transport`]: Links to the control plane
//! - [`channels`]: Scope handlers
//! - [`dispatcher`]: Request routing
//! - [`orchestrator`]: Main agent coordinator

pub mod channels;
pub mod config;
pub mod dispatcher;
pub mod orchestrator;
pub mod session;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use channels::{ChannelError, ChannelHandler, TerminalChannel};
pub use config::{Config, ConfigError, TransportKind};
pub use dispatcher::{DispatchError, Dispatcher};
pub use orchestrator::{AgentOrchestrator, OrchestratorEvent, OrchestratorState};
pub use session::{
    EngineSettings, NativePtySpawner, PtyProcess, PtySpawner, SessionEngine, SessionError,
    SessionId, SessionInfo, SessionStatus,
};
pub use transport::{TerminalEvent, TransportError, TransportLink, TransportSender};
