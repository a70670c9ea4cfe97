//! Agent orchestrator for wiring together all components.
//!
//! Builds the transport, the session engine and the dispatcher from
//! configuration, runs the inbound loop and performs graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{ConsumeConfirmRequest, DataRequest};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::channels::TerminalChannel;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::session::{EngineSettings, NativePtySpawner, PtySpawner, SessionEngine};
use crate::transport::{self, Inbound, LinkClient, ResponseSender, TransportLink};

/// How long `stop` waits for in-flight requests.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and serving requests.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A routed request was answered.
    RequestHandled { request_id: String, errored: bool },
    /// Streamed input or a confirmation was refused by the engine.
    StreamRejected { session_id: String, error: String },
    /// Error occurred.
    Error { message: String },
}

/// Everything that exists only while running.
struct Running {
    engine: SessionEngine,
    inbound_token: CancellationToken,
    inbound_task: JoinHandle<()>,
    tracker: TaskTracker,
    link: Option<LinkClient>,
}

/// Agent orchestrator that manages all subsystems.
pub struct AgentOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    spawner: Arc<dyn PtySpawner>,
    /// Transport supplied up front instead of built from configuration.
    transport: Option<TransportLink>,
    running: Option<Running>,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl AgentOrchestrator {
    /// Creates an orchestrator whose transport is built from `config`.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        config
            .control
            .require_credentials()
            .context("Control plane credentials are required")?;
        Ok(Self::build(config, None))
    }

    /// Creates an orchestrator on an already connected transport.
    pub fn with_transport(config: Config, link: TransportLink) -> Self {
        Self::build(config, Some(link))
    }

    fn build(config: Config, transport: Option<TransportLink>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            spawner: Arc::new(NativePtySpawner),
            transport,
            running: None,
            shutdown_token: CancellationToken::new(),
            event_tx,
        }
    }

    /// Replace the PTY spawner. Only effective before `start`.
    pub fn with_spawner(mut self, spawner: Arc<dyn PtySpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// The session engine, while running.
    pub fn engine(&self) -> Option<&SessionEngine> {
        self.running.as_ref().map(|running| &running.engine)
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Starts the orchestrator.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting agent orchestrator...");

        let link = match self.transport.take() {
            Some(link) => link,
            None => transport::start(&self.config, self.shutdown_token.child_token())
                .context("Failed to start transport")?,
        };
        let TransportLink {
            sender,
            responder,
            inbound,
            link,
        } = link;

        let engine = SessionEngine::new(
            EngineSettings::from_config(&self.config),
            Arc::clone(&self.spawner),
            sender,
        );
        let dispatcher = Dispatcher::builder()
            .register(TerminalChannel::new(engine.clone()))
            .context("Failed to register channel handlers")?
            .build();
        debug!(scopes = ?dispatcher.scopes(), "Dispatcher ready");

        let inbound_token = self.shutdown_token.child_token();
        let tracker = TaskTracker::new();
        let inbound_loop = InboundLoop {
            dispatcher,
            engine: engine.clone(),
            responder,
            tracker: tracker.clone(),
            event_tx: self.event_tx.clone(),
        };
        let inbound_task = tokio::spawn(inbound_loop.run(inbound, inbound_token.clone()));

        self.running = Some(Running {
            engine,
            inbound_token,
            inbound_task,
            tracker,
            link,
        });

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Running;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Agent orchestrator started successfully");
        Ok(())
    }

    /// Stops the orchestrator gracefully.
    ///
    /// Stops taking requests, lets in-flight ones finish, closes every
    /// session (notifying the peer) and only then tears the transport down.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping agent orchestrator...");

        if let Some(running) = self.running.take() {
            running.inbound_token.cancel();
            if let Err(e) = running.inbound_task.await {
                warn!("Inbound loop ended abnormally: {}", e);
            }

            running.tracker.close();
            if tokio::time::timeout(DRAIN_TIMEOUT, running.tracker.wait())
                .await
                .is_err()
            {
                warn!(
                    pending = running.tracker.len(),
                    "In-flight requests did not finish in time"
                );
            }

            running.engine.shutdown().await;
            drop(running.link);
        }

        self.shutdown_token.cancel();

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Stopped;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Agent orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }
}

// ============================================================================
// Inbound loop
// ============================================================================

struct InboundLoop {
    dispatcher: Dispatcher,
    engine: SessionEngine,
    responder: Arc<dyn ResponseSender>,
    tracker: TaskTracker,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl InboundLoop {
    async fn run(self, mut inbound: mpsc::Receiver<Inbound>, token: CancellationToken) {
        loop {
            let item = tokio::select! {
                _ = token.cancelled() => {
                    info!("Inbound loop received shutdown signal");
                    break;
                }
                item = inbound.recv() => item,
            };

            match item {
                // Each item gets its own task: a `data` call waiting for its
                // turn must not hold up anything else.
                Some(item) => {
                    self.tracker.spawn(self.handle(item));
                }
                None => {
                    warn!("Inbound channel closed");
                    let _ = self.event_tx.send(OrchestratorEvent::Error {
                        message: "inbound channel closed".to_string(),
                    });
                    break;
                }
            }
        }
    }

    fn handle(&self, item: Inbound) -> impl std::future::Future<Output = ()> + Send + 'static {
        let dispatcher = self.dispatcher.clone();
        let engine = self.engine.clone();
        let responder = Arc::clone(&self.responder);
        let event_tx = self.event_tx.clone();

        async move {
            match item {
                Inbound::Request(request) => {
                    let response = dispatcher.dispatch(request).await;
                    let event = OrchestratorEvent::RequestHandled {
                        request_id: response.request_id.clone(),
                        errored: response.errored,
                    };
                    if let Err(e) = responder.respond(response).await {
                        warn!(error = %e, "Failed to deliver response");
                    }
                    let _ = event_tx.send(event);
                }
                Inbound::Input { session_id, input } => {
                    let request = DataRequest {
                        id: session_id.clone(),
                        data: input.data,
                        sequence: input.sequence,
                    };
                    if let Err(e) = engine.data(request).await {
                        debug!(session_id = %session_id, error = %e, "Streamed input refused");
                        let _ = event_tx.send(OrchestratorEvent::StreamRejected {
                            session_id,
                            error: e.to_string(),
                        });
                    }
                }
                Inbound::ConsumeConfirm {
                    session_id,
                    sequence,
                } => {
                    let request = ConsumeConfirmRequest {
                        id: session_id.clone(),
                        sequence,
                    };
                    if let Err(e) = engine.consume_confirm(request).await {
                        debug!(session_id = %session_id, error = %e, "Confirmation refused");
                        let _ = event_tx.send(OrchestratorEvent::StreamRejected {
                            session_id,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
    }
}
