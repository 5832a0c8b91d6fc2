//! Session lifecycle: discover → connect → stream → stop.
//!
//! `SessionController` holds the one `SessionState` of the process. `start()`
//! only flips the state and spawns the session task, so a UI calling it never
//! waits on the radio. Everything the task does is reported on the
//! `StatusBus`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::gateway::{Connection, Gateway};
use crate::hub::Hub;
use crate::multiplexer::{Multiplexer, MuxItem};
use crate::signal::{ControlIntent, StatusBus, StatusEvent};
use crate::telemetry::{ReadingKind, TelemetryReading};


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Discovering,
    Connected,
    Streaming,
    Stopping,
    Failed(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Discovering => write!(f, "discovering"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Streaming => write!(f, "streaming"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("a session is already running ({0})")]
    AlreadyRunning(SessionState),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name_filter: String,
    pub scan_timeout: Duration,
    pub battery_poll: Duration,
    pub forward_battery: bool,
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        SessionConfig {
            name_filter: config.sensor.name_filter.clone(),
            scan_timeout: config.sensor.scan_timeout(),
            battery_poll: config.sensor.battery_poll(),
            forward_battery: config.relay.forward_battery,
        }
    }
}


pub struct SessionController<G: Gateway> {
    inner: Arc<Inner<G>>,
    active: Mutex<Option<ActiveSession>>,
}

struct ActiveSession {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner<G: Gateway> {
    gateway: G,
    hub: Arc<Hub>,
    bus: StatusBus,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
}

enum StreamEnd {
    Stopped,
    LinkLost,
}

impl<G: Gateway> SessionController<G> {
    pub fn new(gateway: G, hub: Arc<Hub>, bus: StatusBus, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        SessionController {
            inner: Arc::new(Inner {
                gateway,
                hub,
                bus,
                config,
                state,
            }),
            active: Mutex::new(None),
        }
    }

    pub fn gateway(&self) -> &G {
        &self.inner.gateway
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Begins a session in the background. Rejected unless idle, without
    /// waiting for a stop that is still tearing down.
    pub async fn start(&self) -> Result<(), SessionError> {
        let current = self.state();
        if current != SessionState::Idle {
            return Err(SessionError::AlreadyRunning(current));
        }

        let mut active = self.active.lock().await;
        let current = self.state();
        if current != SessionState::Idle {
            return Err(SessionError::AlreadyRunning(current));
        }

        self.inner.state.send_replace(SessionState::Discovering);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&self.inner).run(cancel.clone()));
        *active = Some(ActiveSession { cancel, task });
        Ok(())
    }

    /// Tears the session down and returns to idle, from any state. Also the
    /// way to acknowledge a failure.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        let Some(session) = active.take() else { return; };

        // Cancel before publishing Stopping so the task can't overwrite it
        session.cancel.cancel();
        if !matches!(self.state(), SessionState::Failed(_)) {
            self.inner.state.send_replace(SessionState::Stopping);
        }

        if let Err(err) = session.task.await {
            error!(error = %err, "session task ended abnormally");
        }
        self.inner.state.send_replace(SessionState::Idle);
        info!("session idle");
    }

    /// Applies control intents in arrival order until the sender goes away.
    pub async fn drive(&self, mut intents: mpsc::UnboundedReceiver<ControlIntent>) {
        while let Some(intent) = intents.recv().await {
            match intent {
                ControlIntent::Start => {
                    if let Err(err) = self.start().await {
                        warn!(error = %err, "start ignored");
                    }
                }
                ControlIntent::Stop => self.stop().await,
            }
        }
    }
}

impl<G: Gateway> Inner<G> {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(filter = %self.config.name_filter, "scanning for peripheral");
        self.bus.emit(StatusEvent::Scanning);

        let found = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            found = self.gateway.discover(&self.config.name_filter, self.config.scan_timeout) => found,
        };
        let handle = match found {
            Ok(handle) => handle,
            Err(err) if err.is_not_found() => {
                warn!(error = %err, "no matching peripheral");
                self.bus.emit(StatusEvent::NotFound);
                self.fail(&cancel, "NotFound");
                return;
            }
            Err(err) => {
                self.fail(&cancel, err.to_string());
                return;
            }
        };

        let name = handle.display_name().to_string();
        info!(name = %name, address = %handle.address, "found matching peripheral");
        self.bus.emit(StatusEvent::DeviceFound {
            name: name.clone(),
            address: handle.address.clone(),
        });

        // Not raced against cancel: a connect abandoned halfway can still
        // complete in the platform stack and leave the link up
        let connection = match self.gateway.connect(handle).await {
            Ok(connection) => connection,
            Err(err) => {
                self.fail(&cancel, err.to_string());
                return;
            }
        };
        if cancel.is_cancelled() {
            info!("stopped while connecting, closing the link");
            connection.disconnect().await;
            self.bus.emit(StatusEvent::Disconnected);
            return;
        }
        self.transition(&cancel, SessionState::Connected);
        self.bus.emit(StatusEvent::Connected { name });

        let (tx, rx) = mpsc::unbounded_channel();
        let mux = match Multiplexer::start(Arc::clone(&connection), self.config.battery_poll, tx).await {
            Ok(mux) => mux,
            Err(err) => {
                connection.disconnect().await;
                self.bus.emit(StatusEvent::Disconnected);
                self.fail(&cancel, err.to_string());
                return;
            }
        };
        self.transition(&cancel, SessionState::Streaming);
        info!("streaming");

        let ended = self.pump(&cancel, connection.as_ref(), rx).await;

        // Polling stops first; disconnect unsubscribes before closing the link
        mux.stop().await;
        connection.disconnect().await;
        self.bus.emit(StatusEvent::Disconnected);

        if let StreamEnd::LinkLost = ended {
            self.fail(&cancel, "connection dropped");
        }
    }

    async fn pump(
        &self,
        cancel: &CancellationToken,
        connection: &G::Connection,
        mut rx: mpsc::UnboundedReceiver<MuxItem>,
    ) -> StreamEnd {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Stopped,
                _ = connection.dropped() => {
                    warn!("peripheral link lost");
                    return StreamEnd::LinkLost;
                }
                item = rx.recv() => match item {
                    Some(Ok(reading)) => self.deliver(reading).await,
                    Some(Err(err)) => {
                        warn!(error = %err, "could not decode frame");
                        self.bus.emit(StatusEvent::DecodeError { detail: err.to_string() });
                    }
                    None => return StreamEnd::LinkLost,
                },
            }
        }
    }

    async fn deliver(&self, reading: TelemetryReading) {
        match reading.kind {
            ReadingKind::HeartRate { bpm } => self.bus.emit(StatusEvent::HeartRate { bpm }),
            ReadingKind::BatteryLevel { percent } => self.bus.emit(StatusEvent::BatteryLevel { percent }),
        }

        if reading.is_heart_rate() || self.config.forward_battery {
            self.hub.broadcast(&reading).await;
        }
    }

    /// Publishes `next` unless a stop is already under way.
    fn transition(&self, cancel: &CancellationToken, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if cancel.is_cancelled() {
                return false;
            }
            *state = next;
            true
        })
    }

    fn fail(&self, cancel: &CancellationToken, reason: impl Into<String>) {
        let reason = reason.into();
        if self.transition(cancel, SessionState::Failed(reason.clone())) {
            error!(reason = %reason, "session failed");
            self.bus.emit(StatusEvent::Failed { reason });
        }
    }
}
