// THEORY:
// A `LiveSession` runs the sampler, the transport channel and the reconciler
// together as one unit with a single lifecycle:
//
//   Idle -> Connecting -> Live -> Stopping -> Idle
//   Connecting | Live -> Failed   (any fatal error, no automatic retry)
//
// Key architectural principles:
// 1.  **One owner**: the capture device and the connection are owned by a
//     single driver task spawned on `start`. Nothing else holds them, so there
//     are no shared handles to leak and several sessions can run side by side.
// 2.  **One cancellation point**: `stop` signals the driver and waits for it.
//     The driver always tears down in the same order (sampler first, which
//     releases the device, then the connection), whether it was asked to stop
//     or hit a fatal error.
// 3.  **The loop never blocks**: grabbing and encoding run on a blocking
//     worker, and the loop only hears back when a capture is done. Analyzer
//     messages and `stop` are served while a slow camera is still grabbing.
// 4.  **Status is published, not polled**: state transitions go through a
//     `watch` channel so UIs can await them, and the last failure message stays
//     visible after the pipeline has been torn down.

use crate::config::SessionConfig;
use crate::core_modules::frame_sampler::{CaptureGuard, FrameSampler, SampleOutcome, VideoSource};
use crate::core_modules::reconciler::{LiveState, Reconciler};
use crate::core_modules::spatial_index::{CellDrillDown, ContainerBounds};
use crate::core_modules::transport::{ChannelEvent, Connector, TransportChannel, WsConnector};
use crate::error::{LiveError, Result};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Live,
    Stopping,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Live => "live",
            SessionState::Stopping => "stopping",
            SessionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Lifecycle state plus the last failure, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub error_message: Option<String>,
}

impl SessionStatus {
    fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            error_message: None,
        }
    }
}

struct Driver {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// A live analysis session against one analyzer endpoint.
pub struct LiveSession {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    reconciler: Reconciler,
    status: Arc<watch::Sender<SessionStatus>>,
    driver: Option<Driver>,
}

impl LiveSession {
    /// A session that connects over a real WebSocket.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_connector(config, WsConnector)
    }

    pub fn with_connector(config: SessionConfig, connector: impl Connector) -> Self {
        let (status, _) = watch::channel(SessionStatus::idle());
        Self {
            reconciler: Reconciler::new(config.capacities),
            config,
            connector: Arc::new(connector),
            status: Arc::new(status),
            driver: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// A receiver that observes every merged payload.
    pub fn subscribe_state(&self) -> watch::Receiver<LiveState> {
        self.reconciler.subscribe()
    }

    /// An owned copy of the current render state.
    pub fn snapshot(&self) -> LiveState {
        self.reconciler.snapshot()
    }

    /// Drill-down for the cell under a pointer, or `None` if nothing resolves.
    pub fn resolve_cell(&self, x: f64, y: f64, bounds: ContainerBounds) -> Option<CellDrillDown> {
        self.reconciler.read(|state| state.resolve_cell(x, y, bounds))
    }

    /// Starts streaming from `source`. Valid from `Idle` and `Failed`.
    ///
    /// Resets every buffer and the per-cell history, then connects in the
    /// background. The source is acquired only once the connection is open.
    /// Must be called from within a tokio runtime.
    pub fn start<S: VideoSource + 'static>(&mut self, source: S) -> Result<()> {
        let current = self.state();
        if !matches!(current, SessionState::Idle | SessionState::Failed) {
            return Err(LiveError::InvalidTransition {
                action: "start",
                state: current,
            });
        }
        if let Some(finished) = self.driver.take() {
            finished.handle.abort();
        }

        self.reconciler.reset();
        self.status.send_replace(SessionStatus {
            state: SessionState::Connecting,
            error_message: None,
        });
        info!(endpoint = %self.config.endpoint, "session connecting");

        let (stop_tx, stop_rx) = oneshot::channel();
        let run = DriverRun {
            config: self.config.clone(),
            connector: Arc::clone(&self.connector),
            reconciler: self.reconciler.clone(),
            status: Arc::clone(&self.status),
        };
        let handle = tokio::spawn(run.drive(CaptureGuard::new(source), stop_rx));
        self.driver = Some(Driver { stop_tx, handle });
        Ok(())
    }

    /// Stops the pipeline and waits until the device and the connection are
    /// released. Always ends in `Idle`; a failure message from the run that
    /// just ended is kept. Calling it again, or with nothing running, is a
    /// no-op.
    pub async fn stop(&mut self) {
        if let Some(driver) = self.driver.take() {
            self.status.send_if_modified(|status| {
                if matches!(status.state, SessionState::Connecting | SessionState::Live) {
                    status.state = SessionState::Stopping;
                    true
                } else {
                    false
                }
            });
            let _ = driver.stop_tx.send(());
            if let Err(err) = driver.handle.await {
                error!(error = %err, "session driver ended abnormally");
                self.status.send_modify(|status| {
                    status.error_message = Some(format!("session ended unexpectedly: {err}"));
                });
            }
        }

        self.status.send_if_modified(|status| {
            if status.state == SessionState::Idle {
                return false;
            }
            status.state = SessionState::Idle;
            true
        });
    }
}

/// Everything the driver task needs, moved into it on `start`.
struct DriverRun {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    reconciler: Reconciler,
    status: Arc<watch::Sender<SessionStatus>>,
}

impl DriverRun {
    async fn drive(self, capture: CaptureGuard, mut stop_rx: oneshot::Receiver<()>) {
        let opened = tokio::select! {
            biased;
            _ = &mut stop_rx => {
                drop(capture);
                info!("session stopped before the analyzer answered");
                self.finish(None);
                return;
            }
            opened = TransportChannel::open(self.connector.as_ref(), &self.config.endpoint, self.config.connect_timeout) => opened,
        };
        let mut channel = match opened {
            Ok(channel) => channel,
            Err(err) => {
                drop(capture);
                self.finish(Some(err));
                return;
            }
        };

        let mut sampler = FrameSampler::new(self.config.sample_interval, self.config.jpeg_quality);
        let started = tokio::select! {
            biased;
            _ = &mut stop_rx => {
                channel.close(self.config.close_timeout).await;
                info!("session stopped while the capture device was opening");
                self.finish(None);
                return;
            }
            started = sampler.start(capture) => started,
        };
        if let Err(err) = started {
            channel.close(self.config.close_timeout).await;
            self.finish(Some(err));
            return;
        }

        let went_live = self.status.send_if_modified(|status| {
            if status.state == SessionState::Connecting {
                status.state = SessionState::Live;
                true
            } else {
                false
            }
        });
        if went_live {
            info!("session live");
        }

        let mut frames = channel.frame_sender();
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let failure = loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break None,
                event = channel.next_event() => match event {
                    Some(ChannelEvent::Payload(payload)) => self.reconciler.apply(payload),
                    Some(ChannelEvent::Malformed(reason)) => {
                        warn!(%reason, "dropping malformed analyzer message");
                        self.reconciler.record_dropped();
                    }
                    Some(ChannelEvent::AnalyzerError(message)) => {
                        break Some(LiveError::PayloadError(message));
                    }
                    Some(ChannelEvent::Closed(reason)) => break Some(LiveError::RemoteClosed(reason)),
                    None => break Some(LiveError::RemoteClosed("connection ended".to_string())),
                },
                outcome = sampler.completed(&mut frames) => {
                    if outcome == SampleOutcome::Sent {
                        debug!("frame handed to the analyzer link");
                    }
                }
                _ = ticker.tick() => {
                    sampler.tick(Instant::now());
                }
            }
        };

        sampler.shutdown().await;
        channel.close(self.config.close_timeout).await;
        self.finish(failure);
    }

    fn finish(&self, failure: Option<LiveError>) {
        match failure {
            None => {
                self.status.send_replace(SessionStatus::idle());
                info!("session stopped");
            }
            Some(err) => {
                warn!(error = %err, "session failed");
                self.status.send_replace(SessionStatus {
                    state: SessionState::Failed,
                    error_message: Some(err.to_string()),
                });
            }
        }
    }
}
