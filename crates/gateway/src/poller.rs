use crate::config::GatewayConfig;
use crate::probe::{GatewayProbe, PROBE_TIMEOUT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const POLL_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Offline,
}

impl ConnectionState {
    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Gateway Connected",
            ConnectionState::Offline => "Gateway Offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub state: ConnectionState,
    pub label: String,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Default for GatewayStatus {
    fn default() -> Self {
        Self::new(ConnectionState::Connecting, None)
    }
}

impl GatewayStatus {
    fn new(state: ConnectionState, last_checked: Option<DateTime<Utc>>) -> Self {
        Self {
            state,
            label: state.label().to_string(),
            last_checked,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    pub interval: Duration,
    pub attempt_timeout: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: POLL_INTERVAL,
            attempt_timeout: PROBE_TIMEOUT,
        }
    }
}

/// Keeps the connected/offline indicator current while the handle is alive.
pub struct StatusPoller {
    status: watch::Receiver<GatewayStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl StatusPoller {
    /// `config` is read on every tick so a newly saved gateway is picked up.
    pub fn spawn<P, C>(probe: Arc<P>, config: C, settings: PollerSettings) -> Self
    where
        P: GatewayProbe + ?Sized + 'static,
        C: Fn() -> Option<GatewayConfig> + Send + Sync + 'static,
    {
        let (tx, rx) = watch::channel(GatewayStatus::default());
        let cancel = CancellationToken::new();
        let cancel_child = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_child.cancelled() => {
                        debug!("Status poller stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let current = config();
                        let attempt = timeout(settings.attempt_timeout, probe.check(current.as_ref()));
                        let connected = tokio::select! {
                            _ = cancel_child.cancelled() => {
                                debug!("Status poller stopped during a check");
                                break;
                            }
                            result = attempt => result.unwrap_or(false),
                        };
                        let state = if connected {
                            ConnectionState::Connected
                        } else {
                            ConnectionState::Offline
                        };
                        let previous = tx.borrow().state;
                        if previous != state {
                            info!("Gateway status: {}", state.label());
                        }
                        tx.send_replace(GatewayStatus::new(state, Some(Utc::now())));
                    }
                }
            }
        });

        Self {
            status: rx,
            cancel,
            task,
        }
    }

    pub fn current(&self) -> GatewayStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GatewayStatus> {
        self.status.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
