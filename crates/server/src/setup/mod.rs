//! Gateway setup flow: discover, test, persist and mark the connection as
//! configured. Views read the state; only the operations here change it.

pub mod settings;

use portico_gateway::{GatewayConfig, GatewayProbe};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

pub use settings::SettingsStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupStep {
    Gateway,
    Provider,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Idle,
    Testing,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupState {
    pub is_open: bool,
    pub step: SetupStep,
    pub gateway_url: String,
    pub gateway_token: String,
    pub local_gateway_detected: bool,
    /// `Some("")` when the local gateway answered without a credential.
    pub local_token_guess: Option<String>,
    pub test_status: TestStatus,
    pub test_error: Option<String>,
    pub initialized: bool,
}

impl Default for SetupState {
    fn default() -> Self {
        Self::new()
    }
}

impl SetupState {
    pub fn new() -> Self {
        Self {
            is_open: false,
            step: SetupStep::Gateway,
            gateway_url: String::new(),
            gateway_token: String::new(),
            local_gateway_detected: false,
            local_token_guess: None,
            test_status: TestStatus::Idle,
            test_error: None,
            initialized: false,
        }
    }

    fn clear_test(&mut self) {
        self.test_status = TestStatus::Idle;
        self.test_error = None;
    }
}

const TEST_CANCELLED: &str = "Connection test cancelled";

/// Applies `on_drop` to the state unless disarmed, so a dropped operation
/// (e.g. a disconnected request) cannot leave a transition half done.
struct Unwind<'a> {
    state: &'a watch::Sender<SetupState>,
    on_drop: Option<fn(&mut SetupState)>,
}

impl<'a> Unwind<'a> {
    fn new(state: &'a watch::Sender<SetupState>, on_drop: fn(&mut SetupState)) -> Self {
        Self {
            state,
            on_drop: Some(on_drop),
        }
    }

    fn disarm(mut self) {
        self.on_drop = None;
    }
}

impl Drop for Unwind<'_> {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            self.state.send_modify(on_drop);
        }
    }
}

pub struct SetupOrchestrator<P: ?Sized> {
    probe: Arc<P>,
    settings: SettingsStore,
    state: watch::Sender<SetupState>,
}

impl<P: GatewayProbe + ?Sized> SetupOrchestrator<P> {
    pub fn new(probe: Arc<P>, settings: SettingsStore) -> Self {
        let (state, _) = watch::channel(SetupState::new());
        Self {
            probe,
            settings,
            state,
        }
    }

    pub fn snapshot(&self) -> SetupState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SetupState> {
        self.state.subscribe()
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn local_url(&self) -> &str {
        self.probe.local_url()
    }

    /// Runs discovery once per process; later calls return immediately. If
    /// the call is dropped before discovery finishes, the next call retries.
    pub async fn initialize(&self) {
        let first = self.state.send_if_modified(|s| {
            if s.initialized {
                return false;
            }
            s.initialized = true;
            true
        });
        if !first {
            debug!("Setup already initialized");
            return;
        }
        let unwind = Unwind::new(&self.state, |s| {
            debug!("Setup discovery interrupted");
            s.initialized = false;
        });

        let existing = self.settings.load_config();

        if self.settings.is_configured() {
            // Unhealthy or not, a configured install keeps the wizard closed;
            // the status indicator reports the problem.
            let healthy = self.probe.check(Some(&existing)).await;
            unwind.disarm();
            info!("Gateway previously configured, healthy: {}", healthy);
            return;
        }

        if self.probe.check(Some(&existing)).await {
            unwind.disarm();
            info!("Gateway already reachable, marking setup complete");
            self.settings.mark_configured();
            return;
        }

        let local_detected = self.probe.detect_local().await;
        let token_guess = if local_detected {
            self.probe.detect_local_token().await
        } else {
            None
        };
        let local_url = self.probe.local_url().to_string();
        unwind.disarm();
        info!("Opening gateway setup (local gateway detected: {})", local_detected);

        self.state.send_modify(|s| {
            s.is_open = true;
            s.step = SetupStep::Gateway;
            s.local_gateway_detected = local_detected;
            s.local_token_guess = token_guess;
            s.gateway_url = if !existing.url.is_empty() {
                existing.url.clone()
            } else if local_detected {
                local_url
            } else {
                String::new()
            };
            s.gateway_token = existing.token.clone();
        });
    }

    pub fn set_url(&self, url: impl Into<String>) {
        let url = url.into();
        self.state.send_modify(|s| {
            s.gateway_url = url;
            s.clear_test();
        });
    }

    pub fn set_token(&self, token: impl Into<String>) {
        let token = token.into();
        self.state.send_modify(|s| {
            s.gateway_token = token;
            s.clear_test();
        });
    }

    /// Probes the unsaved URL/token. Always ends in `Success` or `Error`,
    /// including when the call is dropped mid-probe.
    pub async fn test_connection(&self) -> bool {
        let (url, token) = {
            let s = self.state.borrow();
            (s.gateway_url.clone(), s.gateway_token.clone())
        };
        self.state.send_modify(|s| {
            s.test_status = TestStatus::Testing;
            s.test_error = None;
        });
        let unwind = Unwind::new(&self.state, |s| {
            if s.test_status == TestStatus::Testing {
                s.test_status = TestStatus::Error;
                s.test_error = Some(TEST_CANCELLED.to_string());
            }
        });

        let result = self.probe.test(&url, &token).await;
        unwind.disarm();
        self.state.send_modify(|s| {
            if result.reachable {
                s.test_status = TestStatus::Success;
                s.test_error = None;
            } else {
                s.test_status = TestStatus::Error;
                s.test_error = Some(result.failure_reason());
            }
        });
        result.reachable
    }

    pub fn save_and_proceed(&self) {
        let config = {
            let s = self.state.borrow();
            GatewayConfig::new(s.gateway_url.clone(), s.gateway_token.clone())
        };
        self.settings.save_config(&config);
        self.state.send_modify(|s| s.step = SetupStep::Provider);
    }

    /// Skips provider setup. The gateway fields may still be empty.
    pub fn skip(&self) {
        self.finish();
    }

    pub fn complete(&self) {
        self.finish();
    }

    fn finish(&self) {
        self.settings.mark_configured();
        self.state.send_modify(|s| {
            s.is_open = false;
            s.step = SetupStep::Complete;
        });
    }

    pub fn reset(&self) {
        self.settings.clear_configured();
        self.state.send_modify(|s| {
            s.is_open = true;
            s.step = SetupStep::Gateway;
            s.gateway_url.clear();
            s.gateway_token.clear();
            s.local_gateway_detected = false;
            s.local_token_guess = None;
            s.clear_test();
        });
    }

    pub fn open(&self) {
        let existing = self.settings.load_config();
        self.state.send_modify(|s| {
            s.is_open = true;
            s.step = SetupStep::Gateway;
            s.gateway_url = existing.url;
            s.gateway_token = existing.token;
            s.clear_test();
        });
    }
}
