pub mod config;
pub mod ping;
pub mod poller;
pub mod probe;

pub use config::{redact_url, GatewayConfig};
pub use poller::{ConnectionState, GatewayStatus, PollerSettings, StatusPoller};
pub use probe::{GatewayProbe, HealthProbeResult, HealthProber, LOCAL_GATEWAY_URL};
