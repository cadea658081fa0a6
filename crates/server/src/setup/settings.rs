use portico_client::KeyValueStore;
use portico_gateway::GatewayConfig;
use std::sync::Arc;
use tracing::warn;

pub const SETUP_STORAGE_KEY: &str = "portico-gateway-configured";
pub const SETTINGS_STORAGE_KEY: &str = "portico-settings";

/// Persisted gateway settings and the "setup completed" marker.
///
/// Storage failures are logged and swallowed: an unreadable store looks like a
/// fresh install, an unwritable one means the wizard shows up again.
#[derive(Clone)]
pub struct SettingsStore {
    store: Arc<dyn KeyValueStore>,
}

impl SettingsStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn load_config(&self) -> GatewayConfig {
        match self.store.get(SETTINGS_STORAGE_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Ignoring unreadable gateway settings: {}", e);
                GatewayConfig::default()
            }),
            Ok(None) => GatewayConfig::default(),
            Err(e) => {
                warn!("Failed to read gateway settings: {}", e);
                GatewayConfig::default()
            }
        }
    }

    pub fn save_config(&self, config: &GatewayConfig) {
        let raw = match serde_json::to_string(config) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to encode gateway settings: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.set(SETTINGS_STORAGE_KEY, &raw) {
            warn!("Failed to save gateway settings: {}", e);
        }
    }

    pub fn is_configured(&self) -> bool {
        match self.store.get(SETUP_STORAGE_KEY) {
            Ok(value) => value.as_deref() == Some("true"),
            Err(e) => {
                warn!("Failed to read setup marker: {}", e);
                false
            }
        }
    }

    pub fn mark_configured(&self) {
        if let Err(e) = self.store.set(SETUP_STORAGE_KEY, "true") {
            warn!("Failed to write setup marker: {}", e);
        }
    }

    pub fn clear_configured(&self) {
        if let Err(e) = self.store.delete(SETUP_STORAGE_KEY) {
            warn!("Failed to clear setup marker: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_client::{ClientError, ClientResult, MemoryStore};

    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> ClientResult<Option<String>> {
            Err(ClientError::Storage("unavailable".to_string()))
        }

        fn set(&self, _key: &str, _value: &str) -> ClientResult<()> {
            Err(ClientError::Storage("unavailable".to_string()))
        }

        fn delete(&self, _key: &str) -> ClientResult<()> {
            Err(ClientError::Storage("unavailable".to_string()))
        }
    }

    #[test]
    fn config_and_marker_round_trip() {
        let settings = SettingsStore::new(Arc::new(MemoryStore::new()));
        assert!(!settings.is_configured());
        assert_eq!(settings.load_config(), GatewayConfig::default());

        let config = GatewayConfig::new("ws://127.0.0.1:18789", "tok");
        settings.save_config(&config);
        settings.mark_configured();
        assert_eq!(settings.load_config(), config);
        assert!(settings.is_configured());

        settings.clear_configured();
        assert!(!settings.is_configured());
    }

    #[test]
    fn storage_failures_degrade_to_unconfigured() {
        let settings = SettingsStore::new(Arc::new(BrokenStore));
        settings.save_config(&GatewayConfig::new("http://x", ""));
        settings.mark_configured();
        settings.clear_configured();

        assert!(!settings.is_configured());
        assert_eq!(settings.load_config(), GatewayConfig::default());
    }

    #[test]
    fn garbage_settings_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        store.set(SETTINGS_STORAGE_KEY, "{not json").unwrap();
        let settings = SettingsStore::new(store);
        assert_eq!(settings.load_config(), GatewayConfig::default());
    }
}
