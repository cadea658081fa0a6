use crate::config::GatewayConfig;
use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::debug;

/// Opens and cleanly closes a WebSocket to the gateway's control channel.
/// Succeeds only if the handshake completes within `limit`.
pub async fn connect_check(config: &GatewayConfig, limit: Duration) -> Result<()> {
    if !config.is_configured() {
        return Err(anyhow!("Gateway URL is not configured"));
    }

    let ws_url = config.ws_url();
    let mut request = ws_url.as_str().into_client_request()?;
    if let Some(bearer) = config.bearer() {
        request
            .headers_mut()
            .insert("Authorization", HeaderValue::from_str(&format!("Bearer {}", bearer))?);
    }

    let (mut ws, _) = timeout(limit, connect_async(request))
        .await
        .map_err(|_| anyhow!("Timed out connecting to {}", ws_url))??;
    debug!("Gateway WebSocket handshake with {} succeeded", ws_url);

    if let Err(e) = ws.close(None).await {
        debug!("Gateway WebSocket close failed: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_gateway_fails_fast() {
        let err = connect_check(&GatewayConfig::default(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = GatewayConfig::new(format!("http://127.0.0.1:{}", port), "");
        assert!(connect_check(&config, Duration::from_secs(2)).await.is_err());
    }
}
