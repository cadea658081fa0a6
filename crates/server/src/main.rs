use directories::ProjectDirs;
use portico::bridge;
use portico::setup::{SettingsStore, SetupOrchestrator};
use portico::{App, Config};
use portico_client::{CacheNames, CachePolicy, FileStore, HttpFetcher, KeyValueStore, MemoryStore, OfflineCache};
use portico_gateway::{HealthProber, PollerSettings, StatusPoller};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("com", "portico", "portico") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config/default.toml")
    }
}

fn open_store() -> Arc<dyn KeyValueStore> {
    match FileStore::open_default() {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!("Persistent storage unavailable ({}), settings will not survive a restart", e);
            Arc::new(MemoryStore::new())
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "portico=info,portico_gateway=info,portico_client=info".into()),
        )
        .init();

    let config = Config::load_or_default(&get_config_path()).apply_env();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let origin = Url::parse(&config.self_origin())?;
    let probe = Arc::new(
        HealthProber::new(origin)
            .with_local_url(config.gateway.local_url.clone())
            .with_timeout(config.gateway.probe_timeout()),
    );

    let settings = SettingsStore::new(open_store());
    let setup = Arc::new(SetupOrchestrator::new(probe.clone(), settings.clone()));

    let poller = StatusPoller::spawn(
        probe.clone(),
        move || Some(settings.load_config()),
        PollerSettings {
            interval: config.gateway.poll_interval(),
            attempt_timeout: config.gateway.probe_timeout(),
        },
    );

    let cache = Arc::new(OfflineCache::new(
        HttpFetcher::new(),
        CacheNames::for_version(&config.cache.version),
        CachePolicy {
            api_max_age: config.cache.api_max_age(),
        },
    ));
    let evicted = cache.install().await;
    if !evicted.is_empty() {
        info!("Evicted {} stale cache bucket(s)", evicted.len());
    }

    let app = Arc::new(App::new(
        setup.clone(),
        poller.subscribe(),
        cache,
        config.gateway.probe_timeout(),
    ));

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!("Portico running at http://{}", config.bind_addr());

    // Discovery probes our own /api/ping, so it starts once the listener is up.
    let setup_for_init = setup.clone();
    tokio::spawn(async move { setup_for_init.initialize().await });

    let shutdown = CancellationToken::new();
    let shutdown_on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
        }
        shutdown_on_signal.cancel();
    });

    bridge::serve(listener, app, shutdown).await;
    poller.stop();
    Ok(())
}
