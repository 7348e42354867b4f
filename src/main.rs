use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cellgrid_host::config::{HostConfig, MapConfig};
use cellgrid_host::grid::{MapKey, MapPool, WorldService};
use cellgrid_host::host::{AuthorityHost, Host};
use cellgrid_host::log::LogSink;
use cellgrid_host::metrics::Metrics;
use cellgrid_host::net::session::ConnectionIdentity;
use cellgrid_host::persistence::{InMemoryPersistence, MapDefinition, Persistence, PersistenceExt};
use cellgrid_host::world::{Registry, RegistryRole};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Cellgrid host v{}", env!("CARGO_PKG_VERSION"));

    let config = HostConfig::load_or_default();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid host configuration")?;
    info!(
        "Configuration loaded: {}:{}, tick_rate={}, max_map_workers={}",
        config.bind_address, config.port, config.tick_rate, config.max_map_workers
    );

    // Seed the store with the default map when nothing else provides one
    let persistence = Arc::new(InMemoryPersistence::new());
    let default_map = MapConfig::default();
    default_map
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid default map")?;
    persistence.store(&MapDefinition::from(&default_map))?;

    let metrics = Arc::new(Metrics::new());
    let log = LogSink::new("host", config.log_level);
    let max_workers = config.max_map_workers;
    let metrics_port = config.metrics_port;

    let host = AuthorityHost::start(config, log.clone(), metrics.clone()).await?;
    info!("Authority listening on {}", host.local_addr());

    let registry = Arc::new(Registry::new(
        RegistryRole::Authority,
        host.context().connections().clone(),
        Arc::new(ConnectionIdentity),
        log.child("registry"),
        metrics.clone(),
    ));
    let pool = Arc::new(MapPool::new(registry, max_workers, log.child("maps"), metrics.clone()));
    for definition in persistence.load_all::<MapDefinition>()? {
        let keys = pool.load_definition(&definition, persistence.as_ref())?;
        info!("Loaded map '{}' ({} instance(s))", definition.name, keys.len());
    }

    let store: Arc<dyn Persistence> = persistence.clone();
    host.install_service(Arc::new(WorldService::new(
        pool,
        store,
        MapKey::new(default_map.name.clone(), 0),
    )))?;

    if let Some(port) = metrics_port {
        #[cfg(feature = "metrics_http")]
        {
            let metrics = metrics.clone();
            tokio::spawn(async move {
                if let Err(e) = cellgrid_host::metrics::start_metrics_server(metrics, port).await {
                    tracing::error!("Metrics server error: {}", e);
                }
            });
        }
        #[cfg(not(feature = "metrics_http"))]
        tracing::warn!("METRICS_PORT {} ignored; built without metrics_http", port);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    info!("Shutdown signal received");

    host.stop().await;
    info!("Host stopped");
    Ok(())
}
