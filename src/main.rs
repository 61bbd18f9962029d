use anyhow::Result;
use metric_rollup::*;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

use metric_rollup::adapter::{AdapterRegistry, DOCKER_ADAPTER, DockerStatsAdapter, HostStatsAdapter};
use metric_rollup::cache::InMemoryMetricCache;
use metric_rollup::resources::{ResourceIndex, ResourceSelector};
use metric_rollup::store::SqliteMetricStore;
use metric_rollup::tasks::{AggregationRun, CollectionRun, EngineContext};

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();

    let app_config = config::AppConfig::load()?;

    let store = Arc::new(
        SqliteMetricStore::connect(
            &app_config.database.path,
            app_config.database.max_pool_size,
            app_config.database.retention_days,
        )
        .await?,
    );
    store.init().await?;
    let journal = store.journal();
    let purged = journal.purge_expired(bucket::now_micros()).await?;
    if purged > 0 {
        tracing::info!(tasks = purged, "Purged expired task journal entries");
    }

    let cache = Arc::new(InMemoryMetricCache::new(
        app_config.publishing.series_capacity,
    ));

    let index = Arc::new(ResourceIndex::new());
    for resource in &app_config.resources {
        index.upsert(resource.descriptor()).await;
    }

    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(HostStatsAdapter::new()));
    let docker = if app_config.docker.enabled {
        let docker = Arc::new(DockerStatsAdapter::connect()?);
        adapters.register(docker.clone());
        match docker.discover().await {
            Ok(found) => {
                let sync = index.sync_adapter(DOCKER_ADAPTER, found).await;
                tracing::info!(containers = sync.added, "Docker containers registered");
            }
            Err(e) => tracing::warn!(error = %e, "initial container discovery failed"),
        }
        Some(docker)
    } else {
        None
    };
    let resources = index.len().await;
    tracing::info!(
        resources,
        adapters = ?adapters.names(),
        "Resource index ready"
    );

    let ctx = EngineContext {
        store: store.clone(),
        cache: cache.clone(),
        resources: index.clone(),
        adapters,
        journal: Some(journal.clone()),
        settings: app_config.engine_settings(),
    };

    let aggregation = (!app_config.aggregation.metrics.is_empty()).then(|| AggregationRun {
        selector: ResourceSelector::default(),
        metrics: app_config.aggregation.metrics.clone(),
        resolutions: app_config.aggregation.resolutions.clone(),
    });
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let scheduler_handle = scheduler::spawn(
        scheduler::SchedulerDeps {
            ctx,
            store: store.clone(),
            index,
            docker,
            stats: Arc::new(scheduler::SchedulerStats::default()),
            shutdown_rx,
        },
        scheduler::SchedulerConfig {
            collection_interval: Duration::from_secs(app_config.collection.interval_secs),
            aggregation_interval: Duration::from_secs(app_config.aggregation.interval_secs),
            prune_interval: Duration::from_secs(app_config.maintenance.prune_interval_secs),
            stats_log_interval: Duration::from_secs(app_config.monitoring.stats_log_interval_secs),
            discovery_interval: Duration::from_secs(app_config.docker.discovery_interval_secs),
            vacuum_schedule: app_config.maintenance.vacuum_schedule.clone(),
            vacuum_interval_secs: app_config.maintenance.vacuum_interval_secs,
            collection: CollectionRun {
                adapter_override: app_config.collection.adapter_override.clone(),
                ..Default::default()
            },
            aggregation,
        },
    );

    let app = routes::app(store, cache, Some(journal));
    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{}", addr);

    let in_container = std::path::Path::new("/.dockerenv").exists()
        || std::env::var("CONTAINER").as_deref() == Ok("1");

    if in_container {
        // In Docker: run server until error or SIGTERM (no signal handler; avoids immediate exit)
        axum::serve(listener, app).await?;
    } else {
        tokio::select! {
            result = axum::serve(listener, app) => {
                result?;
            }
            _ = async {
                #[cfg(unix)]
                {
                    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                        Ok(s) => s,
                        Err(_) => {
                            let _ = tokio::signal::ctrl_c().await;
                            return;
                        }
                    };
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = tokio::signal::ctrl_c().await;
                }
            } => {
                tracing::info!("Received shutdown signal");
                let _ = shutdown_tx.send(());
                let _ = scheduler_handle.await;
            }
        }
    }

    Ok(())
}
