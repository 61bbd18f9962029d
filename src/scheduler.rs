// Background scheduler: periodic collection and aggregation orchestrations, retention prune,
// VACUUM (cron expression or fixed interval), Docker discovery, and an app-stats log line.
// An orchestration tick is skipped while the previous run of the same kind is still going.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::adapter::{DOCKER_ADAPTER, DockerStatsAdapter};
use crate::bucket::now_micros;
use crate::cache::MetricCache;
use crate::resources::{IndexSync, ResourceDescriptor, ResourceIndex};
use crate::store::SqliteMetricStore;
use crate::tasks::{
    AggregationOrchestrator, AggregationRun, CollectionOrchestrator, CollectionRun, EngineContext,
};

/// Counters reported by the app-stats log line.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub collection_runs: AtomicU64,
    pub aggregation_runs: AtomicU64,
    pub failed_runs: AtomicU64,
    pub skipped_ticks: AtomicU64,
    pub rows_pruned: AtomicU64,
}

/// Collaborators and shutdown for the scheduler.
pub struct SchedulerDeps {
    pub ctx: EngineContext,
    pub store: Arc<SqliteMetricStore>,
    pub index: Arc<ResourceIndex>,
    pub docker: Option<Arc<DockerStatsAdapter>>,
    pub stats: Arc<SchedulerStats>,
    pub shutdown_rx: tokio::sync::oneshot::Receiver<()>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub collection_interval: Duration,
    pub aggregation_interval: Duration,
    pub prune_interval: Duration,
    pub stats_log_interval: Duration,
    pub discovery_interval: Duration,
    /// Optional cron expression for VACUUM (e.g. "0 0 3 * * *" = 03:00 daily). Uses local time.
    pub vacuum_schedule: Option<String>,
    /// Run VACUUM every N seconds when vacuum_schedule is not set.
    pub vacuum_interval_secs: u64,
    pub collection: CollectionRun,
    /// `None` when no metrics are configured for rollup.
    pub aggregation: Option<AggregationRun>,
}

pub fn spawn(deps: SchedulerDeps, config: SchedulerConfig) -> JoinHandle<()> {
    tokio::spawn(run(deps, config))
}

async fn run(deps: SchedulerDeps, config: SchedulerConfig) {
    let SchedulerDeps {
        ctx,
        store,
        index,
        docker,
        stats,
        mut shutdown_rx,
    } = deps;

    let mut collection_tick = interval(config.collection_interval);
    collection_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut aggregation_tick = interval(config.aggregation_interval);
    aggregation_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut prune_tick = interval(config.prune_interval);
    prune_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut stats_log_tick = interval(config.stats_log_interval);
    stats_log_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut discovery_tick = interval(config.discovery_interval);
    discovery_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let vacuum_interval = Duration::from_secs(config.vacuum_interval_secs);
    let (vacuum_cron, mut vacuum_delay) = match config.vacuum_schedule.as_deref() {
        Some(expr) => match cron::Schedule::from_str(expr) {
            Ok(schedule) => {
                let delay = next_vacuum_delay(Some(&schedule), vacuum_interval, chrono::Local::now());
                (Some(schedule), delay)
            }
            Err(e) => {
                warn!(cron = %expr, error = %e, "invalid vacuum_schedule; VACUUM will not run");
                (None, None)
            }
        },
        None => (None, Some(vacuum_interval)),
    };
    let vacuum_sleep = tokio::time::sleep(vacuum_delay.unwrap_or(vacuum_interval));
    tokio::pin!(vacuum_sleep);

    let mut collection_run: Option<JoinHandle<()>> = None;
    let mut aggregation_run: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("Scheduler shutting down");
                break;
            }
            _ = discovery_tick.tick(), if docker.is_some() => {
                if let Some(docker) = &docker {
                    match docker.discover().await {
                        Ok(found) => {
                            let sync = sync_discovered(&index, ctx.cache.as_ref(), DOCKER_ADAPTER, found).await;
                            if sync.added > 0 || !sync.removed.is_empty() {
                                info!(
                                    added = sync.added,
                                    removed = sync.removed.len(),
                                    operation = "docker_discovery",
                                    "resource index updated"
                                );
                            }
                        }
                        Err(e) => warn!(error = %e, operation = "docker_discovery", "container discovery failed"),
                    }
                }
            }
            _ = collection_tick.tick() => {
                if is_running(&collection_run) {
                    stats.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                    debug!(operation = "collection", "previous run still in progress; skipping tick");
                    continue;
                }
                let orchestrator = CollectionOrchestrator::new(ctx.clone());
                let run = config.collection.clone();
                let stats = stats.clone();
                collection_run = Some(tokio::spawn(async move {
                    stats.collection_runs.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = orchestrator.run(run).await {
                        stats.failed_runs.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, operation = "collection", "collection orchestration failed");
                    }
                }));
            }
            _ = aggregation_tick.tick(), if config.aggregation.is_some() => {
                let Some(run) = config.aggregation.clone() else {
                    continue;
                };
                if is_running(&aggregation_run) {
                    stats.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                    debug!(operation = "aggregation", "previous run still in progress; skipping tick");
                    continue;
                }
                let orchestrator = AggregationOrchestrator::new(ctx.clone());
                let stats = stats.clone();
                aggregation_run = Some(tokio::spawn(async move {
                    stats.aggregation_runs.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = orchestrator.run(run).await {
                        stats.failed_runs.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, operation = "aggregation", "aggregation orchestration failed");
                    }
                }));
            }
            _ = prune_tick.tick() => {
                prune(&ctx, &stats).await;
            }
            () = &mut vacuum_sleep, if vacuum_delay.is_some() => {
                if let Err(e) = store.vacuum().await {
                    warn!(error = %e, "vacuum failed");
                } else {
                    info!("vacuum complete");
                }
                vacuum_delay = next_vacuum_delay(vacuum_cron.as_ref(), vacuum_interval, chrono::Local::now());
                if let Some(delay) = vacuum_delay {
                    vacuum_sleep.as_mut().reset(tokio::time::Instant::now() + delay);
                }
            }
            _ = stats_log_tick.tick() => {
                let resources = index.len().await;
                info!(
                    resources,
                    collection_runs = stats.collection_runs.load(Ordering::Relaxed),
                    aggregation_runs = stats.aggregation_runs.load(Ordering::Relaxed),
                    failed_runs = stats.failed_runs.load(Ordering::Relaxed),
                    skipped_ticks = stats.skipped_ticks.load(Ordering::Relaxed),
                    rows_pruned = stats.rows_pruned.load(Ordering::Relaxed),
                    "app stats"
                );
            }
        }
    }

    // In-flight runs resume from durable checkpoints on the next start.
    for handle in [collection_run, aggregation_run].into_iter().flatten() {
        handle.abort();
    }
}

fn is_running(handle: &Option<JoinHandle<()>>) -> bool {
    handle.as_ref().is_some_and(|h| !h.is_finished())
}

/// Delete expired raw samples, aggregate records and journal entries.
pub async fn prune(ctx: &EngineContext, stats: &SchedulerStats) {
    let now = now_micros();
    match ctx.store.prune_expired(now).await {
        Ok(rows) => {
            stats.rows_pruned.fetch_add(rows, Ordering::Relaxed);
            debug!(operation = "prune_expired", rows, "expired metrics pruned");
        }
        Err(e) => warn!(error = %e, operation = "prune_expired", "Failed to prune expired metrics"),
    }
    if let Some(journal) = &ctx.journal {
        match journal.purge_expired(now).await {
            Ok(0) => {}
            Ok(tasks) => info!(tasks, operation = "purge_expired", "expired task journal entries purged"),
            Err(e) => warn!(error = %e, operation = "purge_expired", "Failed to purge task journal"),
        }
    }
}

/// Register the resources an adapter discovered and drop cached metrics of the ones that are gone.
pub async fn sync_discovered(
    index: &ResourceIndex,
    cache: &dyn MetricCache,
    adapter: &str,
    found: Vec<ResourceDescriptor>,
) -> IndexSync {
    let sync = index.sync_adapter(adapter, found).await;
    for resource_id in &sync.removed {
        if let Err(e) = cache.forget(resource_id).await {
            warn!(error = %e, resource_id = %resource_id, operation = "forget", "failed to drop cached metrics");
        }
    }
    sync
}

/// Delay until the next VACUUM: the next cron fire time in local time, or the fixed interval.
/// `None` when the cron schedule has no upcoming fire time.
fn next_vacuum_delay(
    schedule: Option<&cron::Schedule>,
    interval: Duration,
    now: chrono::DateTime<chrono::Local>,
) -> Option<Duration> {
    match schedule {
        Some(schedule) => schedule
            .after(&now)
            .next()
            .map(|next| (next - now).to_std().unwrap_or(Duration::from_secs(1))),
        None => Some(interval),
    }
}
