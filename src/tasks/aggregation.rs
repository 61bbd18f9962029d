// Per-resource aggregator.
//
// GET_LAST_ROLLUP_TIME -> INIT_RESOURCE_QUERY -> PROCESS_RESOURCES (one page per step)
// -> PUBLISH_METRICS -> FINISHED
//
// Checkpoints come from the in-memory stats, falling back to one durable lookup per key.
// Each source resource is served from its in-memory series when that series covers the
// checkpoint, otherwise from one batched raw query per page.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, instrument, warn};

use super::publisher::WriteOp;
use super::{EngineContext, StageJournal};
use crate::bucket::{Resolution, RollupKey, bucket_end, interval_begin, now_micros};
use crate::cache::ResourceTimeSeries;
use crate::error::{Result, RollupError};
use crate::models::{
    AggregateRecord, AggregationStage, MetricPolicy, RawSample, StageName, StatValue, TaskKind,
    TimeBin,
};
use crate::resources::{ResourcePage, ResourceSelector};
use crate::store::{DurableWrite, RawClause, RawQuery};

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationRequest {
    /// Owner of the published records and checkpoints.
    pub resource_id: String,
    pub metrics: Vec<MetricPolicy>,
    pub resolutions: Vec<Resolution>,
    /// Source resources. Defaults to the owner itself.
    pub selector: Option<ResourceSelector>,
}

impl AggregationRequest {
    pub fn new(resource_id: impl Into<String>, metrics: Vec<MetricPolicy>) -> Self {
        Self {
            resource_id: resource_id.into(),
            metrics,
            resolutions: vec![Resolution::Hourly],
            selector: None,
        }
    }

    /// Every `(metric, resolution)` rollup key, in metric order.
    pub fn rollup_keys(&self) -> Vec<RollupKey> {
        self.metrics
            .iter()
            .flat_map(|m| {
                self.resolutions
                    .iter()
                    .map(|r| RollupKey::new(m.name.clone(), *r))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationOutcome {
    pub has_resources: bool,
    pub pages: usize,
    pub records_published: usize,
    /// Checkpoint per rollup key after the run. `None` when still unset.
    pub checkpoints: BTreeMap<String, Option<i64>>,
}

#[derive(Default)]
struct AggregationState {
    checkpoints: BTreeMap<RollupKey, Option<i64>>,
    page: Option<ResourcePage>,
    has_resources: bool,
    pages: usize,
    bins: BTreeMap<RollupKey, BTreeMap<i64, TimeBin>>,
    records_published: usize,
}

pub struct ResourceAggregator {
    ctx: EngineContext,
}

impl ResourceAggregator {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, request), fields(task = "aggregation", resource_id = %request.resource_id))]
    pub async fn run(&self, request: AggregationRequest) -> Result<AggregationOutcome> {
        validate(&request)?;
        let expiration = self.ctx.settings.aggregation_expiration;
        let mut journal = StageJournal::start(
            self.ctx.journal.clone(),
            TaskKind::Aggregation,
            &request.resource_id,
            expiration,
        );
        let mut state = AggregationState::default();
        let result = match tokio::time::timeout(
            expiration,
            self.drive(&request, &mut journal, &mut state),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RollupError::Expired {
                task: journal.task_id().to_string(),
                after_secs: expiration.as_secs(),
            }),
        };
        if let Err(e) = result {
            warn!(error = %e, task_id = journal.task_id(), "aggregation failed");
            journal
                .enter(AggregationStage::Failed, None, Some(e.to_string()))
                .await;
            return Err(e);
        }
        journal.enter(AggregationStage::Finished, None, None).await;
        info!(
            task_id = journal.task_id(),
            has_resources = state.has_resources,
            pages = state.pages,
            records_published = state.records_published,
            "aggregation finished"
        );
        Ok(AggregationOutcome {
            has_resources: state.has_resources,
            pages: state.pages,
            records_published: state.records_published,
            checkpoints: state
                .checkpoints
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        })
    }

    async fn drive(
        &self,
        request: &AggregationRequest,
        journal: &mut StageJournal,
        state: &mut AggregationState,
    ) -> Result<()> {
        let mut stage = AggregationStage::GetLastRollupTime;
        while !stage.is_terminal() {
            let cursor = state
                .page
                .as_ref()
                .and_then(|p| p.next.as_ref())
                .map(|c| c.to_string());
            let detail = format!("pages={} keys={}", state.pages, state.bins.len());
            journal.enter(stage, cursor, Some(detail)).await;
            stage = match stage {
                AggregationStage::GetLastRollupTime => {
                    self.get_last_rollup_time(request, state).await?
                }
                AggregationStage::InitResourceQuery => {
                    self.init_resource_query(request, state).await?
                }
                AggregationStage::ProcessResources => {
                    self.process_resources(request, state).await?
                }
                AggregationStage::PublishMetrics => self.publish_metrics(request, state).await?,
                AggregationStage::Finished | AggregationStage::Failed => break,
            };
        }
        Ok(())
    }

    async fn get_last_rollup_time(
        &self,
        request: &AggregationRequest,
        state: &mut AggregationState,
    ) -> Result<AggregationStage> {
        let keys = request.rollup_keys();
        let cached = match self.ctx.cache.stats(&request.resource_id).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, operation = "get_last_rollup_time", "stats cache lookup failed; querying store");
                BTreeMap::new()
            }
        };
        for key in keys {
            let checkpoint = match cached.get(&key) {
                Some(stat) => Some(stat.latest_value as i64),
                None => self
                    .ctx
                    .store
                    .latest_aggregate(&request.resource_id, &key.to_string())
                    .await?
                    .map(|r| r.timestamp_micros),
            };
            state.checkpoints.insert(key, checkpoint);
        }
        Ok(AggregationStage::InitResourceQuery)
    }

    async fn init_resource_query(
        &self,
        request: &AggregationRequest,
        state: &mut AggregationState,
    ) -> Result<AggregationStage> {
        let selector = request
            .selector
            .clone()
            .unwrap_or_else(|| ResourceSelector::ids([request.resource_id.clone()]));
        let page = self
            .ctx
            .resources
            .first_page(&selector, self.ctx.settings.resource_query_page_size)
            .await?;
        if page.resource_ids.is_empty() {
            state.has_resources = false;
            return Ok(AggregationStage::PublishMetrics);
        }
        state.has_resources = true;
        state.page = Some(page);
        Ok(AggregationStage::ProcessResources)
    }

    async fn process_resources(
        &self,
        request: &AggregationRequest,
        state: &mut AggregationState,
    ) -> Result<AggregationStage> {
        let Some(page) = state.page.take() else {
            return Ok(AggregationStage::PublishMetrics);
        };
        state.pages += 1;
        let policies: HashMap<&str, &MetricPolicy> = request
            .metrics
            .iter()
            .map(|m| (m.name.as_str(), m))
            .collect();

        let mut queued: Vec<(String, RollupKey)> = Vec::new();
        for resource_id in &page.resource_ids {
            for resolution in &request.resolutions {
                let series = match self.ctx.cache.time_series(resource_id, *resolution).await {
                    Ok(series) => series,
                    Err(e) => {
                        warn!(error = %e, resource_id = %resource_id, "time series lookup failed; querying store");
                        None
                    }
                };
                for key in state.checkpoints.keys().filter(|k| k.resolution == *resolution) {
                    let Some(policy) = policies.get(key.metric.as_str()) else {
                        continue;
                    };
                    let checkpoint = state.checkpoints.get(key).copied().flatten();
                    match merge_in_memory(series.as_ref(), key, checkpoint, policy) {
                        InMemory::Bins(bins) => {
                            let target = state.bins.entry(key.clone()).or_default();
                            for (end, bin) in bins {
                                target
                                    .entry(end)
                                    .or_default()
                                    .merge(&bin, &policy.aggregations);
                            }
                        }
                        InMemory::Skip => {}
                        InMemory::QueryStore => queued.push((resource_id.clone(), key.clone())),
                    }
                }
            }
        }

        if !queued.is_empty() {
            self.aggregate_from_store(&queued, &policies, state).await?;
        }

        match page.next {
            Some(cursor) => {
                state.page = Some(self.ctx.resources.next_page(&cursor).await?);
                Ok(AggregationStage::ProcessResources)
            }
            None => Ok(AggregationStage::PublishMetrics),
        }
    }

    async fn aggregate_from_store(
        &self,
        queued: &[(String, RollupKey)],
        policies: &HashMap<&str, &MetricPolicy>,
        state: &mut AggregationState,
    ) -> Result<()> {
        // One clause per (resource, metric); the earliest bound wins when resolutions differ.
        let mut since: BTreeMap<(String, String), Option<i64>> = BTreeMap::new();
        for (resource_id, key) in queued {
            let bound = query_start(state.checkpoints.get(key).copied().flatten(), key);
            since
                .entry((resource_id.clone(), key.metric.clone()))
                .and_modify(|s| {
                    *s = match (*s, bound) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        _ => None,
                    }
                })
                .or_insert(bound);
        }
        let query = RawQuery {
            clauses: since
                .into_iter()
                .map(|((resource_id, metric), since_micros)| RawClause {
                    resource_id,
                    metric,
                    since_micros,
                })
                .collect(),
            limit: self.ctx.settings.raw_result_limit,
        };
        let mut samples = self.ctx.store.query_raw(&query).await?;
        debug!(
            clauses = query.clauses.len(),
            samples = samples.len(),
            "raw samples loaded"
        );
        if samples.len() as u32 >= query.limit {
            warn!(
                limit = query.limit,
                "raw query hit its result limit; oldest samples were not aggregated"
            );
        }
        samples.sort_by_key(|s| s.source_micros);

        for (resource_id, key) in queued {
            let Some(policy) = policies.get(key.metric.as_str()) else {
                continue;
            };
            let bound = query_start(state.checkpoints.get(key).copied().flatten(), key);
            let matching = samples.iter().filter(|s| {
                s.resource_id == *resource_id
                    && s.metric == key.metric
                    && bound.is_none_or(|b| s.source_micros >= b)
            });
            let bins = bin_raw_samples(matching, key.bucket_micros(), policy);
            let target = state.bins.entry(key.clone()).or_default();
            for (end, bin) in bins {
                target
                    .entry(end)
                    .or_default()
                    .merge(&bin, &policy.aggregations);
            }
        }
        Ok(())
    }

    async fn publish_metrics(
        &self,
        request: &AggregationRequest,
        state: &mut AggregationState,
    ) -> Result<AggregationStage> {
        let now = now_micros();
        let owner = &request.resource_id;
        let mut ops = Vec::new();
        let mut records = 0;

        if !state.has_resources {
            // No source resources: publish zero values so downstream readers see the metric.
            for (key, checkpoint) in &state.checkpoints {
                let timestamp = checkpoint.unwrap_or(0);
                ops.push(WriteOp::Durable(DurableWrite::Aggregate(
                    AggregateRecord::marker(owner, key.to_string(), 0.0, timestamp, now),
                )));
                ops.push(stat_op(owner, key, timestamp, now));
                records += 1;
            }
            for checkpoint in state.checkpoints.values_mut() {
                *checkpoint = Some(checkpoint.unwrap_or(0));
            }
        } else {
            let mut published: BTreeSet<RollupKey> = BTreeSet::new();
            for (key, bins) in &state.bins {
                let Some(latest) = bins.keys().next_back().copied() else {
                    continue;
                };
                for (end, bin) in bins {
                    ops.push(WriteOp::Durable(DurableWrite::Aggregate(
                        AggregateRecord::from_bin(owner, key.to_string(), *end, bin.clone(), now),
                    )));
                    records += 1;
                }
                let previous = state.checkpoints.get(key).copied().flatten().unwrap_or(0);
                let checkpoint = latest.max(previous);
                ops.push(stat_op(owner, key, checkpoint, now));
                state.checkpoints.insert(key.clone(), Some(checkpoint));
                published.insert(key.clone());
            }
            // Zero checkpoints spare the next run a durable lookup for keys with no data yet.
            for (key, checkpoint) in state.checkpoints.iter_mut() {
                if published.contains(key) || checkpoint.is_some_and(|c| c > 0) {
                    continue;
                }
                ops.push(stat_op(owner, key, 0, now));
                *checkpoint = Some(0);
            }
        }

        if ops.is_empty() {
            return Ok(AggregationStage::Finished);
        }
        let summary = self.ctx.publisher().publish(ops).await?;
        state.records_published = records;
        debug!(batches = summary.batches, records, "aggregates published");
        Ok(AggregationStage::Finished)
    }
}

fn validate(request: &AggregationRequest) -> Result<()> {
    if request.resource_id.is_empty() {
        return Err(RollupError::invalid_task("", "resource id is required"));
    }
    if request.metrics.is_empty() {
        return Err(RollupError::invalid_task(
            &request.resource_id,
            "at least one metric name is required",
        ));
    }
    if request.resolutions.is_empty() {
        return Err(RollupError::invalid_task(
            &request.resource_id,
            "at least one resolution is required",
        ));
    }
    if let Some(selector) = &request.selector
        && selector.ids.as_ref().is_some_and(|ids| ids.is_empty())
    {
        return Err(RollupError::EmptySelection {
            reason: format!("empty id list for {}", request.resource_id),
        });
    }
    Ok(())
}

fn stat_op(owner: &str, key: &RollupKey, checkpoint: i64, now: i64) -> WriteOp {
    WriteOp::Stat {
        resource_id: owner.to_string(),
        key: key.clone(),
        stat: StatValue {
            latest_value: checkpoint as f64,
            source_micros: now,
        },
    }
}

/// Lower bound of the raw query: start of the bucket holding the instant just before the checkpoint.
fn query_start(checkpoint: Option<i64>, key: &RollupKey) -> Option<i64> {
    checkpoint
        .filter(|c| *c != 0)
        .and_then(|c| c.checked_sub(1))
        .and_then(|c| interval_begin(c, key.bucket_micros()))
}

enum InMemory {
    Bins(Vec<(i64, TimeBin)>),
    Skip,
    QueryStore,
}

/// Decide how one source resource contributes to `key`.
fn merge_in_memory(
    series: Option<&ResourceTimeSeries>,
    key: &RollupKey,
    checkpoint: Option<i64>,
    policy: &MetricPolicy,
) -> InMemory {
    let Some(series) = series else {
        return InMemory::QueryStore;
    };
    let Some(ts) = series.metrics.get(&key.metric) else {
        return InMemory::Skip;
    };
    let covered = match (checkpoint, ts.earliest_bucket_end()) {
        (Some(c), Some(earliest)) => c >= earliest,
        _ => false,
    };
    let Some(checkpoint) = checkpoint.filter(|_| covered) else {
        return InMemory::QueryStore;
    };
    let bins = ts
        .buckets()
        .filter(|(end, _)| *end >= checkpoint)
        .filter_map(|(end, bin)| {
            if policy.latest_value_only {
                let latest = bin.latest?;
                Some((end, TimeBin::single(latest, bin.latest_micros.unwrap_or(end - 1))))
            } else {
                Some((end, bin.clone()))
            }
        })
        .collect();
    InMemory::Bins(bins)
}

/// Bin samples (ascending by source time) by bucket end.
fn bin_raw_samples<'a>(
    samples: impl Iterator<Item = &'a RawSample>,
    bucket_micros: i64,
    policy: &MetricPolicy,
) -> BTreeMap<i64, TimeBin> {
    let mut bins: BTreeMap<i64, TimeBin> = BTreeMap::new();
    if policy.latest_value_only {
        let mut latest: BTreeMap<i64, &RawSample> = BTreeMap::new();
        for s in samples {
            if let Some(end) = bucket_end(s.source_micros, bucket_micros) {
                latest.insert(end, s);
            }
        }
        for (end, s) in latest {
            bins.insert(end, TimeBin::single(s.value, s.source_micros));
        }
    } else {
        for s in samples {
            let Some(end) = bucket_end(s.source_micros, bucket_micros) else {
                continue;
            };
            bins.entry(end)
                .or_default()
                .add_sample(s.value, s.source_micros, &policy.aggregations);
        }
    }
    bins
}
