// Per-resource collector: GET_DESCRIPTION -> GET_LAST_COLLECTION_TIME -> COLLECT_STATS -> FINISHED.

use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::publisher::WriteOp;
use super::{EngineContext, StageJournal};
use crate::adapter::{StatsAdapter, StatsRequest, StatsResponse};
use crate::bucket::{
    Resolution, is_bucketable, last_collection_key, last_collection_stat_key, now_micros,
};
use crate::error::{Result, RollupError};
use crate::models::{
    AggregateRecord, CollectionStage, RawSample, StageName, StatValue, TaskKind,
    group_by_timestamp,
};
use crate::store::DurableWrite;

/// Adapter name used for the last-collection marker of a resource without any adapter.
const NO_ADAPTER: &str = "none";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRequest {
    pub resource_id: String,
    /// Used only if the resource lists it among its supported adapters; otherwise
    /// the resource is treated as having no adapter for this run.
    pub adapter_override: Option<String>,
}

impl CollectionRequest {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            adapter_override: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionOutcome {
    pub adapter: Option<String>,
    pub batches: usize,
    pub samples: usize,
    pub skipped: usize,
}

#[derive(Default)]
struct CollectionState {
    adapter: Option<Arc<dyn StatsAdapter>>,
    adapter_name: Option<String>,
    last_collection_micros: Option<i64>,
    outcome: CollectionOutcome,
}

pub struct ResourceCollector {
    ctx: EngineContext,
}

impl ResourceCollector {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, request), fields(task = "collection", resource_id = %request.resource_id))]
    pub async fn run(&self, request: CollectionRequest) -> Result<CollectionOutcome> {
        if request.resource_id.is_empty() {
            return Err(RollupError::invalid_task("", "resource id is required"));
        }
        let expiration = self.ctx.settings.collection_expiration;
        let mut journal = StageJournal::start(
            self.ctx.journal.clone(),
            TaskKind::Collection,
            &request.resource_id,
            expiration,
        );
        let mut state = CollectionState::default();
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
            warn!(error = %e, task_id = journal.task_id(), "collection failed");
            journal
                .enter(CollectionStage::Failed, None, Some(e.to_string()))
                .await;
            return Err(e);
        }
        journal.enter(CollectionStage::Finished, None, None).await;
        info!(
            task_id = journal.task_id(),
            adapter = ?state.outcome.adapter,
            batches = state.outcome.batches,
            samples = state.outcome.samples,
            "collection finished"
        );
        Ok(state.outcome)
    }

    async fn drive(
        &self,
        request: &CollectionRequest,
        journal: &mut StageJournal,
        state: &mut CollectionState,
    ) -> Result<()> {
        let mut stage = CollectionStage::GetDescription;
        while !stage.is_terminal() {
            journal
                .enter(stage, None, state.adapter_name.clone())
                .await;
            stage = match stage {
                CollectionStage::GetDescription => self.get_description(request, state).await?,
                CollectionStage::GetLastCollectionTime => {
                    self.get_last_collection_time(request, state).await?
                }
                CollectionStage::CollectStats => self.collect_stats(request, state).await?,
                CollectionStage::Finished | CollectionStage::Failed => break,
            };
        }
        Ok(())
    }

    async fn get_description(
        &self,
        request: &CollectionRequest,
        state: &mut CollectionState,
    ) -> Result<CollectionStage> {
        let description = self
            .ctx
            .resources
            .describe(&request.resource_id)
            .await?
            .ok_or_else(|| RollupError::ResourceNotFound {
                resource_id: request.resource_id.clone(),
            })?;
        let Some(name) = description.select_adapter(request.adapter_override.as_deref()) else {
            self.record_no_adapter(request).await?;
            return Ok(CollectionStage::Finished);
        };
        let adapter = self.ctx.adapters.get(&name).ok_or_else(|| {
            RollupError::invalid_task(
                &request.resource_id,
                format!("stats adapter {} is not registered", name),
            )
        })?;
        state.adapter = Some(adapter);
        state.adapter_name = Some(name.clone());
        state.outcome.adapter = Some(name);
        Ok(CollectionStage::GetLastCollectionTime)
    }

    /// Resource without a stats endpoint: record a zero last-collection marker and stop.
    async fn record_no_adapter(&self, request: &CollectionRequest) -> Result<()> {
        let now = now_micros();
        let name = request.adapter_override.as_deref().unwrap_or(NO_ADAPTER);
        let ops = vec![
            WriteOp::Durable(DurableWrite::Aggregate(AggregateRecord::marker(
                &request.resource_id,
                last_collection_key(name),
                0.0,
                now,
                now,
            ))),
            WriteOp::Stat {
                resource_id: request.resource_id.clone(),
                key: last_collection_stat_key(name),
                stat: StatValue {
                    latest_value: 0.0,
                    source_micros: now,
                },
            },
        ];
        self.ctx.publisher().publish(ops).await?;
        Ok(())
    }

    /// In-memory stat first; durable marker when the cache misses or fails.
    async fn get_last_collection_time(
        &self,
        request: &CollectionRequest,
        state: &mut CollectionState,
    ) -> Result<CollectionStage> {
        let Some(adapter) = state.adapter_name.as_deref() else {
            return Ok(CollectionStage::Finished);
        };
        let stat_key = last_collection_stat_key(adapter);
        let cached = match self.ctx.cache.stats(&request.resource_id).await {
            Ok(stats) => stats.get(&stat_key).map(|s| s.source_micros),
            Err(e) => {
                warn!(error = %e, operation = "get_last_collection_time", "stats cache lookup failed");
                None
            }
        };
        state.last_collection_micros = match cached {
            Some(t) => Some(t),
            None => {
                match self
                    .ctx
                    .store
                    .latest_aggregate(&request.resource_id, &last_collection_key(adapter))
                    .await
                {
                    Ok(record) => record.map(|r| r.timestamp_micros),
                    Err(e) => {
                        // Collection still runs; the adapter just gets no window hint.
                        warn!(error = %e, operation = "get_last_collection_time", "durable lookup failed");
                        None
                    }
                }
            }
        };
        Ok(CollectionStage::CollectStats)
    }

    async fn collect_stats(
        &self,
        request: &CollectionRequest,
        state: &mut CollectionState,
    ) -> Result<CollectionStage> {
        let (Some(adapter), Some(adapter_name)) = (state.adapter.clone(), state.adapter_name.clone())
        else {
            return Ok(CollectionStage::Finished);
        };
        // Captured before the adapter call: samples the provider timestamps between this
        // instant and the call itself can be reported again by the next collection.
        let collection_started = now_micros();
        let mut batches = adapter
            .request_stats(StatsRequest {
                resource_id: request.resource_id.clone(),
                last_collection_micros: state.last_collection_micros,
            })
            .await?;

        while let Some(batch) = batches.next().await {
            let batch = batch?;
            let is_final = batch.is_final_batch;
            self.persist_batch(request, &adapter_name, collection_started, batch, state)
                .await?;
            state.outcome.batches += 1;
            if is_final {
                return Ok(CollectionStage::Finished);
            }
        }
        Err(RollupError::IncompleteStream {
            adapter: adapter_name,
            resource_id: request.resource_id.clone(),
        })
    }

    async fn persist_batch(
        &self,
        request: &CollectionRequest,
        adapter_name: &str,
        collection_started: i64,
        batch: StatsResponse,
        state: &mut CollectionState,
    ) -> Result<()> {
        if batch.stats.is_empty() {
            return Ok(());
        }
        let mut samples = Vec::new();
        let mut skipped = 0;
        for compute in batch.stats {
            let resource_id = compute
                .compute_id
                .unwrap_or_else(|| request.resource_id.clone());
            for (metric, mut values) in compute.stat_values {
                if metric.is_empty() || metric.contains('/') {
                    warn!(metric = %metric, "skipping malformed metric name");
                    skipped += values.len();
                    continue;
                }
                values.sort_by_key(|v| v.source_micros);
                for v in values {
                    if !v.value.is_finite() || !is_bucketable(v.source_micros) {
                        skipped += 1;
                        continue;
                    }
                    samples.push(RawSample {
                        resource_id: resource_id.clone(),
                        metric: metric.clone(),
                        value: v.value,
                        source_micros: v.source_micros,
                    });
                }
            }
        }
        if skipped > 0 {
            warn!(skipped, "skipped malformed samples");
        }
        state.outcome.skipped += skipped;
        state.outcome.samples += samples.len();

        let mut ops = vec![
            WriteOp::Stat {
                resource_id: request.resource_id.clone(),
                key: last_collection_stat_key(adapter_name),
                stat: StatValue {
                    latest_value: collection_started as f64,
                    source_micros: collection_started,
                },
            },
            WriteOp::Durable(DurableWrite::Aggregate(AggregateRecord::marker(
                &request.resource_id,
                last_collection_key(adapter_name),
                collection_started as f64,
                collection_started,
                now_micros(),
            ))),
        ];
        ops.extend(
            group_by_timestamp(samples.iter().cloned())
                .into_iter()
                .map(|doc| WriteOp::Durable(DurableWrite::Raw(doc))),
        );
        if !samples.is_empty() {
            ops.push(WriteOp::Series {
                resolution: Resolution::Hourly,
                samples,
            });
        }
        self.ctx.publisher().publish(ops).await?;
        Ok(())
    }
}
