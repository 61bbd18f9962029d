// Shared test helpers
#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use metric_rollup::adapter::{
    AdapterRegistry, ComputeStats, StatSample, StatsAdapter, StatsRequest, StatsResponse,
    StatsStream,
};
use metric_rollup::bucket::{MICROS_PER_HOUR, Resolution, RollupKey};
use metric_rollup::cache::{InMemoryMetricCache, MetricCache, ResourceTimeSeries};
use metric_rollup::error::{Result, RollupError};
use metric_rollup::models::{RawSample, ResourceMetrics, StatValue};
use metric_rollup::resources::{ResourceDescriptor, ResourceIndex};
use metric_rollup::store::{DurableWrite, MetricStore, SqliteMetricStore};
use metric_rollup::tasks::{EngineContext, EngineSettings};

/// 2026-01-01T00:00:00Z
pub const DAY0: i64 = 1_767_225_600_000_000;

/// `DAY0 + h hours + m minutes`.
pub fn at(h: i64, m: i64) -> i64 {
    DAY0 + h * MICROS_PER_HOUR + m * 60_000_000
}

pub fn hourly(metric: &str) -> RollupKey {
    RollupKey::new(metric, Resolution::Hourly)
}

pub async fn temp_store() -> (TempDir, Arc<SqliteMetricStore>) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("metrics.db");
    let store = SqliteMetricStore::connect(path.to_str().unwrap(), 2, 56)
        .await
        .unwrap();
    store.init().await.unwrap();
    (dir, Arc::new(store))
}

pub struct Harness {
    pub _dir: TempDir,
    pub store: Arc<SqliteMetricStore>,
    pub cache: Arc<InMemoryMetricCache>,
    pub index: Arc<ResourceIndex>,
    pub ctx: EngineContext,
}

impl Harness {
    pub async fn new(adapters: AdapterRegistry) -> Self {
        Self::with_settings(adapters, EngineSettings::default()).await
    }

    pub async fn with_settings(adapters: AdapterRegistry, settings: EngineSettings) -> Self {
        let (dir, store) = temp_store().await;
        let cache = Arc::new(InMemoryMetricCache::new(48));
        let index = Arc::new(ResourceIndex::new());
        let ctx = EngineContext {
            store: store.clone(),
            cache: cache.clone(),
            resources: index.clone(),
            adapters,
            journal: Some(store.journal()),
            settings,
        };
        Self {
            _dir: dir,
            store,
            cache,
            index,
            ctx,
        }
    }

    /// Write one raw sample document per `(value, ts)`.
    pub async fn seed_raw(&self, resource_id: &str, metric: &str, samples: &[(f64, i64)]) {
        let writes: Vec<DurableWrite> = samples
            .iter()
            .map(|(v, ts)| {
                let mut doc = ResourceMetrics::new(resource_id, *ts);
                doc.entries.insert(metric.to_string(), *v);
                DurableWrite::Raw(doc)
            })
            .collect();
        self.store.write_batch(&writes).await.unwrap();
    }
}

pub fn batch(metric: &str, samples: &[(f64, i64)], is_final_batch: bool) -> StatsResponse {
    let values = samples
        .iter()
        .map(|(value, source_micros)| StatSample {
            value: *value,
            source_micros: *source_micros,
        })
        .collect();
    StatsResponse {
        stats: vec![ComputeStats {
            compute_id: None,
            stat_values: BTreeMap::from([(metric.to_string(), values)]),
        }],
        is_final_batch,
    }
}

/// Adapter that replays the same batches for every request and records each request.
pub struct ScriptedAdapter {
    name: String,
    batches: Vec<StatsResponse>,
    fail_for: Option<String>,
    stalled: bool,
    pub requests: Mutex<Vec<StatsRequest>>,
}

impl ScriptedAdapter {
    pub fn new(name: &str, batches: Vec<StatsResponse>) -> Self {
        Self {
            name: name.to_string(),
            batches,
            fail_for: None,
            stalled: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Fail every request for `resource_id`.
    pub fn failing_for(mut self, resource_id: &str) -> Self {
        self.fail_for = Some(resource_id.to_string());
        self
    }

    /// Accept every request but never send a batch.
    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    pub fn requested_ids(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.resource_id.clone())
            .collect()
    }
}

#[async_trait]
impl StatsAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn request_stats(&self, request: StatsRequest) -> Result<StatsStream> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail_for.as_deref() == Some(request.resource_id.as_str()) {
            return Err(RollupError::Adapter {
                adapter: self.name.clone(),
                resource_id: request.resource_id,
                reason: "scripted failure".into(),
            });
        }
        if self.stalled {
            return Ok(futures_util::stream::pending().boxed());
        }
        let batches: Vec<Result<StatsResponse>> = self.batches.iter().cloned().map(Ok).collect();
        Ok(futures_util::stream::iter(batches).boxed())
    }
}

pub fn registry(adapters: Vec<Arc<dyn StatsAdapter>>) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        registry.register(adapter);
    }
    registry
}

pub async fn add_resources(index: &ResourceIndex, ids: &[&str], adapter: Option<&str>) {
    for id in ids {
        index.upsert(ResourceDescriptor::new(*id, adapter)).await;
    }
}

/// Cache whose reads fail; writes go to an inner in-memory cache.
pub struct UnreadableCache {
    pub inner: InMemoryMetricCache,
}

impl UnreadableCache {
    pub fn new() -> Self {
        Self {
            inner: InMemoryMetricCache::new(48),
        }
    }
}

#[async_trait]
impl MetricCache for UnreadableCache {
    async fn stats(&self, _resource_id: &str) -> Result<BTreeMap<RollupKey, StatValue>> {
        Err(RollupError::cache("unavailable"))
    }

    async fn put_stat(&self, resource_id: &str, key: &RollupKey, stat: StatValue) -> Result<()> {
        self.inner.put_stat(resource_id, key, stat).await
    }

    async fn time_series(
        &self,
        _resource_id: &str,
        _resolution: Resolution,
    ) -> Result<Option<ResourceTimeSeries>> {
        Err(RollupError::cache("unavailable"))
    }

    async fn add_samples(&self, resolution: Resolution, samples: &[RawSample]) -> Result<()> {
        self.inner.add_samples(resolution, samples).await
    }

    async fn forget(&self, resource_id: &str) -> Result<()> {
        self.inner.forget(resource_id).await
    }
}
