// In-memory metric cache: per-resource stats and recent time series. Volatile; every read
// has a durable fallback.

mod time_series;

pub use time_series::{ResourceTimeSeries, TimeSeries};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::bucket::{MetricIdentity, Resolution, RollupKey};
use crate::error::Result;
use crate::models::{AggregationType, RawSample, StatValue};

#[async_trait]
pub trait MetricCache: Send + Sync {
    /// Every stat recorded for the resource. Empty when none are cached.
    async fn stats(&self, resource_id: &str) -> Result<BTreeMap<RollupKey, StatValue>>;

    async fn put_stat(&self, resource_id: &str, key: &RollupKey, stat: StatValue) -> Result<()>;

    /// `None` when the resource has no series at this resolution.
    async fn time_series(
        &self,
        resource_id: &str,
        resolution: Resolution,
    ) -> Result<Option<ResourceTimeSeries>>;

    async fn add_samples(&self, resolution: Resolution, samples: &[RawSample]) -> Result<()>;

    /// Drop every stat and series held for a resource that no longer exists.
    async fn forget(&self, resource_id: &str) -> Result<()>;
}

/// Stats are stored under their encoded [`MetricIdentity`], so a resource's stats are one range scan.
pub struct InMemoryMetricCache {
    stats: RwLock<BTreeMap<String, StatValue>>,
    series: RwLock<HashMap<(String, Resolution), ResourceTimeSeries>>,
    series_capacity: usize,
}

impl InMemoryMetricCache {
    pub fn new(series_capacity: usize) -> Self {
        Self {
            stats: RwLock::new(BTreeMap::new()),
            series: RwLock::new(HashMap::new()),
            series_capacity,
        }
    }

    /// Number of (resource, resolution) series currently held.
    pub async fn series_count(&self) -> usize {
        self.series.read().await.len()
    }
}

#[async_trait]
impl MetricCache for InMemoryMetricCache {
    async fn stats(&self, resource_id: &str) -> Result<BTreeMap<RollupKey, StatValue>> {
        let prefix = format!("{}/", resource_id);
        let stats = self.stats.read().await;
        let mut out = BTreeMap::new();
        for (encoded, stat) in stats.range(prefix.clone()..) {
            if !encoded.starts_with(&prefix) {
                break;
            }
            // Resource ids may nest ("hosts/h1" vs "hosts/h1/x"), so decode before trusting the prefix.
            if let Ok(identity) = MetricIdentity::decode(encoded)
                && identity.resource_id == resource_id
            {
                out.insert(identity.key, *stat);
            }
        }
        Ok(out)
    }

    async fn put_stat(&self, resource_id: &str, key: &RollupKey, stat: StatValue) -> Result<()> {
        let encoded = MetricIdentity::new(resource_id, key.clone()).encode();
        self.stats.write().await.insert(encoded, stat);
        Ok(())
    }

    async fn time_series(
        &self,
        resource_id: &str,
        resolution: Resolution,
    ) -> Result<Option<ResourceTimeSeries>> {
        let series = self.series.read().await;
        Ok(series.get(&(resource_id.to_string(), resolution)).cloned())
    }

    async fn add_samples(&self, resolution: Resolution, samples: &[RawSample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let aggs = AggregationType::all();
        let mut series = self.series.write().await;
        for s in samples {
            series
                .entry((s.resource_id.clone(), resolution))
                .or_default()
                .metrics
                .entry(s.metric.clone())
                .or_insert_with(|| {
                    TimeSeries::new(resolution.bucket_micros(), self.series_capacity)
                })
                .add(s.value, s.source_micros, &aggs);
        }
        Ok(())
    }

    async fn forget(&self, resource_id: &str) -> Result<()> {
        self.stats.write().await.retain(|encoded, _| {
            !MetricIdentity::decode(encoded).is_ok_and(|id| id.resource_id == resource_id)
        });
        self.series
            .write()
            .await
            .retain(|(id, _), _| id != resource_id);
        Ok(())
    }
}
