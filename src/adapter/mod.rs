// Stats adapters: opaque per-provider calls returning batches of named samples.

mod docker;
mod host;

pub use docker::{DOCKER_ADAPTER, DockerStatsAdapter};
pub use host::{HOST_ADAPTER, HostStatsAdapter};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct StatsRequest {
    pub resource_id: String,
    /// Source time of the previous successful collection, if known.
    pub last_collection_micros: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatSample {
    pub value: f64,
    pub source_micros: i64,
}

/// Samples for one compute. `compute_id = None` means the requested resource itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputeStats {
    pub compute_id: Option<String>,
    pub stat_values: BTreeMap<String, Vec<StatSample>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsResponse {
    pub stats: Vec<ComputeStats>,
    pub is_final_batch: bool,
}

pub type StatsStream = BoxStream<'static, Result<StatsResponse>>;

#[async_trait]
pub trait StatsAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Start a collection. The stream yields batches until one has `is_final_batch` set.
    async fn request_stats(&self, request: StatsRequest) -> Result<StatsStream>;
}

/// Adapters by name.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn StatsAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn StatsAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StatsAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Single final batch for the resource itself.
pub(crate) fn single_batch(stat_values: BTreeMap<String, Vec<StatSample>>) -> StatsResponse {
    StatsResponse {
        stats: vec![ComputeStats {
            compute_id: None,
            stat_values,
        }],
        is_final_batch: true,
    }
}
