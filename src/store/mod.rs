// Durable metric store: raw-sample documents and append-only aggregate records.

mod blob;
mod journal;
mod sqlite;

pub use journal::TaskJournal;
pub use sqlite::SqliteMetricStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{AggregateRecord, RawSample, ResourceMetrics};

/// One durable write. A batch of these commits atomically.
#[derive(Debug, Clone, PartialEq)]
pub enum DurableWrite {
    Raw(ResourceMetrics),
    Aggregate(AggregateRecord),
}

/// One `(resource, metric)` clause of a raw query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawClause {
    pub resource_id: String,
    pub metric: String,
    /// Inclusive lower bound on the sample timestamp.
    pub since_micros: Option<i64>,
}

/// Batched raw range query: OR of clauses, non-negative values only.
#[derive(Debug, Clone, Default)]
pub struct RawQuery {
    pub clauses: Vec<RawClause>,
    pub limit: u32,
}

#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Persist every write in one transaction.
    async fn write_batch(&self, writes: &[DurableWrite]) -> Result<()>;

    /// Most recently published record for `key` whose value is non-negative.
    async fn latest_aggregate(&self, resource_id: &str, key: &str)
    -> Result<Option<AggregateRecord>>;

    /// Matching samples, newest first, truncated at `query.limit`.
    async fn query_raw(&self, query: &RawQuery) -> Result<Vec<RawSample>>;

    /// Aggregate records for a resource, newest first. `key = None` returns every key.
    async fn aggregates(
        &self,
        resource_id: &str,
        key: Option<&str>,
        limit: u32,
    ) -> Result<Vec<AggregateRecord>>;

    /// Delete documents whose retention expired before `now_micros`. Returns rows removed.
    async fn prune_expired(&self, now_micros: i64) -> Result<u64>;
}
