// Batch publisher: fixed-size batches, strictly sequential. Batch n+1 is sent only after
// batch n is acknowledged; the first failing batch stops the sequence.

use crate::bucket::{Resolution, RollupKey};
use crate::cache::MetricCache;
use crate::error::Result;
use crate::models::{RawSample, StatValue};
use crate::store::{DurableWrite, MetricStore};

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Durable(DurableWrite),
    Stat {
        resource_id: String,
        key: RollupKey,
        stat: StatValue,
    },
    Series {
        resolution: Resolution,
        samples: Vec<RawSample>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub batches: usize,
    pub durable_writes: usize,
    pub cache_writes: usize,
}

pub struct BatchPublisher<'a> {
    store: &'a dyn MetricStore,
    cache: &'a dyn MetricCache,
    batch_size: usize,
}

impl<'a> BatchPublisher<'a> {
    pub fn new(store: &'a dyn MetricStore, cache: &'a dyn MetricCache, batch_size: usize) -> Self {
        Self {
            store,
            cache,
            batch_size: batch_size.max(1),
        }
    }

    /// Within a batch, durable writes commit in one transaction before the batch's cache
    /// writes are applied, so a checkpoint stat never precedes the records it covers.
    pub async fn publish(&self, ops: Vec<WriteOp>) -> Result<PublishSummary> {
        let mut summary = PublishSummary::default();
        for batch in ops.chunks(self.batch_size) {
            let durable: Vec<DurableWrite> = batch
                .iter()
                .filter_map(|op| match op {
                    WriteOp::Durable(w) => Some(w.clone()),
                    _ => None,
                })
                .collect();
            self.store.write_batch(&durable).await?;
            summary.durable_writes += durable.len();

            for op in batch {
                match op {
                    WriteOp::Durable(_) => {}
                    WriteOp::Stat {
                        resource_id,
                        key,
                        stat,
                    } => {
                        self.cache.put_stat(resource_id, key, *stat).await?;
                        summary.cache_writes += 1;
                    }
                    WriteOp::Series {
                        resolution,
                        samples,
                    } => {
                        self.cache.add_samples(*resolution, samples).await?;
                        summary.cache_writes += 1;
                    }
                }
            }
            summary.batches += 1;
            tracing::debug!(
                operation = "publish_batch",
                batch = summary.batches,
                ops_count = batch.len(),
                "batch published"
            );
        }
        Ok(summary)
    }
}
