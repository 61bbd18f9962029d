// Durable aggregate records: one metric entry per record, write-once.

use serde::{Deserialize, Serialize};

use super::TimeBin;

/// Keyed by `(resource_id, published_micros)`. `timestamp_micros` is the bucket end for
/// rollups, or the collection time for last-collection markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRecord {
    pub resource_id: String,
    pub key: String,
    pub value: f64,
    pub timestamp_micros: i64,
    pub published_micros: i64,
    pub bin: Option<TimeBin>,
}

impl AggregateRecord {
    pub fn from_bin(
        resource_id: impl Into<String>,
        key: impl Into<String>,
        bucket_end: i64,
        bin: TimeBin,
        published_micros: i64,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            key: key.into(),
            value: bin.primary_value(),
            timestamp_micros: bucket_end,
            published_micros,
            bin: Some(bin),
        }
    }

    pub fn marker(
        resource_id: impl Into<String>,
        key: impl Into<String>,
        value: f64,
        timestamp_micros: i64,
        published_micros: i64,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            key: key.into(),
            value,
            timestamp_micros,
            published_micros,
            bin: None,
        }
    }
}
