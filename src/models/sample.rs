// Raw samples and the per-timestamp documents they are persisted as.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSample {
    pub resource_id: String,
    pub metric: String,
    pub value: f64,
    pub source_micros: i64,
}

/// All samples of one resource sharing one source timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetrics {
    pub resource_id: String,
    pub timestamp_micros: i64,
    pub entries: BTreeMap<String, f64>,
}

impl ResourceMetrics {
    pub fn new(resource_id: impl Into<String>, timestamp_micros: i64) -> Self {
        Self {
            resource_id: resource_id.into(),
            timestamp_micros,
            entries: BTreeMap::new(),
        }
    }

    pub fn samples(&self) -> impl Iterator<Item = RawSample> + '_ {
        self.entries.iter().map(|(metric, value)| RawSample {
            resource_id: self.resource_id.clone(),
            metric: metric.clone(),
            value: *value,
            source_micros: self.timestamp_micros,
        })
    }
}

/// Group samples into one document per (resource, timestamp). Later samples win on duplicate metric names.
pub fn group_by_timestamp(samples: impl IntoIterator<Item = RawSample>) -> Vec<ResourceMetrics> {
    let mut docs: BTreeMap<(String, i64), ResourceMetrics> = BTreeMap::new();
    for s in samples {
        docs.entry((s.resource_id.clone(), s.source_micros))
            .or_insert_with(|| ResourceMetrics::new(s.resource_id.clone(), s.source_micros))
            .entries
            .insert(s.metric, s.value);
    }
    docs.into_values().collect()
}

/// In-memory stat: latest value plus the source time it was observed at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatValue {
    pub latest_value: f64,
    pub source_micros: i64,
}
