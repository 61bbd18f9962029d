// Per-metric aggregation policy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::AggregationType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MetricPolicy {
    pub name: String,
    /// Gauge: only the most recent sample of each bucket counts.
    #[serde(default)]
    pub latest_value_only: bool,
    #[serde(default = "AggregationType::all")]
    pub aggregations: BTreeSet<AggregationType>,
}

impl MetricPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latest_value_only: false,
            aggregations: AggregationType::all(),
        }
    }

    pub fn latest_value_only(mut self) -> Self {
        self.latest_value_only = true;
        self
    }

    pub fn with_aggregations(mut self, aggs: impl IntoIterator<Item = AggregationType>) -> Self {
        self.aggregations = aggs.into_iter().collect();
        self
    }
}
