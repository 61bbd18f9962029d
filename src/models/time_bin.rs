// Time bin: running aggregates for one resolution-aligned interval.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationType {
    Avg,
    Min,
    Max,
    Sum,
    Count,
}

impl AggregationType {
    pub fn all() -> BTreeSet<AggregationType> {
        [
            AggregationType::Avg,
            AggregationType::Min,
            AggregationType::Max,
            AggregationType::Sum,
            AggregationType::Count,
        ]
        .into_iter()
        .collect()
    }
}

/// `avg` and `sum` stay `None` until the first sample of an enabled aggregation.
/// `count` is incremented regardless of the enabled set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBin {
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub sum: Option<f64>,
    pub count: u64,
    /// Most recent sample by source time; used for latest-value-only metrics.
    pub latest: Option<f64>,
    pub latest_micros: Option<i64>,
}

impl TimeBin {
    /// Single-count bin carrying one value in every slot.
    pub fn single(value: f64, source_micros: i64) -> Self {
        Self {
            avg: Some(value),
            min: Some(value),
            max: Some(value),
            sum: Some(value),
            count: 1,
            latest: Some(value),
            latest_micros: Some(source_micros),
        }
    }

    pub fn add_sample(&mut self, value: f64, source_micros: i64, aggs: &BTreeSet<AggregationType>) {
        if aggs.contains(&AggregationType::Max) && self.max.is_none_or(|m| m < value) {
            self.max = Some(value);
        }
        if aggs.contains(&AggregationType::Min) && self.min.is_none_or(|m| m > value) {
            self.min = Some(value);
        }
        if aggs.contains(&AggregationType::Avg) {
            self.avg = Some(match self.avg {
                None => value,
                Some(avg) => (avg * self.count as f64 + value) / (self.count + 1) as f64,
            });
        }
        if aggs.contains(&AggregationType::Sum) {
            self.sum = Some(self.sum.unwrap_or(0.0) + value);
        }
        self.count += 1;
        if self.latest_micros.is_none_or(|t| t <= source_micros) {
            self.latest = Some(value);
            self.latest_micros = Some(source_micros);
        }
    }

    /// Fold another bin into this one. Avg is weighted by each side's count.
    pub fn merge(&mut self, other: &TimeBin, aggs: &BTreeSet<AggregationType>) {
        if other.count == 0 {
            return;
        }
        if aggs.contains(&AggregationType::Max)
            && let Some(v) = other.max
            && self.max.is_none_or(|m| m < v)
        {
            self.max = Some(v);
        }
        if aggs.contains(&AggregationType::Min)
            && let Some(v) = other.min
            && self.min.is_none_or(|m| m > v)
        {
            self.min = Some(v);
        }
        if aggs.contains(&AggregationType::Avg)
            && let Some(v) = other.avg
        {
            self.avg = Some(match self.avg {
                None => v,
                Some(avg) => {
                    (avg * self.count as f64 + v * other.count as f64)
                        / (self.count + other.count) as f64
                }
            });
        }
        if aggs.contains(&AggregationType::Sum)
            && let Some(v) = other.sum
        {
            self.sum = Some(self.sum.unwrap_or(0.0) + v);
        }
        self.count += other.count;
        if let Some(t) = other.latest_micros
            && self.latest_micros.is_none_or(|mine| mine <= t)
        {
            self.latest = other.latest;
            self.latest_micros = Some(t);
        }
    }

    /// Published value: avg when computed, else the first present of sum, max, min, count.
    pub fn primary_value(&self) -> f64 {
        self.avg
            .or(self.sum)
            .or(self.max)
            .or(self.min)
            .unwrap_or(self.count as f64)
    }
}
