// Bounded ring of recent time bins for one metric, keyed by bin start.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::bucket::bucket_end;
use crate::models::{AggregationType, TimeBin};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeries {
    bin_micros: i64,
    capacity: usize,
    bins: BTreeMap<i64, TimeBin>,
}

impl TimeSeries {
    pub fn new(bin_micros: i64, capacity: usize) -> Self {
        Self {
            bin_micros,
            capacity: capacity.max(1),
            bins: BTreeMap::new(),
        }
    }

    pub fn bin_micros(&self) -> i64 {
        self.bin_micros
    }

    /// Add a sample. Once full, samples older than the oldest retained bin are dropped,
    /// as are samples whose bucket end is not representable.
    pub fn add(&mut self, value: f64, source_micros: i64, aggs: &BTreeSet<AggregationType>) {
        let Some(start) = bucket_end(source_micros, self.bin_micros).map(|end| end - self.bin_micros)
        else {
            return;
        };
        if self.bins.len() >= self.capacity
            && !self.bins.contains_key(&start)
            && self.bins.keys().next().is_some_and(|oldest| start < *oldest)
        {
            return;
        }
        self.bins
            .entry(start)
            .or_default()
            .add_sample(value, source_micros, aggs);
        while self.bins.len() > self.capacity {
            self.bins.pop_first();
        }
    }

    /// End of the oldest retained bin.
    pub fn earliest_bucket_end(&self) -> Option<i64> {
        self.bins
            .keys()
            .next()
            .map(|start| start + self.bin_micros)
    }

    /// Bins as `(bucket_end, bin)`, oldest first.
    pub fn buckets(&self) -> impl Iterator<Item = (i64, &TimeBin)> + '_ {
        self.bins
            .iter()
            .map(|(start, bin)| (start + self.bin_micros, bin))
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
}

/// All metric series of one resource at one resolution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceTimeSeries {
    pub metrics: BTreeMap<String, TimeSeries>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::MICROS_PER_HOUR;

    const H: i64 = MICROS_PER_HOUR;

    #[test]
    fn evicts_oldest_bin_past_capacity() {
        let aggs = AggregationType::all();
        let mut series = TimeSeries::new(H, 2);
        series.add(1.0, 10 * H + 5, &aggs);
        series.add(2.0, 11 * H + 5, &aggs);
        series.add(3.0, 12 * H + 5, &aggs);
        assert_eq!(series.len(), 2);
        assert_eq!(series.earliest_bucket_end(), Some(12 * H));
        let ends: Vec<i64> = series.buckets().map(|(end, _)| end).collect();
        assert_eq!(ends, vec![12 * H, 13 * H]);
    }

    #[test]
    fn late_sample_older_than_window_is_dropped() {
        let aggs = AggregationType::all();
        let mut series = TimeSeries::new(H, 2);
        series.add(1.0, 11 * H, &aggs);
        series.add(2.0, 12 * H, &aggs);
        series.add(9.0, 3 * H, &aggs);
        assert_eq!(series.earliest_bucket_end(), Some(12 * H));
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn samples_in_one_bin_accumulate() {
        let aggs = AggregationType::all();
        let mut series = TimeSeries::new(H, 2);
        series.add(30.0, 10 * H + 1, &aggs);
        series.add(50.0, 10 * H + 2, &aggs);
        let (end, bin) = series.buckets().next().unwrap();
        assert_eq!(end, 11 * H);
        assert_eq!(bin.avg, Some(40.0));
        assert_eq!(bin.count, 2);
    }

    #[test]
    fn sample_without_bucket_end_is_ignored() {
        let aggs = AggregationType::all();
        let mut series = TimeSeries::new(H, 2);
        series.add(1.0, i64::MAX - 1, &aggs);
        assert_eq!(series.len(), 0);
        assert_eq!(series.earliest_bucket_end(), None);
    }
}
