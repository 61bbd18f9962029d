// Bucket math and metric key codec. All timestamps are microseconds since the Unix epoch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RollupError;

pub const MICROS_PER_MINUTE: i64 = 60 * 1_000_000;
pub const MICROS_PER_HOUR: i64 = 60 * MICROS_PER_MINUTE;
pub const MICROS_PER_DAY: i64 = 24 * MICROS_PER_HOUR;

const LAST_COLLECTION_SUFFIX: &str = "-lastSuccessfulStatsCollectionTime";

/// Aggregation granularity. `Minute` is only used to key the collector's last-collection stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Minute,
    Hourly,
    Daily,
}

impl Resolution {
    pub fn bucket_micros(self) -> i64 {
        match self {
            Resolution::Minute => MICROS_PER_MINUTE,
            Resolution::Hourly => MICROS_PER_HOUR,
            Resolution::Daily => MICROS_PER_DAY,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Resolution::Minute => "(Minutes)",
            Resolution::Hourly => "(Hourly)",
            Resolution::Daily => "(Daily)",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Minute => "minute",
            Resolution::Hourly => "hourly",
            Resolution::Daily => "daily",
        }
    }

    const ALL: [Resolution; 3] = [Resolution::Minute, Resolution::Hourly, Resolution::Daily];
}

impl FromStr for Resolution {
    type Err = RollupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resolution::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| RollupError::MalformedKey { key: s.to_string() })
    }
}

/// Start of the interval containing `t`. Floors toward negative infinity.
/// `None` when the start is not representable.
pub fn interval_begin(t: i64, bucket_micros: i64) -> Option<i64> {
    t.checked_sub(t.rem_euclid(bucket_micros))
}

/// Bucket id: exclusive end of the interval containing `t`. `None` near the ends of the i64 range.
pub fn bucket_end(t: i64, bucket_micros: i64) -> Option<i64> {
    interval_begin(t, bucket_micros)?.checked_add(bucket_micros)
}

/// Whether `t` has a bucket at every resolution.
pub fn is_bucketable(t: i64) -> bool {
    Resolution::ALL
        .iter()
        .all(|r| bucket_end(t, r.bucket_micros()).is_some())
}

/// Metric name plus resolution, rendered as `cpu(Hourly)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RollupKey {
    pub metric: String,
    pub resolution: Resolution,
}

impl RollupKey {
    pub fn new(metric: impl Into<String>, resolution: Resolution) -> Self {
        Self {
            metric: metric.into(),
            resolution,
        }
    }

    pub fn bucket_micros(&self) -> i64 {
        self.resolution.bucket_micros()
    }
}

impl fmt::Display for RollupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.metric, self.resolution.suffix())
    }
}

impl FromStr for RollupKey {
    type Err = RollupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for resolution in Resolution::ALL {
            if let Some(metric) = s.strip_suffix(resolution.suffix())
                && !metric.is_empty()
            {
                return Ok(RollupKey::new(metric, resolution));
            }
        }
        Err(RollupError::MalformedKey { key: s.to_string() })
    }
}

/// Resource + rollup key. Storage form is `{resource_id}/{rollup_key}`; metric names must not contain `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricIdentity {
    pub resource_id: String,
    pub key: RollupKey,
}

impl MetricIdentity {
    pub fn new(resource_id: impl Into<String>, key: RollupKey) -> Self {
        Self {
            resource_id: resource_id.into(),
            key,
        }
    }

    pub fn encode(&self) -> String {
        format!("{}/{}", self.resource_id, self.key)
    }

    pub fn decode(s: &str) -> Result<Self, RollupError> {
        let (resource_id, key) = s
            .rsplit_once('/')
            .filter(|(r, _)| !r.is_empty())
            .ok_or_else(|| RollupError::MalformedKey { key: s.to_string() })?;
        Ok(Self::new(resource_id, key.parse()?))
    }
}

/// Durable key for an adapter's last successful collection, e.g. `docker-lastSuccessfulStatsCollectionTime`.
/// Adapters named like paths contribute only their last segment.
pub fn last_collection_key(adapter: &str) -> String {
    let name = adapter
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(adapter);
    format!("{}{}", name, LAST_COLLECTION_SUFFIX)
}

/// In-memory variant of [`last_collection_key`], keyed at minute resolution.
pub fn last_collection_stat_key(adapter: &str) -> RollupKey {
    RollupKey::new(last_collection_key(adapter), Resolution::Minute)
}

pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
