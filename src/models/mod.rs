// Domain models: samples, time bins, aggregate records, task journal

mod aggregate;
mod policy;
mod sample;
mod task;
mod time_bin;

pub use aggregate::AggregateRecord;
pub use policy::MetricPolicy;
pub use sample::{RawSample, ResourceMetrics, StatValue, group_by_timestamp};
pub use task::{
    AggregationStage, CollectionStage, OrchestrationStage, StageName, TaskKind, TaskRecord,
};
pub use time_bin::{AggregationType, TimeBin};
