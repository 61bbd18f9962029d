// Task stages and the journal record persisted on every stage transition.

use serde::{Deserialize, Serialize};
use wincode::{SchemaRead, SchemaWrite};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, SchemaRead, SchemaWrite,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Collection,
    Aggregation,
    CollectionOrchestration,
    AggregationOrchestration,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Collection => "collection",
            TaskKind::Aggregation => "aggregation",
            TaskKind::CollectionOrchestration => "collection_orchestration",
            TaskKind::AggregationOrchestration => "aggregation_orchestration",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectionStage {
    GetDescription,
    GetLastCollectionTime,
    CollectStats,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationStage {
    GetLastRollupTime,
    InitResourceQuery,
    ProcessResources,
    PublishMetrics,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestrationStage {
    Init,
    GetResources,
    Finished,
    Failed,
}

/// Stage name as stored in the journal, e.g. `PROCESS_RESOURCES`.
pub trait StageName: Copy {
    fn name(self) -> &'static str;
    fn is_terminal(self) -> bool;
}

impl StageName for CollectionStage {
    fn name(self) -> &'static str {
        match self {
            CollectionStage::GetDescription => "GET_DESCRIPTION",
            CollectionStage::GetLastCollectionTime => "GET_LAST_COLLECTION_TIME",
            CollectionStage::CollectStats => "COLLECT_STATS",
            CollectionStage::Finished => "FINISHED",
            CollectionStage::Failed => "FAILED",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, CollectionStage::Finished | CollectionStage::Failed)
    }
}

impl StageName for AggregationStage {
    fn name(self) -> &'static str {
        match self {
            AggregationStage::GetLastRollupTime => "GET_LAST_ROLLUP_TIME",
            AggregationStage::InitResourceQuery => "INIT_RESOURCE_QUERY",
            AggregationStage::ProcessResources => "PROCESS_RESOURCES",
            AggregationStage::PublishMetrics => "PUBLISH_METRICS",
            AggregationStage::Finished => "FINISHED",
            AggregationStage::Failed => "FAILED",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, AggregationStage::Finished | AggregationStage::Failed)
    }
}

impl StageName for OrchestrationStage {
    fn name(self) -> &'static str {
        match self {
            OrchestrationStage::Init => "INIT",
            OrchestrationStage::GetResources => "GET_RESOURCES",
            OrchestrationStage::Finished => "FINISHED",
            OrchestrationStage::Failed => "FAILED",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, OrchestrationStage::Finished | OrchestrationStage::Failed)
    }
}

/// Journal entry for a running task. Removed once the task reaches a terminal stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    pub kind: TaskKind,
    /// Resource id for per-resource jobs, selector summary for orchestrations.
    pub subject: String,
    pub stage: String,
    pub cursor: Option<String>,
    pub detail: Option<String>,
    pub started_micros: i64,
    pub updated_micros: i64,
    pub expires_micros: i64,
}
