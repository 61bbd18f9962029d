// Collection and aggregation tasks. Each task is an explicit stage machine whose
// `{stage, state}` is journaled on every transition and dropped on a terminal stage.

pub mod aggregation;
pub mod collection;
mod fanin;
pub mod orchestrator;
pub mod publisher;

pub use aggregation::{AggregationOutcome, AggregationRequest, ResourceAggregator};
pub use collection::{CollectionOutcome, CollectionRequest, ResourceCollector};
pub use fanin::{CompletionHandle, PageTracker};
pub use orchestrator::{
    AggregationOrchestrator, AggregationRun, CollectionOrchestrator, CollectionRun,
    OrchestrationSummary,
};
pub use publisher::{BatchPublisher, PublishSummary, WriteOp};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::adapter::AdapterRegistry;
use crate::bucket::now_micros;
use crate::cache::MetricCache;
use crate::models::{StageName, TaskKind, TaskRecord};
use crate::resources::ResourceQuery;
use crate::store::{MetricStore, TaskJournal};

/// Tunables shared by every task.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Resources per orchestration page (fan-out width).
    pub page_size: usize,
    /// Resources per page when an aggregator walks its own selection.
    pub resource_query_page_size: usize,
    pub publish_batch_size: usize,
    pub raw_result_limit: u32,
    pub collection_expiration: Duration,
    pub aggregation_expiration: Duration,
    pub orchestration_expiration: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            resource_query_page_size: 25,
            publish_batch_size: 100,
            raw_result_limit: 10_000,
            collection_expiration: Duration::from_secs(60 * 60),
            aggregation_expiration: Duration::from_secs(10 * 60),
            orchestration_expiration: Duration::from_secs(12 * 60 * 60),
        }
    }
}

/// Collaborators injected into every task.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn MetricStore>,
    pub cache: Arc<dyn MetricCache>,
    pub resources: Arc<dyn ResourceQuery>,
    pub adapters: AdapterRegistry,
    pub journal: Option<TaskJournal>,
    pub settings: EngineSettings,
}

impl EngineContext {
    pub(crate) fn publisher(&self) -> BatchPublisher<'_> {
        BatchPublisher::new(
            self.store.as_ref(),
            self.cache.as_ref(),
            self.settings.publish_batch_size,
        )
    }
}

static TASK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Journal writer for one task. Journal failures are logged, never fatal to the task.
pub(crate) struct StageJournal {
    journal: Option<TaskJournal>,
    record: TaskRecord,
}

impl StageJournal {
    pub(crate) fn start(
        journal: Option<TaskJournal>,
        kind: TaskKind,
        subject: &str,
        expiration: Duration,
    ) -> Self {
        let now = now_micros();
        let seq = TASK_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            journal,
            record: TaskRecord {
                task_id: format!("{}:{}:{}", kind.as_str(), subject, seq),
                kind,
                subject: subject.to_string(),
                stage: String::new(),
                cursor: None,
                detail: None,
                started_micros: now,
                updated_micros: now,
                expires_micros: now + expiration.as_micros() as i64,
            },
        }
    }

    pub(crate) fn task_id(&self) -> &str {
        &self.record.task_id
    }

    pub(crate) async fn enter<S: StageName>(
        &mut self,
        stage: S,
        cursor: Option<String>,
        detail: Option<String>,
    ) {
        self.record.stage = stage.name().to_string();
        self.record.cursor = cursor;
        self.record.detail = detail;
        self.record.updated_micros = now_micros();
        tracing::debug!(task_id = %self.record.task_id, stage = stage.name(), "stage transition");

        let Some(journal) = &self.journal else {
            return;
        };
        let result = if stage.is_terminal() {
            journal.remove(&self.record.task_id).await
        } else {
            journal.record(&self.record).await
        };
        if let Err(e) = result {
            tracing::warn!(
                error = %e,
                task_id = %self.record.task_id,
                operation = "journal",
                "failed to journal stage transition"
            );
        }
    }
}
