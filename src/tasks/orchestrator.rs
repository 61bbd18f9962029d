// Orchestrators: page through a resource selection and fan out one job per resource.
// A page must fully complete before the next page is requested.

use std::future::Future;
use tracing::{info, instrument, warn};

use super::aggregation::{AggregationRequest, ResourceAggregator};
use super::collection::{CollectionRequest, ResourceCollector};
use super::fanin::PageTracker;
use super::{EngineContext, StageJournal};
use crate::bucket::Resolution;
use crate::error::{Result, RollupError};
use crate::models::{MetricPolicy, OrchestrationStage, TaskKind};
use crate::resources::{ResourcePage, ResourceSelector};

#[derive(Debug, Clone, Default)]
pub struct CollectionRun {
    pub selector: ResourceSelector,
    /// Narrows `selector`.
    pub extra: Option<ResourceSelector>,
    pub adapter_override: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AggregationRun {
    pub selector: ResourceSelector,
    pub metrics: Vec<MetricPolicy>,
    pub resolutions: Vec<Resolution>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestrationSummary {
    pub pages: usize,
    pub jobs: usize,
}

pub struct CollectionOrchestrator {
    ctx: EngineContext,
}

impl CollectionOrchestrator {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, run), fields(task = "collection_orchestration"))]
    pub async fn run(&self, run: CollectionRun) -> Result<OrchestrationSummary> {
        let selector = match &run.extra {
            Some(extra) => run.selector.clone().and(extra),
            None => run.selector.clone(),
        };
        let adapter_override = run.adapter_override.clone();
        let ctx = self.ctx.clone();
        orchestrate(
            &self.ctx,
            TaskKind::CollectionOrchestration,
            selector,
            move |resource_id| {
                let collector = ResourceCollector::new(ctx.clone());
                let request = CollectionRequest {
                    resource_id,
                    adapter_override: adapter_override.clone(),
                };
                async move { collector.run(request).await.map(|_| ()) }
            },
        )
        .await
    }
}

pub struct AggregationOrchestrator {
    ctx: EngineContext,
}

impl AggregationOrchestrator {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, run), fields(task = "aggregation_orchestration"))]
    pub async fn run(&self, run: AggregationRun) -> Result<OrchestrationSummary> {
        if run.metrics.is_empty() {
            return Err(RollupError::invalid_task(
                run.selector.to_string(),
                "at least one metric name is required",
            ));
        }
        let ctx = self.ctx.clone();
        let metrics = run.metrics.clone();
        let resolutions = run.resolutions.clone();
        orchestrate(
            &self.ctx,
            TaskKind::AggregationOrchestration,
            run.selector,
            move |resource_id| {
                let aggregator = ResourceAggregator::new(ctx.clone());
                let request = AggregationRequest {
                    resource_id,
                    metrics: metrics.clone(),
                    resolutions: resolutions.clone(),
                    selector: None,
                };
                async move { aggregator.run(request).await.map(|_| ()) }
            },
        )
        .await
    }
}

/// Run `job` for every selected resource, one page at a time, within the orchestration expiry.
/// Each job enforces its own task expiration.
async fn orchestrate<F, Fut>(
    ctx: &EngineContext,
    kind: TaskKind,
    selector: ResourceSelector,
    job: F,
) -> Result<OrchestrationSummary>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    if selector.ids.as_ref().is_some_and(|ids| ids.is_empty()) {
        return Err(RollupError::EmptySelection {
            reason: format!("{} selected no ids", kind.as_str()),
        });
    }
    let expiration = ctx.settings.orchestration_expiration;
    let mut journal = StageJournal::start(ctx.journal.clone(), kind, &selector.to_string(), expiration);
    journal
        .enter(OrchestrationStage::Init, None, Some(selector.to_string()))
        .await;
    info!(task_id = journal.task_id(), selector = %selector, "orchestration started");

    let pages = run_pages(ctx, &mut journal, selector, job);
    let result = match tokio::time::timeout(expiration, pages).await {
        Ok(result) => result,
        Err(_) => Err(RollupError::Expired {
            task: kind.as_str().to_string(),
            after_secs: expiration.as_secs(),
        }),
    };
    match result {
        Ok(summary) => {
            journal.enter(OrchestrationStage::Finished, None, None).await;
            info!(
                task_id = journal.task_id(),
                pages = summary.pages,
                jobs = summary.jobs,
                "orchestration finished"
            );
            Ok(summary)
        }
        Err(e) => {
            warn!(task_id = journal.task_id(), error = %e, "orchestration failed");
            journal
                .enter(OrchestrationStage::Failed, None, Some(e.to_string()))
                .await;
            Err(e)
        }
    }
}

async fn run_pages<F, Fut>(
    ctx: &EngineContext,
    journal: &mut StageJournal,
    selector: ResourceSelector,
    job: F,
) -> Result<OrchestrationSummary>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut summary = OrchestrationSummary::default();
    let mut page: ResourcePage = ctx
        .resources
        .first_page(&selector, ctx.settings.page_size)
        .await?;
    loop {
        let cursor = page.next.as_ref().map(|c| c.to_string());
        journal
            .enter(
                OrchestrationStage::GetResources,
                cursor,
                Some(format!("pages={} jobs={}", summary.pages, summary.jobs)),
            )
            .await;
        if page.resource_ids.is_empty() && summary.pages == 0 {
            break;
        }
        summary.pages += 1;

        let mut tracker = PageTracker::new(0);
        for resource_id in page.resource_ids {
            let handle = tracker.handle(resource_id.clone());
            let fut = job(resource_id);
            tokio::spawn(async move {
                handle.complete(fut.await);
            });
        }
        summary.jobs += tracker.wait().await?;

        match page.next {
            Some(cursor) => page = ctx.resources.next_page(&cursor).await?,
            None => break,
        }
    }
    Ok(summary)
}
