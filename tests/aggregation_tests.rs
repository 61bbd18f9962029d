// Per-resource aggregator: checkpoints, bucket publication, fallbacks

mod common;

use common::*;
use std::sync::Arc;

use metric_rollup::adapter::StatsAdapter;
use metric_rollup::bucket::{Resolution, RollupKey};
use metric_rollup::cache::MetricCache;
use metric_rollup::error::RollupError;
use metric_rollup::models::{AggregationType, MetricPolicy, StatValue};
use metric_rollup::resources::{ResourceDescriptor, ResourceSelector};
use metric_rollup::store::MetricStore;
use metric_rollup::tasks::{
    AggregationRequest, CollectionRequest, EngineContext, ResourceAggregator, ResourceCollector,
};

fn avg_request(resource_id: &str, metric: &str) -> AggregationRequest {
    AggregationRequest::new(
        resource_id,
        vec![MetricPolicy::new(metric).with_aggregations([AggregationType::Avg])],
    )
}

#[tokio::test]
async fn aggregation_publishes_hourly_buckets_and_checkpoint() {
    let h = Harness::new(registry(vec![])).await;
    add_resources(&h.index, &["r1"], None).await;
    h.seed_raw(
        "r1",
        "cpu",
        &[(30.0, at(10, 5)), (50.0, at(10, 50)), (60.0, at(11, 5))],
    )
    .await;

    let outcome = ResourceAggregator::new(h.ctx.clone())
        .run(avg_request("r1", "cpu"))
        .await
        .unwrap();
    assert!(outcome.has_resources);
    assert_eq!(outcome.records_published, 2);
    assert_eq!(outcome.checkpoints["cpu(Hourly)"], Some(at(12, 0)));

    let records = h.store.aggregates("r1", Some("cpu(Hourly)"), 10).await.unwrap();
    assert_eq!(records.len(), 2);
    // Newest first.
    assert_eq!(records[0].timestamp_micros, at(12, 0));
    assert_eq!(records[0].value, 60.0);
    assert_eq!(records[0].bin.as_ref().map(|b| b.count), Some(1));
    assert_eq!(records[1].timestamp_micros, at(11, 0));
    assert_eq!(records[1].value, 40.0);
    assert_eq!(records[1].bin.as_ref().map(|b| b.count), Some(2));

    let stats = h.cache.stats("r1").await.unwrap();
    assert_eq!(stats[&hourly("cpu")].latest_value, at(12, 0) as f64);
}

#[tokio::test]
async fn second_run_without_new_samples_is_idempotent() {
    let h = Harness::new(registry(vec![])).await;
    add_resources(&h.index, &["r1"], None).await;
    h.seed_raw(
        "r1",
        "cpu",
        &[(30.0, at(10, 5)), (50.0, at(10, 50)), (60.0, at(11, 5))],
    )
    .await;
    let aggregator = ResourceAggregator::new(h.ctx.clone());

    let first = aggregator.run(avg_request("r1", "cpu")).await.unwrap();
    let second = aggregator.run(avg_request("r1", "cpu")).await.unwrap();
    assert_eq!(first.checkpoints, second.checkpoints);
    // Only the checkpoint bucket is revisited.
    assert_eq!(second.records_published, 1);

    let latest = h
        .store
        .latest_aggregate("r1", "cpu(Hourly)")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.timestamp_micros, at(12, 0));
    assert_eq!(latest.value, 60.0);
}

#[tokio::test]
async fn checkpoint_falls_back_to_durable_record() {
    let h = Harness::new(registry(vec![])).await;
    add_resources(&h.index, &["r1"], None).await;
    h.seed_raw("r1", "cpu", &[(30.0, at(10, 5)), (60.0, at(11, 5))]).await;
    ResourceAggregator::new(h.ctx.clone())
        .run(avg_request("r1", "cpu"))
        .await
        .unwrap();

    // Fresh cache: the checkpoint must come from the durable store.
    let cache = Arc::new(UnreadableCache::new());
    let ctx = EngineContext {
        cache: cache.clone(),
        ..h.ctx.clone()
    };
    h.seed_raw("r1", "cpu", &[(90.0, at(12, 30))]).await;
    let outcome = ResourceAggregator::new(ctx)
        .run(avg_request("r1", "cpu"))
        .await
        .unwrap();
    assert_eq!(outcome.checkpoints["cpu(Hourly)"], Some(at(13, 0)));
    // [11:00, 12:00) is revisited and [12:00, 13:00) is new; [10:00, 11:00) is not.
    assert_eq!(outcome.records_published, 2);
    let stats = cache.inner.stats("r1").await.unwrap();
    assert_eq!(stats[&hourly("cpu")].latest_value, at(13, 0) as f64);
}

#[tokio::test]
async fn latest_value_only_uses_most_recent_sample() {
    let h = Harness::new(registry(vec![])).await;
    add_resources(&h.index, &["r1"], None).await;
    h.seed_raw(
        "r1",
        "mem",
        &[(5.0, at(10, 1)), (9.0, at(10, 2)), (3.0, at(10, 3))],
    )
    .await;

    let request = AggregationRequest::new("r1", vec![MetricPolicy::new("mem").latest_value_only()]);
    ResourceAggregator::new(h.ctx.clone())
        .run(request)
        .await
        .unwrap();

    let records = h.store.aggregates("r1", Some("mem(Hourly)"), 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].value, 3.0);
    assert_eq!(records[0].bin.as_ref().map(|b| b.count), Some(1));
}

#[tokio::test]
async fn empty_pool_publishes_zero_records() {
    let h = Harness::new(registry(vec![])).await;
    let request = AggregationRequest {
        selector: Some(ResourceSelector::ids(["missing-1", "missing-2"])),
        resolutions: vec![Resolution::Hourly, Resolution::Daily],
        ..AggregationRequest::new(
            "pool",
            vec![MetricPolicy::new("cpu"), MetricPolicy::new("mem")],
        )
    };

    let outcome = ResourceAggregator::new(h.ctx.clone())
        .run(request)
        .await
        .unwrap();
    assert!(!outcome.has_resources);
    assert_eq!(outcome.records_published, 4);
    for key in ["cpu(Hourly)", "cpu(Daily)", "mem(Hourly)", "mem(Daily)"] {
        assert_eq!(outcome.checkpoints[key], Some(0), "{key}");
        let record = h.store.latest_aggregate("pool", key).await.unwrap().unwrap();
        assert_eq!(record.value, 0.0);
        assert_eq!(record.timestamp_micros, 0);
    }
    let stats = h.cache.stats("pool").await.unwrap();
    assert_eq!(stats.len(), 4);
    assert!(stats.values().all(|s| s.latest_value == 0.0));
}

#[tokio::test]
async fn pool_aggregation_merges_source_resources() {
    let h = Harness::with_settings(
        registry(vec![]),
        metric_rollup::tasks::EngineSettings {
            resource_query_page_size: 1,
            ..Default::default()
        },
    )
    .await;
    for id in ["vm-a", "vm-b", "vm-c"] {
        h.index
            .upsert(ResourceDescriptor::new(id, None).with_label("pool", "p1"))
            .await;
    }
    h.index.upsert(ResourceDescriptor::new("vm-x", None)).await;
    h.seed_raw("vm-a", "cpu", &[(10.0, at(10, 5))]).await;
    h.seed_raw("vm-b", "cpu", &[(20.0, at(10, 6)), (30.0, at(10, 7))]).await;
    h.seed_raw("vm-x", "cpu", &[(1000.0, at(10, 8))]).await;

    let mut selector = ResourceSelector::default();
    selector.labels.insert("pool".into(), "p1".into());
    let request = AggregationRequest {
        selector: Some(selector),
        ..avg_request("p1", "cpu")
    };
    let outcome = ResourceAggregator::new(h.ctx.clone())
        .run(request)
        .await
        .unwrap();
    assert_eq!(outcome.pages, 3);

    let record = h.store.latest_aggregate("p1", "cpu(Hourly)").await.unwrap().unwrap();
    assert_eq!(record.value, 20.0);
    assert_eq!(record.bin.map(|b| b.count), Some(3));
}

#[tokio::test]
async fn in_memory_series_serves_covered_checkpoint() {
    let adapter = Arc::new(ScriptedAdapter::new(
        "scripted",
        vec![batch("cpu", &[(30.0, at(10, 5)), (60.0, at(11, 5))], true)],
    ));
    let h = Harness::new(registry(vec![adapter as Arc<dyn StatsAdapter>])).await;
    add_resources(&h.index, &["r1"], Some("scripted")).await;
    ResourceCollector::new(h.ctx.clone())
        .run(CollectionRequest::new("r1"))
        .await
        .unwrap();

    // Checkpoint inside the cached window.
    h.cache
        .put_stat(
            "r1",
            &hourly("cpu"),
            StatValue {
                latest_value: at(12, 0) as f64,
                source_micros: at(12, 0),
            },
        )
        .await
        .unwrap();
    let outcome = ResourceAggregator::new(h.ctx.clone())
        .run(avg_request("r1", "cpu"))
        .await
        .unwrap();
    assert_eq!(outcome.records_published, 1);
    let record = h.store.latest_aggregate("r1", "cpu(Hourly)").await.unwrap().unwrap();
    assert_eq!(record.timestamp_micros, at(12, 0));
    assert_eq!(record.value, 60.0);
}

#[tokio::test]
async fn unreadable_cache_falls_back_to_store() {
    let h = Harness::new(registry(vec![])).await;
    add_resources(&h.index, &["r1"], None).await;
    h.seed_raw("r1", "cpu", &[(30.0, at(10, 5))]).await;
    let ctx = EngineContext {
        cache: Arc::new(UnreadableCache::new()),
        ..h.ctx.clone()
    };
    let outcome = ResourceAggregator::new(ctx)
        .run(avg_request("r1", "cpu"))
        .await
        .unwrap();
    assert_eq!(outcome.records_published, 1);
    assert_eq!(outcome.checkpoints["cpu(Hourly)"], Some(at(11, 0)));
}

#[tokio::test]
async fn daily_resolution_uses_day_buckets() {
    let h = Harness::new(registry(vec![])).await;
    add_resources(&h.index, &["r1"], None).await;
    h.seed_raw("r1", "cpu", &[(10.0, at(1, 0)), (30.0, at(23, 0))]).await;
    let request = AggregationRequest {
        resolutions: vec![Resolution::Daily],
        ..avg_request("r1", "cpu")
    };
    let outcome = ResourceAggregator::new(h.ctx.clone())
        .run(request)
        .await
        .unwrap();
    assert_eq!(outcome.checkpoints["cpu(Daily)"], Some(at(24, 0)));
    let record = h.store.latest_aggregate("r1", "cpu(Daily)").await.unwrap().unwrap();
    assert_eq!(record.value, 20.0);
}

#[tokio::test]
async fn metric_without_samples_gets_zero_checkpoint() {
    let h = Harness::new(registry(vec![])).await;
    add_resources(&h.index, &["r1"], None).await;
    h.seed_raw("r1", "cpu", &[(30.0, at(10, 5))]).await;
    let request = AggregationRequest::new(
        "r1",
        vec![MetricPolicy::new("cpu"), MetricPolicy::new("disk")],
    );
    let outcome = ResourceAggregator::new(h.ctx.clone())
        .run(request)
        .await
        .unwrap();
    assert_eq!(outcome.checkpoints["disk(Hourly)"], Some(0));
    let stats = h.cache.stats("r1").await.unwrap();
    assert_eq!(
        stats[&RollupKey::new("disk", Resolution::Hourly)].latest_value,
        0.0
    );
    // Zero checkpoints live only in the cache.
    assert!(h.store.latest_aggregate("r1", "disk(Hourly)").await.unwrap().is_none());
}

#[tokio::test]
async fn request_without_metrics_is_rejected() {
    let h = Harness::new(registry(vec![])).await;
    let err = ResourceAggregator::new(h.ctx.clone())
        .run(AggregationRequest::new("r1", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, RollupError::InvalidTask { .. }));
    assert!(err.is_configuration());
}

#[tokio::test]
async fn finished_aggregation_leaves_no_journal_entry() {
    let h = Harness::new(registry(vec![])).await;
    add_resources(&h.index, &["r1"], None).await;
    ResourceAggregator::new(h.ctx.clone())
        .run(avg_request("r1", "cpu"))
        .await
        .unwrap();
    assert!(h.store.journal().list().await.unwrap().is_empty());
}
