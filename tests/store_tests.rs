// SQLite metric store and task journal

mod common;

use common::*;
use std::sync::atomic::Ordering;
use tempfile::TempDir;

use metric_rollup::bucket::{MICROS_PER_DAY, now_micros};
use metric_rollup::scheduler::{self, SchedulerStats};
use metric_rollup::models::{AggregateRecord, ResourceMetrics, TaskKind, TaskRecord, TimeBin};
use metric_rollup::store::{DurableWrite, MetricStore, RawClause, RawQuery, SqliteMetricStore};

fn doc(resource_id: &str, ts: i64, entries: &[(&str, f64)]) -> DurableWrite {
    let mut doc = ResourceMetrics::new(resource_id, ts);
    for (metric, value) in entries {
        doc.entries.insert(metric.to_string(), *value);
    }
    DurableWrite::Raw(doc)
}

fn clause(resource_id: &str, metric: &str, since_micros: Option<i64>) -> RawClause {
    RawClause {
        resource_id: resource_id.into(),
        metric: metric.into(),
        since_micros,
    }
}

fn task(task_id: &str, expires_micros: i64) -> TaskRecord {
    TaskRecord {
        task_id: task_id.into(),
        kind: TaskKind::Collection,
        subject: "r1".into(),
        stage: "COLLECT_STATS".into(),
        cursor: None,
        detail: Some("docker".into()),
        started_micros: 1,
        updated_micros: 2,
        expires_micros,
    }
}

#[tokio::test]
async fn store_init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("metrics.db");
    let store = SqliteMetricStore::connect(path.to_str().unwrap(), 1, 7)
        .await
        .unwrap();
    store.init().await.unwrap();
    store.init().await.unwrap();
    store.vacuum().await.unwrap();
    assert!(path.exists());
}

#[tokio::test]
async fn raw_query_matches_clauses_newest_first() {
    let (_dir, store) = temp_store().await;
    store
        .write_batch(&[
            doc("r1", at(10, 0), &[("cpu", 1.0), ("mem", 100.0)]),
            doc("r1", at(11, 0), &[("cpu", 2.0), ("mem", -1.0)]),
            doc("r1", at(12, 0), &[("cpu", 3.0)]),
            doc("r2", at(12, 0), &[("cpu", 9.0)]),
        ])
        .await
        .unwrap();

    let samples = store
        .query_raw(&RawQuery {
            clauses: vec![
                clause("r1", "cpu", Some(at(11, 0))),
                clause("r1", "mem", None),
            ],
            limit: 100,
        })
        .await
        .unwrap();
    let got: Vec<(&str, f64, i64)> = samples
        .iter()
        .map(|s| (s.metric.as_str(), s.value, s.source_micros))
        .collect();
    // Negative values never match; r2 is not selected.
    assert_eq!(
        got,
        vec![
            ("cpu", 3.0, at(12, 0)),
            ("cpu", 2.0, at(11, 0)),
            ("mem", 100.0, at(10, 0)),
        ]
    );
}

#[tokio::test]
async fn raw_query_truncates_at_limit() {
    let (_dir, store) = temp_store().await;
    let writes: Vec<DurableWrite> = (0..10).map(|m| doc("r1", at(10, m), &[("cpu", m as f64)])).collect();
    store.write_batch(&writes).await.unwrap();
    let samples = store
        .query_raw(&RawQuery {
            clauses: vec![clause("r1", "cpu", None)],
            limit: 3,
        })
        .await
        .unwrap();
    assert_eq!(samples.len(), 3);
    assert_eq!(samples[0].source_micros, at(10, 9));
    assert!(store
        .query_raw(&RawQuery::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn latest_aggregate_prefers_newest_published_non_negative() {
    let (_dir, store) = temp_store().await;
    let bin = TimeBin {
        avg: Some(5.0),
        count: 4,
        ..Default::default()
    };
    store
        .write_batch(&[
            DurableWrite::Aggregate(AggregateRecord::from_bin("r1", "cpu(Hourly)", at(11, 0), bin, 10)),
            DurableWrite::Aggregate(AggregateRecord::marker("r1", "cpu(Hourly)", 7.0, at(12, 0), 20)),
            DurableWrite::Aggregate(AggregateRecord::marker("r1", "cpu(Hourly)", -1.0, at(13, 0), 30)),
        ])
        .await
        .unwrap();

    let latest = store
        .latest_aggregate("r1", "cpu(Hourly)")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.timestamp_micros, at(12, 0));
    assert_eq!(latest.value, 7.0);
    assert!(latest.bin.is_none());

    let all = store.aggregates("r1", Some("cpu(Hourly)"), 10).await.unwrap();
    assert_eq!(all.len(), 3);
    let oldest = &all[2];
    assert_eq!(oldest.value, 5.0);
    assert_eq!(oldest.bin.as_ref().and_then(|b| b.avg), Some(5.0));
    assert_eq!(oldest.bin.as_ref().map(|b| b.count), Some(4));

    assert!(store.latest_aggregate("r1", "mem(Hourly)").await.unwrap().is_none());
}

#[tokio::test]
async fn prune_removes_expired_documents() {
    let (_dir, store) = temp_store().await;
    store
        .write_batch(&[
            doc("r1", at(10, 0), &[("cpu", 1.0)]),
            DurableWrite::Aggregate(AggregateRecord::marker("r1", "cpu(Hourly)", 1.0, at(11, 0), 0)),
        ])
        .await
        .unwrap();

    assert_eq!(store.prune_expired(now_micros()).await.unwrap(), 0);
    // Retention is 56 days.
    let later = now_micros() + 57 * MICROS_PER_DAY;
    assert_eq!(store.prune_expired(later).await.unwrap(), 2);
    let samples = store
        .query_raw(&RawQuery {
            clauses: vec![clause("r1", "cpu", None)],
            limit: 10,
        })
        .await
        .unwrap();
    assert!(samples.is_empty());
    assert!(store.aggregates("r1", None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn journal_records_replaces_and_purges() {
    let (_dir, store) = temp_store().await;
    let journal = store.journal();
    let now = now_micros();

    journal.record(&task("collection:r1:0", now + 1_000_000)).await.unwrap();
    let mut updated = task("collection:r1:0", now + 1_000_000);
    updated.stage = "FINISHED".into();
    journal.record(&updated).await.unwrap();
    journal.record(&task("collection:r2:1", now - 1)).await.unwrap();

    let tasks = journal.list().await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0], updated);

    assert_eq!(journal.purge_expired(now).await.unwrap(), 1);
    journal.remove("collection:r1:0").await.unwrap();
    assert!(journal.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn scheduler_prune_purges_stale_journal_entries() {
    let h = Harness::new(registry(vec![])).await;
    let now = now_micros();
    let journal = h.store.journal();
    journal.record(&task("collection:r1:0", now - 1)).await.unwrap();
    journal.record(&task("collection:r2:0", now + 60_000_000)).await.unwrap();

    let stats = SchedulerStats::default();
    scheduler::prune(&h.ctx, &stats).await;

    let remaining = journal.list().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].task_id, "collection:r2:0");
    assert_eq!(stats.rows_pruned.load(Ordering::Relaxed), 0);
}
