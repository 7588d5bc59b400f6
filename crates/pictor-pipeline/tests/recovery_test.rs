//! Retry and orphan recovery, and the operator retry path.

mod helpers;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use helpers::encoder::{Behaviour, FakeEncoder};
use helpers::fixtures::create_test_png;
use helpers::Harness;
use pictor_core::models::{Derivative, DerivativeFormat, DerivativeStatus};
use pictor_core::AppError;
use pictor_db::DerivativeRepository;
use pictor_pipeline::{spawn_periodic, PeriodicJob, ScanReport};

async fn seed(
    harness: &Harness,
    format: DerivativeFormat,
    edit: impl FnOnce(&mut Derivative),
) -> Derivative {
    let source = harness
        .add_source(&format!("{}.png", format), create_test_png(20, 20))
        .await;
    let mut record = harness
        .derivatives
        .upsert_pending(source.id, format)
        .await
        .unwrap();
    edit(&mut record);
    harness.derivatives.put(record.clone()).await;
    record
}

#[tokio::test]
async fn orphan_scan_resets_stale_processing_and_resubmits_once() {
    let encoder = Arc::new(FakeEncoder::new(Behaviour::Succeed));
    let harness = Harness::with_encoder(encoder.clone(), 1, 16);
    let orphan = seed(&harness, DerivativeFormat::Webp, |d| {
        d.status = DerivativeStatus::Processing;
        d.updated_at = Utc::now() - chrono::Duration::minutes(20);
    })
    .await;

    let gate = harness.block_workers(1).await;
    let accepted_before = harness.pool.stats().accepted;

    let report = harness.orphan_scanner().scan().await.unwrap();
    assert_eq!(
        report,
        ScanReport {
            found: 1,
            handled: 1,
            dispatched: 1,
            skipped: 0,
        }
    );
    assert_eq!(
        harness.derivative(orphan.id).await.status,
        DerivativeStatus::Pending
    );
    assert_eq!(harness.pool.stats().accepted - accepted_before, 1);

    // already pending, nothing left to recover
    let again = harness.orphan_scanner().scan().await.unwrap();
    assert_eq!(again.found, 0);
    assert_eq!(harness.pool.stats().accepted - accepted_before, 1);

    gate.release();
    harness
        .wait_for_status(orphan.id, DerivativeStatus::Completed)
        .await;
    assert_eq!(encoder.calls(), 1);
}

#[tokio::test]
async fn orphan_scan_recovers_record_dropped_by_full_queue() {
    let encoder = Arc::new(FakeEncoder::new(Behaviour::Succeed));
    let harness = Harness::with_encoder(encoder.clone(), 1, 1);
    let orphan = seed(&harness, DerivativeFormat::Webp, |d| {
        d.status = DerivativeStatus::Processing;
        d.updated_at = Utc::now() - chrono::Duration::minutes(20);
    })
    .await;

    let gate = harness.block_workers(1).await;
    harness.fill_queue().await;

    let report = harness.orphan_scanner().scan().await.unwrap();
    assert_eq!(
        report,
        ScanReport {
            found: 1,
            handled: 1,
            dispatched: 0,
            skipped: 1,
        }
    );
    assert_eq!(
        harness.derivative(orphan.id).await.status,
        DerivativeStatus::Pending
    );

    gate.release();
    while harness.pool.queued() > 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // pending but freshly reset, not stale yet
    assert_eq!(harness.orphan_scanner().scan().await.unwrap().found, 0);

    harness
        .settings
        .update(|s| s.orphan_stale_after = Duration::ZERO)
        .await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = harness.orphan_scanner().scan().await.unwrap();
    assert_eq!(report.found, 1);
    assert_eq!(report.dispatched, 1);

    let done = harness
        .wait_for_status(orphan.id, DerivativeStatus::Completed)
        .await;
    assert_eq!(done.retry_count, 0);
    assert_eq!(encoder.calls(), 1);
}

#[tokio::test]
async fn orphan_scan_does_not_duplicate_a_queued_task() {
    let harness = Harness::with_encoder(Arc::new(FakeEncoder::new(Behaviour::Succeed)), 1, 8);
    let source = harness.add_source("a.png", create_test_png(20, 20)).await;
    let gate = harness.block_workers(1).await;

    harness
        .dispatcher
        .dispatch(&source, DerivativeFormat::Webp)
        .await
        .unwrap();
    harness
        .settings
        .update(|s| s.orphan_stale_after = Duration::ZERO)
        .await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    // stale by the clock, but its task is still waiting in the queue
    let report = harness.orphan_scanner().scan().await.unwrap();
    assert_eq!(report.found, 1);
    assert_eq!(report.dispatched, 0);
    assert_eq!(harness.pool.queued(), 1);

    gate.release();
    let record = harness
        .derivatives
        .get_by_source_and_format(source.id, DerivativeFormat::Webp)
        .await
        .unwrap()
        .unwrap();
    harness
        .wait_for_status(record.id, DerivativeStatus::Completed)
        .await;
}

#[tokio::test]
async fn orphan_scan_ignores_recent_processing() {
    let harness = Harness::new();
    let busy = seed(&harness, DerivativeFormat::Webp, |d| {
        d.status = DerivativeStatus::Processing;
    })
    .await;

    let report = harness.orphan_scanner().scan().await.unwrap();
    assert_eq!(report.found, 0);
    assert_eq!(
        harness.derivative(busy.id).await.status,
        DerivativeStatus::Processing
    );
}

#[tokio::test]
async fn retry_scan_requeues_due_failures_only() {
    let harness = Harness::with_encoder(Arc::new(FakeEncoder::new(Behaviour::Succeed)), 1, 16);
    let due = seed(&harness, DerivativeFormat::Webp, |d| {
        d.status = DerivativeStatus::Failed;
        d.retry_count = 2;
        d.error_message = Some("decoder crashed".to_string());
        d.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
    })
    .await;
    let exhausted = seed(&harness, DerivativeFormat::Thumbnail(150), |d| {
        d.status = DerivativeStatus::Failed;
        d.retry_count = 3;
        d.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
    })
    .await;
    let scheduled = seed(&harness, DerivativeFormat::Thumbnail(300), |d| {
        d.status = DerivativeStatus::Failed;
        d.retry_count = 1;
        d.next_retry_at = Some(Utc::now() + chrono::Duration::minutes(5));
    })
    .await;

    let gate = harness.block_workers(1).await;
    let report = harness.retry_scanner().scan().await.unwrap();
    assert_eq!(report.found, 1);
    assert_eq!(report.dispatched, 1);

    let reset = harness.derivative(due.id).await;
    assert_eq!(reset.status, DerivativeStatus::Pending);
    assert_eq!(reset.retry_count, 3);
    // base 30s doubled three times
    let next = reset.next_retry_at.expect("retry scheduled");
    assert!(next > Utc::now() + chrono::Duration::seconds(200));

    let untouched = harness.derivative(exhausted.id).await;
    assert_eq!(untouched.status, DerivativeStatus::Failed);
    assert_eq!(untouched.retry_count, 3);
    let later = harness.derivative(scheduled.id).await;
    assert_eq!(later.status, DerivativeStatus::Failed);
    assert_eq!(later.retry_count, 1);

    gate.release();
    let done = harness
        .wait_for_status(due.id, DerivativeStatus::Completed)
        .await;
    assert!(done.error_message.is_none());
    assert_eq!(done.retry_count, 3);
}

#[tokio::test]
async fn retry_scan_treats_missing_schedule_as_due() {
    let harness = Harness::new();
    let failed = seed(&harness, DerivativeFormat::Webp, |d| {
        d.status = DerivativeStatus::Failed;
        d.next_retry_at = None;
    })
    .await;

    let report = harness.retry_scanner().scan().await.unwrap();
    assert_eq!(report.handled, 1);
    harness
        .wait_for_status(failed.id, DerivativeStatus::Completed)
        .await;
}

#[tokio::test]
async fn periodic_retry_job_recovers_failed_records() {
    let harness = Harness::new();
    harness
        .settings
        .update(|s| s.retry_scan_interval = Duration::from_millis(10))
        .await;
    let failed = seed(&harness, DerivativeFormat::Webp, |d| {
        d.status = DerivativeStatus::Failed;
    })
    .await;

    let job: Arc<dyn PeriodicJob> = Arc::new(harness.retry_scanner());
    assert_eq!(job.interval().await, Duration::from_millis(10));

    let cancel = CancellationToken::new();
    let handle = spawn_periodic(job, cancel.clone());
    harness
        .wait_for_status(failed.id, DerivativeStatus::Completed)
        .await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("job stops on cancel")
        .unwrap();
}

#[tokio::test]
async fn manual_retry_ignores_ceiling_and_schedule() {
    let harness = Harness::with_encoder(Arc::new(FakeEncoder::new(Behaviour::Succeed)), 1, 16);
    let failed = seed(&harness, DerivativeFormat::Webp, |d| {
        d.status = DerivativeStatus::Failed;
        d.retry_count = 7;
        d.next_retry_at = Some(Utc::now() + chrono::Duration::hours(1));
    })
    .await;
    let service = harness.service();

    let gate = harness.block_workers(1).await;
    let retried = service.retry(failed.id).await.unwrap();
    assert_eq!(retried.status, DerivativeStatus::Pending);
    assert_eq!(retried.retry_count, 8);

    gate.release();
    harness
        .wait_for_status(failed.id, DerivativeStatus::Completed)
        .await;

    let err = service.retry(failed.id).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    let err = service.retry(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn manual_retry_waits_for_queue_space() {
    let harness = Harness::with_encoder(Arc::new(FakeEncoder::new(Behaviour::Succeed)), 1, 1);
    let failed = seed(&harness, DerivativeFormat::Webp, |d| {
        d.status = DerivativeStatus::Failed;
    })
    .await;
    let service = harness.service();

    let gate = harness.block_workers(1).await;
    harness.fill_queue().await;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        gate.release();
    });

    let retried = service.retry(failed.id).await.unwrap();
    assert_eq!(retried.retry_count, 1);
    harness
        .wait_for_status(failed.id, DerivativeStatus::Completed)
        .await;
}

#[tokio::test]
async fn manual_retry_gives_up_when_queue_stays_full() {
    let harness = Harness::with_encoder(Arc::new(FakeEncoder::new(Behaviour::Succeed)), 1, 1);
    let failed = seed(&harness, DerivativeFormat::Webp, |d| {
        d.status = DerivativeStatus::Failed;
    })
    .await;

    let _gate = harness.block_workers(1).await;
    harness.fill_queue().await;

    let err = harness.service().retry(failed.id).await.unwrap_err();
    assert!(err.is_temporary());
    assert_eq!(
        harness.derivative(failed.id).await.status,
        DerivativeStatus::Pending
    );
    assert!(!harness.ctx.queued.contains(failed.id).await);
}

#[tokio::test]
async fn service_lists_and_generates_derivatives() {
    let harness = Harness::new();
    let source = harness.add_source("a.png", create_test_png(20, 20)).await;
    let service = harness.service();

    assert!(service.list_for_source(source.id).await.unwrap().is_empty());
    let outcomes = service.generate(source.id).await.unwrap();
    assert_eq!(outcomes.len(), 3);

    let listed = service.list_for_source(source.id).await.unwrap();
    assert_eq!(listed.len(), 3);
    for record in &listed {
        harness
            .wait_for_status(record.id, DerivativeStatus::Completed)
            .await;
    }

    let webp = service
        .find(source.id, DerivativeFormat::Webp)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(service.get(webp.id).await.unwrap().id, webp.id);
    assert!(service.generate(uuid::Uuid::new_v4()).await.unwrap_err().is_not_found());
}
