//! Conditional updates against a real PostgreSQL.
//!
//! Requires Docker for testcontainers (Postgres). Each test skips when no
//! container can be started.

mod helpers;

use chrono::Utc;
use std::time::Duration;
use uuid::Uuid;

use helpers::TestDb;
use pictor_core::models::{
    BackoffPolicy, DerivativeArtifact, DerivativeFormat, DerivativeStatus, NewSourceImage,
};
use pictor_db::{DerivativeRepository, SourceImageRepository};

fn artifact(key: &str) -> DerivativeArtifact {
    DerivativeArtifact {
        identifier: key.to_string(),
        width: 300,
        height: 200,
        file_size: 1234,
    }
}

#[tokio::test]
async fn upsert_is_insert_if_absent() {
    let Some(db) = TestDb::start().await else {
        return;
    };
    let source = db.source().await;

    let first = db
        .derivatives
        .upsert_pending(source.id, DerivativeFormat::Webp)
        .await
        .unwrap();
    assert_eq!(first.status, DerivativeStatus::Pending);
    assert!(db
        .derivatives
        .transition(
            first.id,
            DerivativeStatus::Pending,
            DerivativeStatus::Processing,
            None
        )
        .await
        .unwrap());

    let second = db
        .derivatives
        .upsert_pending(source.id, DerivativeFormat::Webp)
        .await
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.status, DerivativeStatus::Processing);

    db.derivatives
        .upsert_pending(source.id, DerivativeFormat::Thumbnail(300))
        .await
        .unwrap();
    assert_eq!(
        db.derivatives.list_for_source(source.id).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn transition_rejects_edges_with_dedicated_operations() {
    let Some(db) = TestDb::start().await else {
        return;
    };
    let source = db.source().await;
    let d = db
        .derivatives
        .upsert_pending(source.id, DerivativeFormat::Webp)
        .await
        .unwrap();

    assert!(db
        .derivatives
        .transition(
            d.id,
            DerivativeStatus::Pending,
            DerivativeStatus::Completed,
            None
        )
        .await
        .is_err());
    assert!(db
        .derivatives
        .transition(
            d.id,
            DerivativeStatus::Failed,
            DerivativeStatus::Pending,
            None
        )
        .await
        .is_err());

    // stale `from` loses without an error
    assert!(!db
        .derivatives
        .transition(
            d.id,
            DerivativeStatus::Processing,
            DerivativeStatus::Failed,
            Some("late")
        )
        .await
        .unwrap());
    let unchanged = db.derivatives.get(d.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, DerivativeStatus::Pending);
    assert_eq!(unchanged.error_message, None);
}

#[tokio::test]
async fn complete_requires_processing_and_identifier() {
    let Some(db) = TestDb::start().await else {
        return;
    };
    let source = db.source().await;
    let d = db
        .derivatives
        .upsert_pending(source.id, DerivativeFormat::Webp)
        .await
        .unwrap();

    assert!(!db.derivatives.complete(d.id, &artifact("k")).await.unwrap());
    db.derivatives
        .transition(
            d.id,
            DerivativeStatus::Pending,
            DerivativeStatus::Processing,
            None,
        )
        .await
        .unwrap();
    assert!(db.derivatives.complete(d.id, &artifact("")).await.is_err());
    assert!(db.derivatives.complete(d.id, &artifact("k")).await.unwrap());

    let done = db.derivatives.get(d.id).await.unwrap().unwrap();
    assert_eq!(done.status, DerivativeStatus::Completed);
    assert_eq!(done.identifier, "k");
    assert_eq!((done.width, done.height), (Some(300), Some(200)));
    assert_eq!(done.file_size, Some(1234));

    // terminal
    assert!(!db.derivatives.complete(d.id, &artifact("k2")).await.unwrap());
    assert_eq!(
        db.derivatives.get(d.id).await.unwrap().unwrap().identifier,
        "k"
    );
}

#[tokio::test]
async fn failure_keeps_message_until_success() {
    let Some(db) = TestDb::start().await else {
        return;
    };
    let source = db.source().await;
    let d = db
        .derivatives
        .upsert_pending(source.id, DerivativeFormat::Webp)
        .await
        .unwrap();
    db.derivatives
        .transition(
            d.id,
            DerivativeStatus::Pending,
            DerivativeStatus::Processing,
            None,
        )
        .await
        .unwrap();
    db.derivatives
        .transition(
            d.id,
            DerivativeStatus::Processing,
            DerivativeStatus::Failed,
            Some("decoder exploded"),
        )
        .await
        .unwrap();
    assert_eq!(
        db.derivatives
            .get(d.id)
            .await
            .unwrap()
            .unwrap()
            .error_message
            .as_deref(),
        Some("decoder exploded")
    );

    let policy = BackoffPolicy::new(Duration::from_secs(10));
    assert!(db.derivatives.reset_for_retry(d.id, &policy).await.unwrap());
    db.derivatives
        .transition(
            d.id,
            DerivativeStatus::Pending,
            DerivativeStatus::Processing,
            None,
        )
        .await
        .unwrap();
    assert!(db.derivatives.complete(d.id, &artifact("k")).await.unwrap());

    let done = db.derivatives.get(d.id).await.unwrap().unwrap();
    assert_eq!(done.error_message, None);
    assert_eq!(done.next_retry_at, None);
}

#[tokio::test]
async fn reset_for_retry_increments_and_schedules() {
    let Some(db) = TestDb::start().await else {
        return;
    };
    let source = db.source().await;
    let d = db
        .derivatives
        .upsert_pending(source.id, DerivativeFormat::Webp)
        .await
        .unwrap();
    db.force(d.id, DerivativeStatus::Failed, 2, None, Utc::now())
        .await;

    let before = Utc::now();
    let policy = BackoffPolicy::new(Duration::from_secs(10));
    assert!(db.derivatives.reset_for_retry(d.id, &policy).await.unwrap());
    let after = Utc::now();

    let reset = db.derivatives.get(d.id).await.unwrap().unwrap();
    assert_eq!(reset.status, DerivativeStatus::Pending);
    assert_eq!(reset.retry_count, 3);
    // 10s * 2^3, computed from the database clock
    let next = reset.next_retry_at.unwrap();
    let slack = chrono::Duration::seconds(2);
    assert!(next >= before + chrono::Duration::seconds(80) - slack);
    assert!(next <= after + chrono::Duration::seconds(80) + slack);

    // only from failed
    assert!(!db.derivatives.reset_for_retry(d.id, &policy).await.unwrap());
    assert_eq!(
        db.derivatives.get(d.id).await.unwrap().unwrap().retry_count,
        3
    );
}

#[tokio::test]
async fn reset_for_retry_caps_the_delay() {
    let Some(db) = TestDb::start().await else {
        return;
    };
    let source = db.source().await;
    let d = db
        .derivatives
        .upsert_pending(source.id, DerivativeFormat::Thumbnail(150))
        .await
        .unwrap();
    db.force(d.id, DerivativeStatus::Failed, 9, None, Utc::now())
        .await;

    let policy = BackoffPolicy::new(Duration::from_secs(30)).with_cap(Duration::from_secs(120));
    let before = Utc::now();
    assert!(db.derivatives.reset_for_retry(d.id, &policy).await.unwrap());
    let after = Utc::now();

    let next = db
        .derivatives
        .get(d.id)
        .await
        .unwrap()
        .unwrap()
        .next_retry_at
        .unwrap();
    let slack = chrono::Duration::seconds(2);
    assert!(next >= before + chrono::Duration::seconds(120) - slack);
    assert!(next <= after + chrono::Duration::seconds(120) + slack);
}

#[tokio::test]
async fn orphan_reset_requires_staleness() {
    let Some(db) = TestDb::start().await else {
        return;
    };
    let source = db.source().await;
    let d = db
        .derivatives
        .upsert_pending(source.id, DerivativeFormat::Thumbnail(150))
        .await
        .unwrap();
    db.force(
        d.id,
        DerivativeStatus::Processing,
        0,
        None,
        Utc::now() - chrono::Duration::minutes(30),
    )
    .await;

    let fresh_cutoff = Utc::now() - chrono::Duration::hours(1);
    assert!(!db
        .derivatives
        .reset_orphan_to_pending(d.id, fresh_cutoff)
        .await
        .unwrap());

    let cutoff = Utc::now() - chrono::Duration::minutes(10);
    assert_eq!(db.derivatives.find_orphaned(cutoff, 10).await.unwrap().len(), 1);
    assert!(db
        .derivatives
        .reset_orphan_to_pending(d.id, cutoff)
        .await
        .unwrap());
    assert!(!db
        .derivatives
        .reset_orphan_to_pending(d.id, cutoff)
        .await
        .unwrap());
    assert_eq!(
        db.derivatives.get(d.id).await.unwrap().unwrap().status,
        DerivativeStatus::Pending
    );
}

#[tokio::test]
async fn orphan_reset_refreshes_stale_pending() {
    let Some(db) = TestDb::start().await else {
        return;
    };
    let source = db.source().await;
    let d = db
        .derivatives
        .upsert_pending(source.id, DerivativeFormat::Webp)
        .await
        .unwrap();
    db.force(
        d.id,
        DerivativeStatus::Pending,
        0,
        None,
        Utc::now() - chrono::Duration::minutes(30),
    )
    .await;

    let cutoff = Utc::now() - chrono::Duration::minutes(10);
    let found = db.derivatives.find_orphaned(cutoff, 10).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].status, DerivativeStatus::Pending);

    assert!(db
        .derivatives
        .reset_orphan_to_pending(d.id, cutoff)
        .await
        .unwrap());
    let refreshed = db.derivatives.get(d.id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, DerivativeStatus::Pending);
    assert!(refreshed.updated_at > cutoff);
    assert_eq!(refreshed.retry_count, 0);

    // a second scanner racing on the same cutoff loses
    assert!(!db
        .derivatives
        .reset_orphan_to_pending(d.id, cutoff)
        .await
        .unwrap());
    assert!(db
        .derivatives
        .find_orphaned(cutoff, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn orphan_scan_skips_terminal_records() {
    let Some(db) = TestDb::start().await else {
        return;
    };
    let source = db.source().await;
    let d = db
        .derivatives
        .upsert_pending(source.id, DerivativeFormat::Webp)
        .await
        .unwrap();
    db.force(
        d.id,
        DerivativeStatus::Failed,
        1,
        None,
        Utc::now() - chrono::Duration::hours(2),
    )
    .await;

    let cutoff = Utc::now() - chrono::Duration::minutes(10);
    assert!(db
        .derivatives
        .find_orphaned(cutoff, 10)
        .await
        .unwrap()
        .is_empty());
    assert!(!db
        .derivatives
        .reset_orphan_to_pending(d.id, cutoff)
        .await
        .unwrap());
    assert_eq!(
        db.derivatives.get(d.id).await.unwrap().unwrap().status,
        DerivativeStatus::Failed
    );
}

#[tokio::test]
async fn find_retryable_respects_ceiling_and_schedule() {
    let Some(db) = TestDb::start().await else {
        return;
    };
    let source = db.source().await;
    let now = Utc::now();
    let old = now - chrono::Duration::minutes(30);

    let due = db
        .derivatives
        .upsert_pending(source.id, DerivativeFormat::Webp)
        .await
        .unwrap();
    db.force(
        due.id,
        DerivativeStatus::Failed,
        2,
        Some(now - chrono::Duration::minutes(1)),
        old,
    )
    .await;

    let exhausted = db
        .derivatives
        .upsert_pending(source.id, DerivativeFormat::Thumbnail(150))
        .await
        .unwrap();
    db.force(exhausted.id, DerivativeStatus::Failed, 3, None, old)
        .await;

    let later = db
        .derivatives
        .upsert_pending(source.id, DerivativeFormat::Thumbnail(300))
        .await
        .unwrap();
    db.force(
        later.id,
        DerivativeStatus::Failed,
        0,
        Some(now + chrono::Duration::minutes(5)),
        old,
    )
    .await;

    let never_scheduled = db
        .derivatives
        .upsert_pending(source.id, DerivativeFormat::Thumbnail(600))
        .await
        .unwrap();
    db.force(
        never_scheduled.id,
        DerivativeStatus::Failed,
        0,
        None,
        old + chrono::Duration::seconds(1),
    )
    .await;

    let found: Vec<Uuid> = db
        .derivatives
        .find_retryable(3, now, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(found, vec![due.id, never_scheduled.id]);

    let limited = db.derivatives.find_retryable(3, now, 1).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].id, due.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_one_winner() {
    let Some(db) = TestDb::start().await else {
        return;
    };
    let source = db.source().await;
    let d = db
        .derivatives
        .upsert_pending(source.id, DerivativeFormat::Webp)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let repo = db.derivatives.clone();
        handles.push(tokio::spawn(async move {
            repo.transition(
                d.id,
                DerivativeStatus::Pending,
                DerivativeStatus::Processing,
                None,
            )
            .await
            .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_upserts_share_one_record() {
    let Some(db) = TestDb::start().await else {
        return;
    };
    let source = db.source().await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let repo = db.derivatives.clone();
        let source_id = source.id;
        handles.push(tokio::spawn(async move {
            repo.upsert_pending(source_id, DerivativeFormat::Thumbnail(150))
                .await
                .unwrap()
                .id
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(
        db.derivatives.list_for_source(source.id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn source_images_are_unique_by_hash() {
    let Some(db) = TestDb::start().await else {
        return;
    };
    let input = NewSourceImage {
        file_name: "a.png".to_string(),
        content_type: "image/png".to_string(),
        content_hash: "abc".to_string(),
        storage_key: "originals/ab/abc.png".to_string(),
        file_size: 10,
    };

    let first = db.sources.create(input.clone()).await.unwrap();
    let second = db.sources.create(input).await.unwrap();
    assert_eq!(first.id, second.id);

    assert!(db.sources.set_dimensions(first.id, 640, 480).await.unwrap());
    let found = db.sources.find_by_hash("abc").await.unwrap().unwrap();
    assert_eq!((found.width, found.height), (Some(640), Some(480)));
    assert!(!db.sources.set_dimensions(Uuid::new_v4(), 1, 1).await.unwrap());
}
