//! Integration tests for the scheduled-job repository.
//!
//! Exercises the state machine against real PostgreSQL: the SKIP LOCKED claim
//! batch, the pending-only cancel CAS, upsert-reschedule resets, the stale
//! `firing` reclaim window, and dispatch recording.
//!
//! **IMPORTANT**: These tests require a migrated PostgreSQL database.
//! Run with `cargo test -p tasksync-db -- --ignored --test-threads=1`.

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use tasksync_db::test_fixtures::TestDatabase;
use tasksync_db::{defaults, DispatchStatus, Error, JobStatus, ScheduledJobRepository};

fn unique_job_id(tag: &str) -> String {
    format!("{tag}:{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore] // requires PostgreSQL
async fn test_claim_due_claims_past_due_pending() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let job_id = unique_job_id("claim-due");

    jobs.upsert(&job_id, Utc::now() - Duration::minutes(1), json!({"n": 1}))
        .await
        .unwrap();

    let claimed = jobs.claim_due(Utc::now(), 100).await.unwrap();
    let job = claimed
        .iter()
        .find(|j| j.job_id == job_id)
        .expect("past-due job should be claimed");

    assert_eq!(job.status, JobStatus::Firing);
    assert_eq!(job.attempt_count, 1);
    assert!(job.claimed_at.is_some());

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires PostgreSQL
async fn test_claim_due_skips_future_and_cancelled() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let future_id = unique_job_id("future");
    let cancelled_id = unique_job_id("cancelled");

    jobs.upsert(&future_id, Utc::now() + Duration::hours(1), json!({}))
        .await
        .unwrap();
    jobs.upsert(&cancelled_id, Utc::now() - Duration::minutes(1), json!({}))
        .await
        .unwrap();
    assert!(jobs.cancel(&cancelled_id).await.unwrap());

    let claimed = jobs.claim_due(Utc::now(), 100).await.unwrap();
    assert!(!claimed.iter().any(|j| j.job_id == future_id));
    assert!(!claimed.iter().any(|j| j.job_id == cancelled_id));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires PostgreSQL
async fn test_claim_batch_respects_limit() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let ids: Vec<String> = (0..3).map(|i| unique_job_id(&format!("batch-{i}"))).collect();

    for (i, id) in ids.iter().enumerate() {
        jobs.upsert(id, Utc::now() - Duration::minutes(3 - i as i64), json!({}))
            .await
            .unwrap();
    }

    let first = jobs.claim_due(Utc::now(), 2).await.unwrap();
    assert_eq!(first.iter().filter(|j| ids.contains(&j.job_id)).count(), 2);

    let second = jobs.claim_due(Utc::now(), 100).await.unwrap();
    assert_eq!(second.iter().filter(|j| ids.contains(&j.job_id)).count(), 1);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires PostgreSQL
async fn test_upsert_reschedules_fired_job_to_pending() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let job_id = unique_job_id("resched");

    jobs.upsert(&job_id, Utc::now() - Duration::minutes(1), json!({"run": 1}))
        .await
        .unwrap();
    jobs.claim_due(Utc::now(), 100).await.unwrap();
    assert!(jobs.mark_fired(&job_id).await.unwrap());
    jobs.record_dispatch(&job_id, DispatchStatus::Sent)
        .await
        .unwrap();

    let next_fire = Utc::now() + Duration::hours(1);
    let job = jobs.upsert(&job_id, next_fire, json!({"run": 2})).await.unwrap();

    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt_count, 0);
    assert!(!job.fire_failed);
    assert!(job.last_error.is_none());
    assert!(job.dispatch_status.is_none());
    assert!(job.dispatched_at.is_none());
    assert!(job.claimed_at.is_none());
    assert!(job.fired_at.is_none());
    assert_eq!(job.payload, json!({"run": 2}));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires PostgreSQL
async fn test_cancel_loses_race_against_claim() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let job_id = unique_job_id("cancel-race");

    jobs.upsert(&job_id, Utc::now() - Duration::minutes(1), json!({}))
        .await
        .unwrap();
    jobs.claim_due(Utc::now(), 100).await.unwrap();

    // Claimed first, so the cancel is a no-op and the fire proceeds.
    assert!(!jobs.cancel(&job_id).await.unwrap());
    assert!(jobs.mark_fired(&job_id).await.unwrap());

    let job = jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Fired);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires PostgreSQL
async fn test_stale_firing_job_is_reclaimed() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let job_id = unique_job_id("stale");

    jobs.upsert(&job_id, Utc::now() - Duration::minutes(1), json!({}))
        .await
        .unwrap();
    jobs.claim_due(Utc::now(), 100).await.unwrap();

    // Inside the reclaim window the firing row stays claimed.
    let inside = jobs.claim_due(Utc::now(), 100).await.unwrap();
    assert!(!inside.iter().any(|j| j.job_id == job_id));

    // Past the window it is claimed again with the attempt count advanced.
    let later = Utc::now() + Duration::seconds(defaults::FIRING_RECLAIM_SECS + 60);
    let reclaimed = jobs.claim_due(later, 100).await.unwrap();
    let job = reclaimed
        .iter()
        .find(|j| j.job_id == job_id)
        .expect("stale firing job should be reclaimed");
    assert_eq!(job.status, JobStatus::Firing);
    assert_eq!(job.attempt_count, 2);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires PostgreSQL
async fn test_mark_fire_failed_closes_job_out() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let job_id = unique_job_id("fire-failed");

    jobs.upsert(&job_id, Utc::now() - Duration::minutes(1), json!({}))
        .await
        .unwrap();
    jobs.claim_due(Utc::now(), 100).await.unwrap();
    jobs.mark_fire_failed(&job_id, "notifier unreachable")
        .await
        .unwrap();

    let job = jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Fired);
    assert!(job.fire_failed);
    assert_eq!(job.last_error.as_deref(), Some("notifier unreachable"));

    // Closed out, never reclaimed.
    let later = Utc::now() + Duration::seconds(defaults::FIRING_RECLAIM_SECS + 60);
    let reclaimed = jobs.claim_due(later, 100).await.unwrap();
    assert!(!reclaimed.iter().any(|j| j.job_id == job_id));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires PostgreSQL
async fn test_record_dispatch_requires_existing_job() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let job_id = unique_job_id("dispatch");

    jobs.upsert(&job_id, Utc::now(), json!({})).await.unwrap();
    jobs.record_dispatch(&job_id, DispatchStatus::Sent)
        .await
        .unwrap();

    let job = jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.dispatch_status, Some(DispatchStatus::Sent));
    assert!(job.dispatched_at.is_some());

    let missing = jobs
        .record_dispatch("no-such-job", DispatchStatus::Failed)
        .await;
    assert!(matches!(missing, Err(Error::JobNotFound(_))));

    test_db.cleanup().await;
}
