//! Integration tests for the event log, consumer offsets, and the
//! insert-if-absent stores (occurrences, audit, dead letters).
//!
//! **IMPORTANT**: These tests require a migrated PostgreSQL database.
//! Run with `cargo test -p tasksync-db -- --ignored --test-threads=1`.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use tasksync_db::test_fixtures::TestDatabase;
use tasksync_db::{
    AuditRepository, DeadLetterRepository, Envelope, EventStore, EventType, NewDeadLetter,
    OccurrenceRepository, OffsetStore,
};

fn unique_topic(tag: &str) -> String {
    format!("{tag}-{}", Uuid::new_v4())
}

fn envelope(event_type: EventType) -> Envelope {
    Envelope::new(
        event_type,
        Uuid::new_v4(),
        Uuid::new_v4(),
        json!({"title": "integration"}),
    )
}

#[tokio::test]
#[ignore] // requires PostgreSQL
async fn test_append_is_insert_if_absent_on_event_id() {
    let test_db = TestDatabase::new().await;
    let events = &test_db.db.events;
    let topic = unique_topic("dedupe");
    let env = envelope(EventType::TaskCreated);

    let first = events.append(&topic, &env).await.unwrap();
    let stored = first.expect("fresh append should store");
    assert_eq!(stored.envelope.event_id, env.event_id);

    let second = events.append(&topic, &env).await.unwrap();
    assert!(second.is_none());

    let log = events.load_after(&topic, 0, 10).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].seq, stored.seq);

    let by_id = events.get_by_event_id(env.event_id).await.unwrap().unwrap();
    assert_eq!(by_id.seq, stored.seq);
    assert_eq!(by_id.topic, topic);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires PostgreSQL
async fn test_load_after_orders_by_seq_and_honors_cursor() {
    let test_db = TestDatabase::new().await;
    let events = &test_db.db.events;
    let topic = unique_topic("ordered");

    let mut seqs = Vec::new();
    for _ in 0..3 {
        let stored = events
            .append(&topic, &envelope(EventType::TaskUpdated))
            .await
            .unwrap()
            .unwrap();
        seqs.push(stored.seq);
    }

    let page = events.load_after(&topic, 0, 2).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].seq, seqs[0]);
    assert_eq!(page[1].seq, seqs[1]);

    let rest = events.load_after(&topic, seqs[1], 10).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].seq, seqs[2]);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires PostgreSQL
async fn test_offset_commit_never_moves_backwards() {
    let test_db = TestDatabase::new().await;
    let offsets = &test_db.db.offsets;
    let topic = unique_topic("offsets");

    assert_eq!(offsets.get(&topic, "audit").await.unwrap(), 0);

    offsets.commit(&topic, "audit", 5).await.unwrap();
    // A stale commit (redelivery after restart) must not rewind the cursor.
    offsets.commit(&topic, "audit", 3).await.unwrap();
    assert_eq!(offsets.get(&topic, "audit").await.unwrap(), 5);

    // Groups on the same topic keep independent cursors.
    offsets.commit(&topic, "mirror", 2).await.unwrap();
    assert_eq!(offsets.get(&topic, "mirror").await.unwrap(), 2);
    assert_eq!(offsets.get(&topic, "audit").await.unwrap(), 5);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires PostgreSQL
async fn test_occurrence_create_if_absent() {
    let test_db = TestDatabase::new().await;
    let occurrences = &test_db.db.occurrences;
    let origin = Uuid::new_v4();
    let due = Utc::now() + chrono::Duration::days(1);

    let created = occurrences.create_if_absent(origin, 2, due).await.unwrap();
    let task_id = created.expect("fresh occurrence should insert");

    // Duplicate delivery of the same completion is a no-op.
    let dup = occurrences.create_if_absent(origin, 2, due).await.unwrap();
    assert!(dup.is_none());

    let row = occurrences.get(origin, 2).await.unwrap().unwrap();
    assert_eq!(row.task_id, task_id);
    assert_eq!(row.origin_task_id, origin);
    assert_eq!(row.occurrence_index, 2);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires PostgreSQL
async fn test_audit_records_each_event_once() {
    let test_db = TestDatabase::new().await;
    let audit = &test_db.db.audit;
    let env = envelope(EventType::ReminderDue);

    assert!(audit.record("reminders", &env).await.unwrap());
    assert!(!audit.record("reminders", &env).await.unwrap());

    let records = audit.list_for_subject(env.subject_id, 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event_id, env.event_id);
    assert_eq!(records[0].event_type, "reminder.due");

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires PostgreSQL
async fn test_dead_letters_record_and_list() {
    let test_db = TestDatabase::new().await;
    let dead_letters = &test_db.db.dead_letters;
    let group = unique_topic("group");

    let older = envelope(EventType::TaskCompleted);
    let newer = envelope(EventType::TaskCompleted);
    for env in [&older, &newer] {
        dead_letters
            .record(NewDeadLetter {
                topic: "task-events",
                consumer_group: &group,
                envelope: env,
                error_message: "unparseable recurrence",
                attempt_count: 5,
                first_failed_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let recent = dead_letters.list_recent(50).await.unwrap();
    let ours: Vec<_> = recent
        .iter()
        .filter(|d| d.consumer_group == group)
        .collect();
    assert_eq!(ours.len(), 2);
    assert_eq!(ours[0].attempt_count, 5);

    test_db.cleanup().await;
}
