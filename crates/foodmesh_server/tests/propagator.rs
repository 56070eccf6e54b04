//! Propagator contract tests over the in-memory outbox and a recording
//! sink: ordering, the stale-droppable rule, and at-least-once retry on
//! broker failure.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use foodmesh_core::types::{EventKind, NewOutboxEvent, OutboxEvent};
use foodmesh_harness::mem::{MemOutboxStore, RecordingSink};
use foodmesh_server::propagator::{Propagator, PropagatorConfig};

fn event(kind: EventKind) -> NewOutboxEvent {
    NewOutboxEvent::new(
        Uuid::new_v4(),
        kind,
        serde_json::json!({ "test": kind.as_str() }),
        Uuid::new_v4(),
    )
}

fn propagator(outbox: Arc<MemOutboxStore>, sink: Arc<RecordingSink>) -> Propagator {
    Propagator::new(outbox, sink, PropagatorConfig::default())
}

#[tokio::test]
async fn forwards_in_created_order_and_marks_published() {
    let outbox = MemOutboxStore::new();
    let sink = RecordingSink::new();
    let now = Utc::now();

    outbox.enqueue_at(event(EventKind::SurplusClaimed), now - Duration::seconds(5));
    outbox.enqueue_at(event(EventKind::SurplusPosted), now - Duration::seconds(10));

    let forwarded = propagator(outbox.clone(), sink.clone())
        .poll_and_publish()
        .await
        .unwrap();
    assert_eq!(forwarded, 2);
    assert_eq!(
        sink.subjects(),
        vec!["SURPLUS.posted".to_string(), "SURPLUS.claimed".to_string()]
    );
    assert_eq!(outbox.unpublished_count(), 0);
    assert!(outbox
        .published_events()
        .iter()
        .all(|e| e.published_at.is_some()));
}

#[tokio::test]
async fn stale_otp_is_dropped_but_stale_claim_is_emitted() {
    let outbox = MemOutboxStore::new();
    let sink = RecordingSink::new();
    let stale = Utc::now() - Duration::minutes(6);

    outbox.enqueue_at(event(EventKind::OtpRequested), stale);
    outbox.enqueue_at(event(EventKind::SurplusClaimed), stale);

    let forwarded = propagator(outbox.clone(), sink.clone())
        .poll_and_publish()
        .await
        .unwrap();

    // The six-minute-old claim still matters; the OTP never reaches the
    // broker but is settled so it cannot wedge the queue.
    assert_eq!(forwarded, 1);
    assert_eq!(sink.subjects(), vec!["SURPLUS.claimed".to_string()]);
    assert_eq!(outbox.unpublished_count(), 0);
}

#[tokio::test]
async fn fresh_otp_is_emitted() {
    let outbox = MemOutboxStore::new();
    let sink = RecordingSink::new();
    outbox.enqueue_at(event(EventKind::OtpRequested), Utc::now());

    let forwarded = propagator(outbox.clone(), sink.clone())
        .poll_and_publish()
        .await
        .unwrap();
    assert_eq!(forwarded, 1);
    assert_eq!(sink.subjects(), vec!["AUTH.otp".to_string()]);
}

#[tokio::test]
async fn broker_failure_leaves_rows_for_the_next_poll() {
    let outbox = MemOutboxStore::new();
    let sink = RecordingSink::new();
    outbox.enqueue_at(event(EventKind::SurplusPosted), Utc::now());
    outbox.enqueue_at(event(EventKind::DeliveryCompleted), Utc::now());

    sink.set_failing(true);
    let p = propagator(outbox.clone(), sink.clone());
    assert_eq!(p.poll_and_publish().await.unwrap(), 0);
    assert_eq!(outbox.unpublished_count(), 2);

    // Broker recovers: the next poll delivers both.
    sink.set_failing(false);
    assert_eq!(p.poll_and_publish().await.unwrap(), 2);
    assert_eq!(outbox.unpublished_count(), 0);
}

#[tokio::test]
async fn first_failure_settles_the_rest_as_retries() {
    let outbox = MemOutboxStore::new();
    let sink = RecordingSink::new();
    for _ in 0..3 {
        outbox.enqueue_at(event(EventKind::SurplusPosted), Utc::now());
    }

    sink.set_failing(true);
    let p = propagator(outbox.clone(), sink.clone());
    assert_eq!(p.poll_and_publish().await.unwrap(), 0);

    // One attempt is enough to judge the broker down; the other two are
    // settled as retries without further round trips.
    assert_eq!(sink.attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(outbox.unpublished_count(), 3);
}

#[tokio::test]
async fn hung_broker_hits_the_publish_deadline_and_releases_the_lease() {
    let outbox = MemOutboxStore::new();
    let sink = RecordingSink::new();
    outbox.enqueue_at(event(EventKind::SurplusPosted), Utc::now());
    outbox.enqueue_at(event(EventKind::SurplusClaimed), Utc::now());

    sink.set_delay(std::time::Duration::from_millis(100));
    let p = Propagator::new(
        outbox.clone(),
        sink.clone(),
        PropagatorConfig {
            publish_timeout: std::time::Duration::from_millis(10),
            ..PropagatorConfig::default()
        },
    );

    // The first publish times out; the lease is settled with everything
    // retryable instead of waiting out a second deadline.
    assert_eq!(p.poll_and_publish().await.unwrap(), 0);
    assert_eq!(sink.attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(outbox.unpublished_count(), 2);

    // Broker healthy again: both go out on the next poll.
    sink.set_delay(std::time::Duration::ZERO);
    assert_eq!(p.poll_and_publish().await.unwrap(), 2);
    assert_eq!(outbox.unpublished_count(), 0);
}

#[tokio::test]
async fn published_payload_is_the_full_event() {
    let outbox = MemOutboxStore::new();
    let sink = RecordingSink::new();
    let new_event = event(EventKind::SurplusPosted);
    let (event_id, correlation) = (new_event.id, new_event.correlation_id);
    outbox.enqueue_at(new_event, Utc::now());

    propagator(outbox, sink.clone()).poll_and_publish().await.unwrap();

    let published = sink.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    let (subject, header_correlation, payload) = &published[0];
    assert_eq!(subject, "SURPLUS.posted");
    assert_eq!(*header_correlation, correlation);

    let decoded: OutboxEvent = serde_json::from_slice(payload).unwrap();
    assert_eq!(decoded.id, event_id);
    assert_eq!(decoded.correlation_id, correlation);
}

#[tokio::test]
async fn batch_size_bounds_each_poll() {
    let outbox = MemOutboxStore::new();
    let sink = RecordingSink::new();
    for _ in 0..5 {
        outbox.enqueue_at(event(EventKind::SurplusPosted), Utc::now());
    }

    let p = Propagator::new(
        outbox.clone(),
        sink.clone(),
        PropagatorConfig {
            batch_size: 2,
            ..PropagatorConfig::default()
        },
    );
    assert_eq!(p.poll_and_publish().await.unwrap(), 2);
    assert_eq!(outbox.unpublished_count(), 3);
    assert_eq!(p.poll_and_publish().await.unwrap(), 2);
    assert_eq!(p.poll_and_publish().await.unwrap(), 1);
    assert_eq!(outbox.unpublished_count(), 0);
}
