//! Geo-fanout notifier: consumes `surplus.posted`, enumerates candidates
//! within the radius and pushes notifications with bounded concurrency.
//!
//! Pushes are fire-and-forget — a surplus notification is intrinsically
//! ephemeral, so there is no per-recipient retry. Unreachable recipients
//! accumulate instead; past the threshold the notifier enqueues
//! `surplus.rematch_required` so the food still finds a taker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::ports::{GeoIndex, OutboxStore, PushGateway, Result};
use crate::types::{EventKind, NewOutboxEvent, RematchPayload, SurplusPostedPayload};
use uuid::Uuid;

use crate::geo::GeoPoint;

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub radius_m: f64,
    /// Hard cap on candidates per event.
    pub candidate_cap: usize,
    /// Recipients per dispatch batch.
    pub batch_size: usize,
    /// Batches in flight concurrently.
    pub max_in_flight: usize,
    pub push_timeout: Duration,
    /// Failed-recipient count that triggers a rematch event.
    pub failure_threshold: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            radius_m: 500.0,
            candidate_cap: 10_000,
            batch_size: 100,
            max_in_flight: 50,
            push_timeout: Duration::from_secs(2),
            failure_threshold: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FanoutOutcome {
    pub candidates: usize,
    pub notified: usize,
    pub failed: Vec<String>,
    pub rematch_enqueued: bool,
}

pub struct FanoutNotifier {
    geo: Arc<dyn GeoIndex>,
    push: Arc<dyn PushGateway>,
    outbox: Arc<dyn OutboxStore>,
    cfg: FanoutConfig,
    shutdown: watch::Receiver<bool>,
}

impl FanoutNotifier {
    pub fn new(
        geo: Arc<dyn GeoIndex>,
        push: Arc<dyn PushGateway>,
        outbox: Arc<dyn OutboxStore>,
        cfg: FanoutConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            geo,
            push,
            outbox,
            cfg,
            shutdown,
        }
    }

    /// Fan a posted surplus out to every candidate in the radius, minus
    /// `exclude` (already-failed recipients on a rematch pass).
    pub async fn handle_posted(
        &self,
        posted: &SurplusPostedPayload,
        correlation_id: Uuid,
        exclude: &[String],
    ) -> Result<FanoutOutcome> {
        let center = GeoPoint::new(posted.lat, posted.lon);
        let candidates = self
            .geo
            .query_within(center, self.cfg.radius_m, self.cfg.candidate_cap)
            .await?;
        let candidates: Vec<String> = candidates
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| !exclude.contains(id))
            .collect();

        if candidates.is_empty() {
            tracing::info!(surplus_id = %posted.surplus_id, "no recipients in radius");
            return Ok(FanoutOutcome {
                candidates: 0,
                notified: 0,
                failed: Vec::new(),
                rematch_enqueued: false,
            });
        }

        let title = "Free food nearby".to_string();
        let body = format!(
            "{:.1} kg of {} available within {:.0} m of you",
            posted.quantity_kg,
            posted.category.as_str(),
            self.cfg.radius_m
        );

        let semaphore = Arc::new(Semaphore::new(self.cfg.max_in_flight));
        let mut tasks: JoinSet<Vec<String>> = JoinSet::new();
        let mut attempted = 0usize;

        for chunk in candidates.chunks(self.cfg.batch_size) {
            // Cooperative cancellation: in-flight batches finish, no new
            // batches start.
            if *self.shutdown.borrow() {
                tracing::info!(surplus_id = %posted.surplus_id, "fanout cancelled");
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            attempted += chunk.len();

            let push = Arc::clone(&self.push);
            let batch: Vec<String> = chunk.to_vec();
            let title = title.clone();
            let body = body.clone();
            let push_timeout = self.cfg.push_timeout;
            tasks.spawn(async move {
                let _permit = permit;
                let mut failed = Vec::new();
                for recipient in batch {
                    match tokio::time::timeout(push_timeout, push.push(&recipient, &title, &body))
                        .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            tracing::debug!(recipient, error = %err, "push delivery failure");
                            failed.push(recipient);
                        }
                        Err(_) => {
                            tracing::debug!(recipient, "push timed out");
                            failed.push(recipient);
                        }
                    }
                }
                failed
            });
        }

        let mut failed = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(batch_failed) => failed.extend(batch_failed),
                Err(err) => tracing::error!(error = %err, "fanout batch task panicked"),
            }
        }

        let notified = attempted - failed.len();
        tracing::info!(
            surplus_id = %posted.surplus_id,
            candidates = candidates.len(),
            notified,
            failed = failed.len(),
            "fanout complete"
        );

        let rematch_enqueued = if failed.len() >= self.cfg.failure_threshold {
            let mut excluded: Vec<String> = exclude.to_vec();
            excluded.extend(failed.iter().cloned());
            let payload = RematchPayload {
                surplus_id: posted.surplus_id,
                excluded_recipients: excluded,
            };
            self.outbox
                .enqueue(NewOutboxEvent::new(
                    posted.surplus_id.0,
                    EventKind::RematchRequired,
                    serde_json::to_value(&payload)
                        .map_err(|e| anyhow::anyhow!(e))?,
                    correlation_id,
                ))
                .await?;
            tracing::warn!(
                surplus_id = %posted.surplus_id,
                failed = failed.len(),
                "rematch required enqueued"
            );
            true
        } else {
            false
        };

        Ok(FanoutOutcome {
            candidates: candidates.len(),
            notified,
            failed,
            rematch_enqueued,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::ports::{EventOutcome, OutboxLease};
    use crate::types::{FoodCategory, OutboxEvent, SurplusId};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedGeo {
        recipients: Vec<String>,
        seen_limit: AtomicUsize,
    }

    #[async_trait]
    impl GeoIndex for FixedGeo {
        async fn update_location(&self, _id: &str, _point: GeoPoint) -> Result<()> {
            Ok(())
        }

        async fn query_within(
            &self,
            _center: GeoPoint,
            _radius_m: f64,
            limit: usize,
        ) -> Result<Vec<(String, f64)>> {
            self.seen_limit.store(limit, Ordering::SeqCst);
            Ok(self
                .recipients
                .iter()
                .take(limit)
                .enumerate()
                .map(|(i, id)| (id.clone(), i as f64))
                .collect())
        }
    }

    struct CountingPush {
        delivered: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_prefix: Option<String>,
        delay: Duration,
    }

    impl CountingPush {
        fn new() -> Self {
            Self {
                delivered: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                fail_prefix: None,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl PushGateway for CountingPush {
        async fn push(&self, recipient_id: &str, _title: &str, _body: &str) -> Result<()> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Some(prefix) = &self.fail_prefix {
                if recipient_id.starts_with(prefix.as_str()) {
                    return Err(CoreError::UpstreamUnavailable("device unreachable".into()));
                }
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingOutbox {
        enqueued: Mutex<Vec<NewOutboxEvent>>,
    }

    struct EmptyLease;

    #[async_trait]
    impl OutboxLease for EmptyLease {
        fn events(&self) -> &[OutboxEvent] {
            &[]
        }
        async fn settle(self: Box<Self>, _outcomes: Vec<EventOutcome>) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl OutboxStore for RecordingOutbox {
        async fn enqueue(&self, event: NewOutboxEvent) -> Result<()> {
            self.enqueued.lock().unwrap().push(event);
            Ok(())
        }
        async fn lease_batch(&self, _batch_size: i64) -> Result<Box<dyn OutboxLease>> {
            Ok(Box::new(EmptyLease))
        }
    }

    fn posted() -> SurplusPostedPayload {
        SurplusPostedPayload {
            surplus_id: SurplusId::new(),
            provider_id: "provider-1".into(),
            lat: -6.2,
            lon: 106.8,
            quantity_kg: 5.0,
            category: FoodCategory::Bread,
            expiry_time: Utc::now() + chrono::Duration::hours(2),
        }
    }

    fn notifier(
        geo: Arc<FixedGeo>,
        push: Arc<CountingPush>,
        outbox: Arc<RecordingOutbox>,
        cfg: FanoutConfig,
    ) -> FanoutNotifier {
        let (_tx, rx) = watch::channel(false);
        FanoutNotifier::new(geo, push, outbox, cfg, rx)
    }

    #[tokio::test]
    async fn pushes_every_candidate_up_to_the_cap() {
        let geo = Arc::new(FixedGeo {
            recipients: (0..10_001).map(|i| format!("r{i}")).collect(),
            seen_limit: AtomicUsize::new(0),
        });
        let push = Arc::new(CountingPush::new());
        let outbox = Arc::new(RecordingOutbox::default());
        let n = notifier(geo.clone(), push.clone(), outbox, FanoutConfig::default());

        let outcome = n.handle_posted(&posted(), Uuid::new_v4(), &[]).await.unwrap();
        assert_eq!(geo.seen_limit.load(Ordering::SeqCst), 10_000);
        assert_eq!(outcome.candidates, 10_000);
        assert_eq!(push.delivered.load(Ordering::SeqCst), 10_000);
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test]
    async fn concurrency_stays_within_the_semaphore() {
        let geo = Arc::new(FixedGeo {
            recipients: (0..40).map(|i| format!("r{i}")).collect(),
            seen_limit: AtomicUsize::new(0),
        });
        let push = Arc::new(CountingPush {
            delay: Duration::from_millis(20),
            ..CountingPush::new()
        });
        let outbox = Arc::new(RecordingOutbox::default());
        let cfg = FanoutConfig {
            batch_size: 1,
            max_in_flight: 4,
            ..FanoutConfig::default()
        };
        let n = notifier(geo, push.clone(), outbox, cfg);

        n.handle_posted(&posted(), Uuid::new_v4(), &[]).await.unwrap();
        assert!(
            push.max_in_flight.load(Ordering::SeqCst) <= 4,
            "observed {} concurrent pushes",
            push.max_in_flight.load(Ordering::SeqCst)
        );
        assert_eq!(push.delivered.load(Ordering::SeqCst), 40);
    }

    #[tokio::test]
    async fn accumulated_failures_enqueue_rematch_with_exclusions() {
        let geo = Arc::new(FixedGeo {
            recipients: (0..30).map(|i| format!("dead-{i}")).collect(),
            seen_limit: AtomicUsize::new(0),
        });
        let push = Arc::new(CountingPush {
            fail_prefix: Some("dead-".into()),
            ..CountingPush::new()
        });
        let outbox = Arc::new(RecordingOutbox::default());
        let n = notifier(geo, push, outbox.clone(), FanoutConfig::default());

        let event = posted();
        let outcome = n.handle_posted(&event, Uuid::new_v4(), &[]).await.unwrap();
        assert_eq!(outcome.failed.len(), 30);
        assert!(outcome.rematch_enqueued);

        let enqueued = outbox.enqueued.lock().unwrap();
        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].kind, EventKind::RematchRequired);
        let payload: RematchPayload = serde_json::from_value(enqueued[0].payload.clone()).unwrap();
        assert_eq!(payload.surplus_id, event.surplus_id);
        assert_eq!(payload.excluded_recipients.len(), 30);
    }

    #[tokio::test]
    async fn below_threshold_failures_do_not_rematch() {
        let geo = Arc::new(FixedGeo {
            recipients: vec!["dead-1".into(), "ok-1".into(), "ok-2".into()],
            seen_limit: AtomicUsize::new(0),
        });
        let push = Arc::new(CountingPush {
            fail_prefix: Some("dead-".into()),
            ..CountingPush::new()
        });
        let outbox = Arc::new(RecordingOutbox::default());
        let n = notifier(geo, push, outbox.clone(), FanoutConfig::default());

        let outcome = n.handle_posted(&posted(), Uuid::new_v4(), &[]).await.unwrap();
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.notified, 2);
        assert!(!outcome.rematch_enqueued);
        assert!(outbox.enqueued.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn excluded_recipients_are_skipped() {
        let geo = Arc::new(FixedGeo {
            recipients: vec!["a".into(), "b".into(), "c".into()],
            seen_limit: AtomicUsize::new(0),
        });
        let push = Arc::new(CountingPush::new());
        let outbox = Arc::new(RecordingOutbox::default());
        let n = notifier(geo, push.clone(), outbox, FanoutConfig::default());

        let outcome = n
            .handle_posted(&posted(), Uuid::new_v4(), &["b".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome.candidates, 2);
        assert_eq!(push.delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_new_batches() {
        let geo = Arc::new(FixedGeo {
            recipients: (0..50).map(|i| format!("r{i}")).collect(),
            seen_limit: AtomicUsize::new(0),
        });
        let push = Arc::new(CountingPush::new());
        let outbox = Arc::new(RecordingOutbox::default());
        let (tx, rx) = watch::channel(true); // already cancelled
        let n = FanoutNotifier::new(geo, push.clone(), outbox, FanoutConfig::default(), rx);

        let outcome = n.handle_posted(&posted(), Uuid::new_v4(), &[]).await.unwrap();
        assert_eq!(outcome.notified, 0);
        assert_eq!(push.delivered.load(Ordering::SeqCst), 0);
        drop(tx);
    }
}
