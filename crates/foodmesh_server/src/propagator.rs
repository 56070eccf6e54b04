//! Outbox propagator — background task that leases unpublished events,
//! forwards them to the broker and marks them published.
//!
//! Delivery is at-least-once: the row is only marked published after the
//! broker ACK, so a crash in between re-emits on restart and consumers
//! deduplicate by event id. Publish failures leave the row untouched; the
//! poll cadence itself is the retry backoff.
//!
//! The lease pins a database connection while its row locks are held, so
//! broker I/O must stay bounded: every publish carries a deadline, and the
//! first failure or timeout settles the rest of the batch as `Retry`
//! rather than grinding through more doomed round trips.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;

use foodmesh_core::ports::{EventOutcome, EventSink, OutboxStore, Result};

#[derive(Debug, Clone)]
pub struct PropagatorConfig {
    pub interval: Duration,
    pub batch_size: i64,
    /// Events older than this AND stale-droppable are marked published
    /// without emitting.
    pub stale_after: chrono::Duration,
    /// Deadline per broker publish. Caps how long the lease's row locks
    /// and connection can be held on a hung broker.
    pub publish_timeout: Duration,
}

impl Default for PropagatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 50,
            stale_after: chrono::Duration::minutes(5),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Propagator {
    outbox: Arc<dyn OutboxStore>,
    sink: Arc<dyn EventSink>,
    cfg: PropagatorConfig,
}

impl Propagator {
    pub fn new(outbox: Arc<dyn OutboxStore>, sink: Arc<dyn EventSink>, cfg: PropagatorConfig) -> Self {
        Self { outbox, sink, cfg }
    }

    /// One poll pass. Returns the number of events forwarded to the broker
    /// (dropped-stale events are settled but not counted).
    pub async fn poll_and_publish(&self) -> Result<usize> {
        let lease = self.outbox.lease_batch(self.cfg.batch_size).await?;
        if lease.events().is_empty() {
            lease.settle(Vec::new()).await?;
            return Ok(0);
        }

        let now = chrono::Utc::now();
        let mut outcomes = Vec::with_capacity(lease.events().len());
        let mut forwarded = 0usize;
        let mut broker_down = false;

        for event in lease.events() {
            // Once the broker misbehaves, settle the rest as retries
            // instead of holding the lease through more timeouts.
            if broker_down {
                outcomes.push(EventOutcome::Retry);
                continue;
            }

            let age = now - event.created_at;
            if age > self.cfg.stale_after && event.kind.stale_droppable() {
                tracing::debug!(
                    event_id = %event.id,
                    kind = event.kind.as_str(),
                    age_secs = age.num_seconds(),
                    "dropped_stale"
                );
                outcomes.push(EventOutcome::DroppedStale);
                continue;
            }

            let payload = match serde_json::to_vec(event) {
                Ok(bytes) => Bytes::from(bytes),
                Err(err) => {
                    // Unserializable rows would wedge the queue forever;
                    // count them as dropped and move on.
                    tracing::error!(event_id = %event.id, error = %err, "event serialization failed");
                    outcomes.push(EventOutcome::DroppedStale);
                    continue;
                }
            };

            let publish = self
                .sink
                .publish(event.kind.subject(), event.correlation_id, payload);
            match tokio::time::timeout(self.cfg.publish_timeout, publish).await {
                Ok(Ok(())) => {
                    outcomes.push(EventOutcome::Published);
                    forwarded += 1;
                }
                Ok(Err(err)) => {
                    tracing::warn!(
                        event_id = %event.id,
                        subject = event.kind.subject(),
                        error = %err,
                        "publish failed, will retry next poll"
                    );
                    outcomes.push(EventOutcome::Retry);
                    broker_down = true;
                }
                Err(_) => {
                    tracing::warn!(
                        event_id = %event.id,
                        subject = event.kind.subject(),
                        timeout_ms = self.cfg.publish_timeout.as_millis() as u64,
                        "publish deadline elapsed, will retry next poll"
                    );
                    outcomes.push(EventOutcome::Retry);
                    broker_down = true;
                }
            }
        }

        lease.settle(outcomes).await?;
        Ok(forwarded)
    }

    /// Run the poll loop until shutdown. Spawn via `tokio::spawn`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.cfg.interval.as_millis() as u64,
            batch_size = self.cfg.batch_size,
            "outbox propagator started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.poll_and_publish().await {
                Ok(count) if count > 0 => {
                    tracing::debug!(count, "outbox events forwarded");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "outbox poll failed");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("outbox propagator stopped");
    }
}
