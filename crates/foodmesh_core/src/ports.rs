//! Capability traits — implemented by foodmesh_postgres and the server's
//! in-process adapters. Core logic depends only on these traits, never on
//! sqlx or the broker client directly.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoreError;
use crate::geo::GeoPoint;
use crate::types::*;

pub type Result<T> = std::result::Result<T, CoreError>;

// ── Surplus aggregate store ───────────────────────────────────

/// Everything written by a winning claim, committed in one transaction:
/// the CAS status flip, the `surplus.claimed` outbox event, the delivery
/// record and (when an idempotency token was supplied) the claim receipt.
#[derive(Debug, Clone)]
pub struct ClaimWrite {
    pub item_id: SurplusId,
    pub claimant_id: String,
    pub expected_version: i64,
    pub event: NewOutboxEvent,
    pub delivery: DeliveryRecord,
    pub receipt_token: Option<String>,
    pub receipt: ClaimReceipt,
}

#[async_trait]
pub trait SurplusStore: Send + Sync {
    /// Insert the item and its `surplus.posted` event atomically.
    /// If the transaction commits the event is durably queued; if it
    /// aborts the event is never observed.
    async fn create_with_event(&self, item: &SurplusItem, event: NewOutboxEvent) -> Result<()>;

    async fn get(&self, id: SurplusId) -> Result<SurplusItem>;

    /// Available items ordered by expiry ascending.
    async fn marketplace(&self, limit: i64) -> Result<Vec<SurplusItem>>;

    /// Conditional available→claimed transition. The predicate
    /// (`status = 'available' AND expiry_time > now() AND version = $n`)
    /// is evaluated with the database clock. Returns `Ok(false)` when zero
    /// rows were affected — the claim lost the race.
    async fn try_claim(&self, write: ClaimWrite) -> Result<bool>;

    /// Prior outcome recorded under an idempotency token, if any.
    async fn find_receipt(&self, token: &str) -> Result<Option<ClaimReceipt>>;

    /// Confirm a pickup by verification code: flips the delivery and the
    /// item to delivered and enqueues `delivery.completed`, atomically.
    /// Returns the item id, or None when no open delivery matches.
    async fn confirm_pickup(
        &self,
        provider_id: &str,
        verification_code: &str,
        correlation_id: Uuid,
    ) -> Result<Option<SurplusId>>;

    /// Conditional claimed→cancelled transition (dispute or timeout),
    /// clearing the claimant. Returns `Ok(false)` when the item is not
    /// currently claimed by `claimant_id`.
    async fn cancel_claim(&self, id: SurplusId, claimant_id: &str) -> Result<bool>;

    /// Flip every due `available` item to `expired` and enqueue one
    /// `surplus.expired` event per item, in a single transaction.
    async fn expire_due(&self, correlation_id: Uuid) -> Result<Vec<SurplusId>>;
}

// ── Outbox ────────────────────────────────────────────────────

/// Disposition of a leased event after a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Broker acknowledged — mark `published = true`.
    Published,
    /// Stale-droppable and past the staleness horizon — mark published
    /// without emitting.
    DroppedStale,
    /// Publish failed — leave the row untouched for the next poll.
    Retry,
}

/// A claimed batch of unpublished events. Row locks are held for the life
/// of the lease, so no other propagator instance can emit the same events
/// concurrently; a crash before `settle` leaves them unpublished, which is
/// the intended at-least-once window.
#[async_trait]
pub trait OutboxLease: Send {
    fn events(&self) -> &[OutboxEvent];

    /// Apply one outcome per event (same order as `events()`) and commit.
    async fn settle(self: Box<Self>, outcomes: Vec<EventOutcome>) -> Result<()>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Enqueue in its own transaction. Producers with a surrounding domain
    /// write go through their aggregate store instead so both commit
    /// together.
    async fn enqueue(&self, event: NewOutboxEvent) -> Result<()>;

    /// Lock and return up to `batch_size` unpublished events, oldest
    /// first, skipping rows locked by other instances.
    async fn lease_batch(&self, batch_size: i64) -> Result<Box<dyn OutboxLease>>;
}

// ── Broker ────────────────────────────────────────────────────

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, subject: &str, correlation_id: Uuid, payload: Bytes) -> Result<()>;
}

// ── Geo index ─────────────────────────────────────────────────

#[async_trait]
pub trait GeoIndex: Send + Sync {
    /// Idempotent on recipient id; refreshes the 24 h TTL.
    async fn update_location(&self, recipient_id: &str, point: GeoPoint) -> Result<()>;

    /// Recipients within `radius_m` of `center`, nearest first, at most
    /// `limit`. Expired entries are ignored.
    async fn query_within(
        &self,
        center: GeoPoint,
        radius_m: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>>;
}

// ── Push notifications ────────────────────────────────────────

#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn push(&self, recipient_id: &str, title: &str, body: &str) -> Result<()>;
}

// ── Distance oracle ───────────────────────────────────────────

#[async_trait]
pub trait DistanceOracle: Send + Sync {
    async fn distance_km(&self, from: GeoPoint, to: GeoPoint) -> Result<f64>;
}

// ── Couriers ──────────────────────────────────────────────────

#[async_trait]
pub trait CourierDirectory: Send + Sync {
    /// Register or refresh a courier's position; a busy courier reporting
    /// a new position returns to the idle pool.
    async fn update_location(&self, courier_id: &str, point: GeoPoint) -> Result<()>;
    async fn idle_couriers(&self) -> Result<Vec<Courier>>;
    async fn nearest_idle(&self, point: GeoPoint) -> Result<Option<Courier>>;
    /// Remove a courier from the idle pool once a batch is assigned.
    async fn mark_busy(&self, courier_id: &str) -> Result<()>;
}

// ── Dispatch store ────────────────────────────────────────────

#[async_trait]
pub trait DispatchStore: Send + Sync {
    async fn insert_order(&self, order: &DeliveryOrder) -> Result<()>;
    async fn get_order(&self, id: OrderId) -> Result<DeliveryOrder>;

    /// Orders in `pending_matching`, oldest first. Also used on startup to
    /// re-arm escalation timers.
    async fn pending_orders(&self) -> Result<Vec<DeliveryOrder>>;

    /// Persist the batch and flip its member orders to `dispatched`,
    /// all-or-nothing: returns `Ok(false)` without side effects when any
    /// member is no longer pending.
    async fn commit_batch(&self, batch: &Batch, effective_tiers: &[(OrderId, SlaTier)])
        -> Result<bool>;
}

// ── Carbon ledger store ───────────────────────────────────────

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append under the global single-writer discipline: read the current
    /// tail, seal the hash, insert. Serialization is the implementation's
    /// responsibility (advisory lock in Postgres). The store re-stamps
    /// `entry.timestamp` under that lock so chain order and timestamp
    /// order agree.
    async fn append(&self, entry: PendingEntry) -> Result<CarbonEntry>;

    async fn entries_for_period(
        &self,
        vendor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CarbonEntry>>;

    /// The full chain in global timestamp order, for verification.
    async fn chain(&self) -> Result<Vec<CarbonEntry>>;
}
