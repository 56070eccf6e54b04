//! In-memory implementations of every foodmesh port.
//!
//! Semantics mirror the Postgres adapters closely enough for contract
//! tests: the surplus store shares an outbox with the standalone outbox
//! store (one "database"), claims are CAS-checked under a single lock and
//! ledger appends are serialized.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use foodmesh_core::error::CoreError;
use foodmesh_core::geo::{haversine_km, GeoPoint};
use foodmesh_core::ledger::{seal, GENESIS_HASH};
use foodmesh_core::ports::*;
use foodmesh_core::types::*;

// ── Outbox ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredEvent {
    event: OutboxEvent,
    leased: bool,
}

#[derive(Default)]
pub struct MemOutboxStore {
    inner: Arc<Mutex<Vec<StoredEvent>>>,
}

impl MemOutboxStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn store(&self, event: NewOutboxEvent, created_at: DateTime<Utc>) {
        self.inner.lock().unwrap().push(StoredEvent {
            event: OutboxEvent {
                id: event.id,
                aggregate_id: event.aggregate_id,
                kind: event.kind,
                payload: event.payload,
                created_at,
                published: false,
                published_at: None,
                correlation_id: event.correlation_id,
            },
            leased: false,
        });
    }

    /// Backdate an event, for staleness tests.
    pub fn enqueue_at(&self, event: NewOutboxEvent, created_at: DateTime<Utc>) {
        self.store(event, created_at);
    }

    pub fn all_events(&self) -> Vec<OutboxEvent> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.event.clone())
            .collect()
    }

    pub fn published_events(&self) -> Vec<OutboxEvent> {
        self.all_events()
            .into_iter()
            .filter(|e| e.published)
            .collect()
    }

    pub fn unpublished_count(&self) -> usize {
        self.all_events().iter().filter(|e| !e.published).count()
    }
}

#[async_trait]
impl OutboxStore for MemOutboxStore {
    async fn enqueue(&self, event: NewOutboxEvent) -> Result<()> {
        self.store(event, Utc::now());
        Ok(())
    }

    async fn lease_batch(&self, batch_size: i64) -> Result<Box<dyn OutboxLease>> {
        let mut inner = self.inner.lock().unwrap();
        let mut events = Vec::new();
        let mut candidates: Vec<usize> = inner
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.event.published && !s.leased)
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| inner[i].event.created_at);
        candidates.truncate(batch_size as usize);

        let mut ids = Vec::new();
        for i in candidates {
            inner[i].leased = true;
            ids.push(inner[i].event.id);
            events.push(inner[i].event.clone());
        }
        Ok(Box::new(MemLease {
            store: Arc::clone(&self.inner),
            ids,
            events,
        }))
    }
}

struct MemLease {
    store: Arc<Mutex<Vec<StoredEvent>>>,
    ids: Vec<EventId>,
    events: Vec<OutboxEvent>,
}

#[async_trait]
impl OutboxLease for MemLease {
    fn events(&self) -> &[OutboxEvent] {
        &self.events
    }

    async fn settle(self: Box<Self>, outcomes: Vec<EventOutcome>) -> Result<()> {
        if outcomes.len() != self.ids.len() {
            return Err(CoreError::InvariantViolation(
                "outcome count does not match lease".into(),
            ));
        }
        let mut inner = self.store.lock().unwrap();
        for (id, outcome) in self.ids.iter().zip(outcomes) {
            if let Some(stored) = inner.iter_mut().find(|s| s.event.id == *id) {
                stored.leased = false;
                if matches!(outcome, EventOutcome::Published | EventOutcome::DroppedStale) {
                    stored.event.published = true;
                    stored.event.published_at = Some(Utc::now());
                }
            }
        }
        Ok(())
    }
}

// ── Surplus store ─────────────────────────────────────────────

#[derive(Default)]
struct SurplusState {
    items: HashMap<SurplusId, SurplusItem>,
    receipts: HashMap<String, ClaimReceipt>,
    deliveries: Vec<(DeliveryRecord, String)>, // record, status
}

pub struct MemSurplusStore {
    state: Mutex<SurplusState>,
    outbox: Arc<MemOutboxStore>,
}

impl MemSurplusStore {
    pub fn new(outbox: Arc<MemOutboxStore>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SurplusState::default()),
            outbox,
        })
    }

    /// Direct mutation hook for edge-case tests (e.g. backdating expiry).
    pub fn with_item<F: FnOnce(&mut SurplusItem)>(&self, id: SurplusId, f: F) {
        let mut state = self.state.lock().unwrap();
        if let Some(item) = state.items.get_mut(&id) {
            f(item);
        }
    }
}

#[async_trait]
impl SurplusStore for MemSurplusStore {
    async fn create_with_event(&self, item: &SurplusItem, event: NewOutboxEvent) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .items
            .insert(item.id, item.clone());
        self.outbox.enqueue(event).await
    }

    async fn get(&self, id: SurplusId) -> Result<SurplusItem> {
        self.state
            .lock()
            .unwrap()
            .items
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("surplus {id}")))
    }

    async fn marketplace(&self, limit: i64) -> Result<Vec<SurplusItem>> {
        let now = Utc::now();
        let mut items: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .items
            .values()
            .filter(|i| i.status == SurplusStatus::Available && i.expiry_time > now)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.expiry_time);
        items.truncate(limit as usize);
        Ok(items)
    }

    async fn try_claim(&self, write: ClaimWrite) -> Result<bool> {
        {
            let mut state = self.state.lock().unwrap();
            let now = Utc::now();
            let Some(item) = state.items.get_mut(&write.item_id) else {
                return Ok(false);
            };
            if item.status != SurplusStatus::Available
                || item.expiry_time <= now
                || item.version != write.expected_version
            {
                return Ok(false);
            }
            item.status = SurplusStatus::Claimed;
            item.claimed_by = Some(write.claimant_id.clone());
            item.version += 1;
            state
                .deliveries
                .push((write.delivery.clone(), "assigned".to_string()));
            if let Some(token) = &write.receipt_token {
                state.receipts.insert(token.clone(), write.receipt.clone());
            }
        }
        self.outbox.enqueue(write.event).await?;
        Ok(true)
    }

    async fn find_receipt(&self, token: &str) -> Result<Option<ClaimReceipt>> {
        Ok(self.state.lock().unwrap().receipts.get(token).cloned())
    }

    async fn confirm_pickup(
        &self,
        provider_id: &str,
        verification_code: &str,
        correlation_id: Uuid,
    ) -> Result<Option<SurplusId>> {
        let event = {
            let mut state = self.state.lock().unwrap();
            let Some(pos) = state.deliveries.iter().position(|(d, status)| {
                status == "assigned" && d.verification_code.as_deref() == Some(verification_code)
            }) else {
                return Ok(None);
            };
            let item_id = state.deliveries[pos].0.item_id;
            let Some(item) = state.items.get(&item_id) else {
                return Ok(None);
            };
            if item.provider_id != provider_id {
                return Ok(None);
            }
            let payload = DeliveryCompletedPayload {
                vendor_id: provider_id.to_string(),
                order_id: item_id.0,
                category: item.category,
                weight_kg: item.quantity_kg,
            };
            state.deliveries[pos].1 = "delivered".to_string();
            let item = state.items.get_mut(&item_id).unwrap();
            item.status = SurplusStatus::Delivered;
            item.version += 1;
            NewOutboxEvent::new(
                item_id.0,
                EventKind::DeliveryCompleted,
                serde_json::to_value(&payload).map_err(|e| anyhow::anyhow!(e))?,
                correlation_id,
            )
        };
        let aggregate = SurplusId(event.aggregate_id);
        self.outbox.enqueue(event).await?;
        Ok(Some(aggregate))
    }

    async fn cancel_claim(&self, id: SurplusId, claimant_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(item) = state.items.get_mut(&id) else {
            return Ok(false);
        };
        if item.status != SurplusStatus::Claimed || item.claimed_by.as_deref() != Some(claimant_id)
        {
            return Ok(false);
        }
        item.status = SurplusStatus::Cancelled;
        item.claimed_by = None;
        item.version += 1;
        Ok(true)
    }

    async fn expire_due(&self, correlation_id: Uuid) -> Result<Vec<SurplusId>> {
        let mut events = Vec::new();
        let mut expired = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let now = Utc::now();
            let due: Vec<SurplusId> = state
                .items
                .values()
                .filter(|i| i.status == SurplusStatus::Available && i.expiry_time <= now)
                .map(|i| i.id)
                .collect();
            for id in due {
                let item = state.items.get_mut(&id).unwrap();
                item.status = SurplusStatus::Expired;
                item.version += 1;
                expired.push(id);
                events.push(NewOutboxEvent::new(
                    id.0,
                    EventKind::SurplusExpired,
                    serde_json::json!({ "surplus_id": id }),
                    correlation_id,
                ));
            }
        }
        for event in events {
            self.outbox.enqueue(event).await?;
        }
        Ok(expired)
    }
}

// ── Dispatch store ────────────────────────────────────────────

#[derive(Default)]
struct DispatchState {
    orders: HashMap<OrderId, DeliveryOrder>,
    batches: Vec<Batch>,
}

#[derive(Default)]
pub struct MemDispatchStore {
    state: Mutex<DispatchState>,
}

impl MemDispatchStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.state.lock().unwrap().batches.clone()
    }
}

#[async_trait]
impl DispatchStore for MemDispatchStore {
    async fn insert_order(&self, order: &DeliveryOrder) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .orders
            .insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> Result<DeliveryOrder> {
        self.state
            .lock()
            .unwrap()
            .orders
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("delivery order {id}")))
    }

    async fn pending_orders(&self) -> Result<Vec<DeliveryOrder>> {
        let mut orders: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::PendingMatching)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn commit_batch(
        &self,
        batch: &Batch,
        effective_tiers: &[(OrderId, SlaTier)],
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let all_pending = batch.order_ids.iter().all(|id| {
            state
                .orders
                .get(id)
                .map(|o| o.status == OrderStatus::PendingMatching)
                .unwrap_or(false)
        });
        if !all_pending {
            return Ok(false);
        }
        for id in &batch.order_ids {
            let order = state.orders.get_mut(id).unwrap();
            order.status = OrderStatus::Dispatched;
            order.batch_id = Some(batch.id);
            if let Some((_, tier)) = effective_tiers.iter().find(|(oid, _)| oid == id) {
                order.effective_tier = *tier;
            }
        }
        state.batches.push(batch.clone());
        Ok(true)
    }
}

// ── Ledger store ──────────────────────────────────────────────

#[derive(Default)]
pub struct MemLedgerStore {
    entries: Mutex<Vec<CarbonEntry>>,
}

impl MemLedgerStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Out-of-band mutation, for tamper-detection tests.
    pub fn tamper_weight(&self, position: usize, new_weight: f64) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(position) {
            entry.weight_kg = new_weight;
        }
    }
}

#[async_trait]
impl LedgerStore for MemLedgerStore {
    async fn append(&self, mut entry: PendingEntry) -> Result<CarbonEntry> {
        let mut entries = self.entries.lock().unwrap();
        entry.timestamp = Utc::now();
        let previous = entries
            .last()
            .map(|e| e.own_hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let sealed = seal(entry, &previous);
        entries.push(sealed.clone());
        Ok(sealed)
    }

    async fn entries_for_period(
        &self,
        vendor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CarbonEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.vendor_id == vendor_id && e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect())
    }

    async fn chain(&self) -> Result<Vec<CarbonEntry>> {
        Ok(self.entries.lock().unwrap().clone())
    }
}

// ── Couriers ──────────────────────────────────────────────────

#[derive(Default)]
struct CourierState {
    couriers: Vec<Courier>,
    busy: HashSet<String>,
}

#[derive(Default)]
pub struct MemCourierDirectory {
    state: Mutex<CourierState>,
}

impl MemCourierDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_courier(&self, id: &str, location: GeoPoint) {
        self.state.lock().unwrap().couriers.push(Courier {
            id: id.to_string(),
            location,
        });
    }
}

#[async_trait]
impl CourierDirectory for MemCourierDirectory {
    async fn update_location(&self, courier_id: &str, point: GeoPoint) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.busy.remove(courier_id);
        if let Some(existing) = state.couriers.iter_mut().find(|c| c.id == courier_id) {
            existing.location = point;
        } else {
            state.couriers.push(Courier {
                id: courier_id.to_string(),
                location: point,
            });
        }
        Ok(())
    }

    async fn idle_couriers(&self) -> Result<Vec<Courier>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .couriers
            .iter()
            .filter(|c| !state.busy.contains(&c.id))
            .cloned()
            .collect())
    }

    async fn nearest_idle(&self, point: GeoPoint) -> Result<Option<Courier>> {
        let idle = self.idle_couriers().await?;
        Ok(idle.into_iter().min_by(|a, b| {
            haversine_km(a.location, point)
                .partial_cmp(&haversine_km(b.location, point))
                .unwrap_or(std::cmp::Ordering::Equal)
        }))
    }

    async fn mark_busy(&self, courier_id: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .busy
            .insert(courier_id.to_string());
        Ok(())
    }
}

// ── Push gateway ──────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingPush {
    pub delivered: Mutex<Vec<(String, String, String)>>,
    pub fail_ids: Mutex<HashSet<String>>,
}

impl RecordingPush {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_for(&self, recipient_id: &str) {
        self.fail_ids
            .lock()
            .unwrap()
            .insert(recipient_id.to_string());
    }
}

#[async_trait]
impl PushGateway for RecordingPush {
    async fn push(&self, recipient_id: &str, title: &str, body: &str) -> Result<()> {
        if self.fail_ids.lock().unwrap().contains(recipient_id) {
            return Err(CoreError::UpstreamUnavailable("device unreachable".into()));
        }
        self.delivered.lock().unwrap().push((
            recipient_id.to_string(),
            title.to_string(),
            body.to_string(),
        ));
        Ok(())
    }
}

// ── Event sink ────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    pub published: Mutex<Vec<(String, Uuid, Bytes)>>,
    pub fail: std::sync::atomic::AtomicBool,
    /// Publish calls received, successful or not.
    pub attempts: std::sync::atomic::AtomicUsize,
    delay: Mutex<std::time::Duration>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    /// Simulate a slow or hung broker.
    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn subjects(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(s, _, _)| s.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, subject: &str, correlation_id: Uuid, payload: Bytes) -> Result<()> {
        self.attempts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CoreError::UpstreamUnavailable("broker down".into()));
        }
        self.published
            .lock()
            .unwrap()
            .push((subject.to_string(), correlation_id, payload));
        Ok(())
    }
}

// ── Distance oracle ───────────────────────────────────────────

pub struct HaversineOracle;

#[async_trait]
impl DistanceOracle for HaversineOracle {
    async fn distance_km(&self, from: GeoPoint, to: GeoPoint) -> Result<f64> {
        Ok(haversine_km(from, to))
    }
}
