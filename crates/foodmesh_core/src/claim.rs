//! Claim coordinator: posting, the single-winner claim transition and
//! pickup confirmation.
//!
//! A claim is a conditional update — the store evaluates
//! `status = 'available' AND expiry_time > now() AND version = $n` with the
//! database clock and reports rows affected. Zero rows means the claim lost
//! the race. Optimistic CAS keeps row locks from spanning the external
//! calls (distance oracle, notifications) on the claim path.

use std::sync::Arc;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

use crate::error::CoreError;
use crate::geo::{CellId, DISPATCH_CELL_LEVEL};
use crate::ports::{ClaimWrite, DistanceOracle, Result, SurplusStore};
use crate::types::*;

#[derive(Debug, Clone)]
pub struct ClaimConfig {
    /// Self-pickup is only allowed within this radius of the provider.
    pub self_pickup_max_km: f64,
    /// Requested tier used when a courier claim names none.
    pub default_sla: SlaTier,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            self_pickup_max_km: 5.0,
            default_sla: SlaTier::Standard,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub item_id: SurplusId,
    pub claimant_id: String,
    pub fulfillment: FulfillmentSpec,
    pub idempotency_token: Option<String>,
}

pub struct ClaimService {
    store: Arc<dyn SurplusStore>,
    distance: Arc<dyn DistanceOracle>,
    cfg: ClaimConfig,
}

impl ClaimService {
    pub fn new(
        store: Arc<dyn SurplusStore>,
        distance: Arc<dyn DistanceOracle>,
        cfg: ClaimConfig,
    ) -> Self {
        Self {
            store,
            distance,
            cfg,
        }
    }

    /// Create a surplus item and its `surplus.posted` event atomically.
    pub async fn post(&self, draft: SurplusDraft, correlation_id: Uuid) -> Result<SurplusItem> {
        if draft.quantity_kg <= 0.0 {
            return Err(CoreError::Validation("quantity_kg must be positive".into()));
        }
        if !draft.location.is_valid() {
            return Err(CoreError::Validation("coordinates out of range".into()));
        }
        let now = Utc::now();
        if draft.expiry_time <= now {
            return Err(CoreError::Validation(
                "expiry_time must be in the future".into(),
            ));
        }

        let item = SurplusItem {
            id: SurplusId::new(),
            provider_id: draft.provider_id,
            location: draft.location,
            cell_id: CellId::from_point(draft.location, DISPATCH_CELL_LEVEL),
            quantity_kg: draft.quantity_kg,
            category: draft.category,
            posted_at: now,
            expiry_time: draft.expiry_time,
            status: SurplusStatus::Available,
            claimed_by: None,
            version: 0,
        };

        let payload = SurplusPostedPayload {
            surplus_id: item.id,
            provider_id: item.provider_id.clone(),
            lat: item.location.lat,
            lon: item.location.lon,
            quantity_kg: item.quantity_kg,
            category: item.category,
            expiry_time: item.expiry_time,
        };
        let event = NewOutboxEvent::new(
            item.id.0,
            EventKind::SurplusPosted,
            serde_json::to_value(&payload).map_err(|e| anyhow::anyhow!(e))?,
            correlation_id,
        );

        self.store.create_with_event(&item, event).await?;
        tracing::info!(surplus_id = %item.id, provider = item.provider_id, "surplus posted");
        Ok(item)
    }

    /// Attempt the available→claimed transition. Exactly one concurrent
    /// claimer wins; the rest observe `Conflict`. A repeated idempotency
    /// token replays the recorded outcome without re-executing.
    pub async fn claim(&self, req: ClaimRequest, correlation_id: Uuid) -> Result<ClaimReceipt> {
        if let Some(token) = &req.idempotency_token {
            if let Some(prior) = self.store.find_receipt(token).await? {
                if prior.claimant_id == req.claimant_id {
                    tracing::debug!(token, "claim replayed from idempotency receipt");
                    return Ok(prior);
                }
                return Err(CoreError::Conflict(
                    "idempotency token used by another claimant".into(),
                ));
            }
        }

        let item = self.store.get(req.item_id).await?;
        let receipt = self.build_receipt(&req, &item).await?;
        let sla_tier = match req.fulfillment.sla_tier {
            Some(SlaTier::Critical) => {
                return Err(CoreError::Validation(
                    "CRITICAL is assigned by the system, not requested".into(),
                ))
            }
            Some(tier) => tier,
            None => self.cfg.default_sla,
        };

        let payload = SurplusClaimedPayload {
            surplus_id: item.id,
            claimant_id: req.claimant_id.clone(),
            method: req.fulfillment.method,
            pickup: item.location,
            dropoff: req.fulfillment.recipient_location,
            quantity_kg: item.quantity_kg,
            category: item.category,
            expiry_time: item.expiry_time,
            sla_tier,
        };
        let event = NewOutboxEvent::new(
            item.id.0,
            EventKind::SurplusClaimed,
            serde_json::to_value(&payload).map_err(|e| anyhow::anyhow!(e))?,
            correlation_id,
        );

        let write = ClaimWrite {
            item_id: item.id,
            claimant_id: req.claimant_id.clone(),
            expected_version: item.version,
            event,
            delivery: DeliveryRecord {
                id: Uuid::new_v4(),
                item_id: item.id,
                method: req.fulfillment.method,
                verification_code: receipt.verification_code.clone(),
            },
            receipt_token: req.idempotency_token.clone(),
            receipt: receipt.clone(),
        };

        if !self.store.try_claim(write).await? {
            return Err(CoreError::Conflict(
                "surplus already claimed or expired".into(),
            ));
        }
        tracing::info!(surplus_id = %item.id, claimant = req.claimant_id, "surplus claimed");
        Ok(receipt)
    }

    async fn build_receipt(&self, req: &ClaimRequest, item: &SurplusItem) -> Result<ClaimReceipt> {
        match req.fulfillment.method {
            FulfillmentMethod::SelfPickup => {
                let dist_km = self
                    .distance
                    .distance_km(req.fulfillment.recipient_location, item.location)
                    .await?;
                if dist_km > self.cfg.self_pickup_max_km {
                    return Err(CoreError::Unprocessable(format!(
                        "distance too far for self-pickup: {dist_km:.2} km"
                    )));
                }
                Ok(ClaimReceipt {
                    item_id: item.id,
                    claimant_id: req.claimant_id.clone(),
                    method: FulfillmentMethod::SelfPickup,
                    tracking_id: None,
                    verification_code: Some(pickup_code()),
                    distance_to_provider_m: Some(dist_km * 1000.0),
                    claimed_at: Utc::now(),
                })
            }
            FulfillmentMethod::Courier => Ok(ClaimReceipt {
                item_id: item.id,
                claimant_id: req.claimant_id.clone(),
                method: FulfillmentMethod::Courier,
                tracking_id: Some(tracking_id()),
                verification_code: None,
                distance_to_provider_m: None,
                claimed_at: Utc::now(),
            }),
        }
    }

    pub async fn get(&self, id: SurplusId) -> Result<SurplusItem> {
        self.store.get(id).await
    }

    /// Available items ordered by expiry ascending.
    pub async fn marketplace(&self, limit: i64) -> Result<Vec<SurplusItem>> {
        self.store.marketplace(limit).await
    }

    /// Provider confirms a pickup by verification code.
    pub async fn confirm_pickup(
        &self,
        provider_id: &str,
        code: &str,
        correlation_id: Uuid,
    ) -> Result<SurplusId> {
        match self
            .store
            .confirm_pickup(provider_id, code, correlation_id)
            .await?
        {
            Some(id) => {
                tracing::info!(surplus_id = %id, provider = provider_id, "pickup verified");
                Ok(id)
            }
            None => Err(CoreError::NotFound(
                "no open delivery matches that verification code".into(),
            )),
        }
    }

    /// Dispute or timeout path: release a claim into the terminal
    /// cancelled state.
    pub async fn cancel(&self, id: SurplusId, claimant_id: &str) -> Result<()> {
        // Distinguish "no such item" from "not yours to cancel".
        let _ = self.store.get(id).await?;
        if !self.store.cancel_claim(id, claimant_id).await? {
            return Err(CoreError::Conflict(
                "surplus is not claimed by this claimant".into(),
            ));
        }
        tracing::info!(surplus_id = %id, claimant = claimant_id, "claim cancelled");
        Ok(())
    }

    /// Flip due items to expired, emitting `surplus.expired` per item.
    pub async fn expire_due(&self, correlation_id: Uuid) -> Result<Vec<SurplusId>> {
        let expired = self.store.expire_due(correlation_id).await?;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "surplus items expired");
        }
        Ok(expired)
    }
}

fn pickup_code() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| (c as char).to_ascii_uppercase())
        .collect();
    format!("PICK-{suffix}")
}

fn tracking_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!("TRK-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{haversine_km, GeoPoint};
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Mutex-serialized store with CAS semantics matching the SQL predicate.
    #[derive(Default)]
    struct MemStore {
        inner: Mutex<MemState>,
    }

    #[derive(Default)]
    struct MemState {
        items: HashMap<SurplusId, SurplusItem>,
        events: Vec<NewOutboxEvent>,
        receipts: HashMap<String, ClaimReceipt>,
        deliveries: Vec<DeliveryRecord>,
    }

    #[async_trait]
    impl SurplusStore for MemStore {
        async fn create_with_event(
            &self,
            item: &SurplusItem,
            event: NewOutboxEvent,
        ) -> Result<()> {
            let mut state = self.inner.lock().unwrap();
            state.items.insert(item.id, item.clone());
            state.events.push(event);
            Ok(())
        }

        async fn get(&self, id: SurplusId) -> Result<SurplusItem> {
            self.inner
                .lock()
                .unwrap()
                .items
                .get(&id)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(format!("surplus {id}")))
        }

        async fn marketplace(&self, limit: i64) -> Result<Vec<SurplusItem>> {
            let state = self.inner.lock().unwrap();
            let mut items: Vec<_> = state
                .items
                .values()
                .filter(|i| i.status == SurplusStatus::Available)
                .cloned()
                .collect();
            items.sort_by_key(|i| i.expiry_time);
            items.truncate(limit as usize);
            Ok(items)
        }

        async fn try_claim(&self, write: ClaimWrite) -> Result<bool> {
            let mut state = self.inner.lock().unwrap();
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
            state.events.push(write.event);
            state.deliveries.push(write.delivery);
            if let Some(token) = write.receipt_token {
                state.receipts.insert(token, write.receipt);
            }
            Ok(true)
        }

        async fn find_receipt(&self, token: &str) -> Result<Option<ClaimReceipt>> {
            Ok(self.inner.lock().unwrap().receipts.get(token).cloned())
        }

        async fn confirm_pickup(
            &self,
            _provider_id: &str,
            code: &str,
            _correlation_id: Uuid,
        ) -> Result<Option<SurplusId>> {
            let state = self.inner.lock().unwrap();
            Ok(state
                .deliveries
                .iter()
                .find(|d| d.verification_code.as_deref() == Some(code))
                .map(|d| d.item_id))
        }

        async fn cancel_claim(&self, id: SurplusId, claimant_id: &str) -> Result<bool> {
            let mut state = self.inner.lock().unwrap();
            let Some(item) = state.items.get_mut(&id) else {
                return Ok(false);
            };
            if item.status != SurplusStatus::Claimed
                || item.claimed_by.as_deref() != Some(claimant_id)
            {
                return Ok(false);
            }
            item.status = SurplusStatus::Cancelled;
            item.claimed_by = None;
            item.version += 1;
            Ok(true)
        }

        async fn expire_due(&self, correlation_id: Uuid) -> Result<Vec<SurplusId>> {
            let mut state = self.inner.lock().unwrap();
            let now = Utc::now();
            let mut expired = Vec::new();
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
                let event = NewOutboxEvent::new(
                    id.0,
                    EventKind::SurplusExpired,
                    serde_json::json!({ "surplus_id": id }),
                    correlation_id,
                );
                state.events.push(event);
            }
            Ok(expired)
        }
    }

    struct HaversineOracle;

    #[async_trait]
    impl DistanceOracle for HaversineOracle {
        async fn distance_km(&self, from: GeoPoint, to: GeoPoint) -> Result<f64> {
            Ok(haversine_km(from, to))
        }
    }

    fn service(store: Arc<MemStore>) -> ClaimService {
        ClaimService::new(store, Arc::new(HaversineOracle), ClaimConfig::default())
    }

    fn draft(expiry_minutes: i64) -> SurplusDraft {
        SurplusDraft {
            provider_id: "P1".into(),
            location: GeoPoint::new(-6.2, 106.8),
            quantity_kg: 5.0,
            category: FoodCategory::Bread,
            expiry_time: Utc::now() + Duration::minutes(expiry_minutes),
        }
    }

    fn claim_req(item_id: SurplusId, claimant: &str) -> ClaimRequest {
        ClaimRequest {
            item_id,
            claimant_id: claimant.into(),
            fulfillment: FulfillmentSpec {
                method: FulfillmentMethod::Courier,
                recipient_location: GeoPoint::new(-6.21, 106.81),
                sla_tier: None,
            },
            idempotency_token: None,
        }
    }

    #[tokio::test]
    async fn post_emits_posted_event() {
        let store = Arc::new(MemStore::default());
        let svc = service(store.clone());
        let item = svc.post(draft(120), Uuid::new_v4()).await.unwrap();
        assert_eq!(item.status, SurplusStatus::Available);
        assert_eq!(item.version, 0);

        let state = store.inner.lock().unwrap();
        assert_eq!(state.events.len(), 1);
        assert_eq!(state.events[0].kind, EventKind::SurplusPosted);
        assert_eq!(state.events[0].aggregate_id, item.id.0);
    }

    #[tokio::test]
    async fn post_rejects_past_expiry() {
        let svc = service(Arc::new(MemStore::default()));
        let err = svc.post(draft(-1), Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn exactly_one_of_many_concurrent_claims_wins() {
        let store = Arc::new(MemStore::default());
        let svc = Arc::new(service(store.clone()));
        let item = svc.post(draft(120), Uuid::new_v4()).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..100 {
            let svc = Arc::clone(&svc);
            let req = claim_req(item.id, &format!("ngo-{i}"));
            tasks.spawn(async move { svc.claim(req, Uuid::new_v4()).await });
        }

        let mut wins = 0;
        let mut conflicts = 0;
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                Ok(_) => wins += 1,
                Err(CoreError::Conflict(_)) => conflicts += 1,
                Err(other) => panic!("unexpected outcome: {other}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 99);

        let state = store.inner.lock().unwrap();
        let claimed_events = state
            .events
            .iter()
            .filter(|e| e.kind == EventKind::SurplusClaimed)
            .count();
        assert_eq!(claimed_events, 1);
    }

    #[tokio::test]
    async fn claim_on_expired_item_conflicts() {
        let store = Arc::new(MemStore::default());
        let svc = service(store.clone());
        let item = svc.post(draft(120), Uuid::new_v4()).await.unwrap();
        store
            .inner
            .lock()
            .unwrap()
            .items
            .get_mut(&item.id)
            .unwrap()
            .expiry_time = Utc::now() - Duration::milliseconds(1);

        let err = svc
            .claim(claim_req(item.id, "N1"), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn same_token_replays_prior_outcome() {
        let store = Arc::new(MemStore::default());
        let svc = service(store.clone());
        let item = svc.post(draft(120), Uuid::new_v4()).await.unwrap();

        let mut req = claim_req(item.id, "N1");
        req.idempotency_token = Some("tok-1".into());
        let first = svc.claim(req.clone(), Uuid::new_v4()).await.unwrap();
        let replay = svc.claim(req, Uuid::new_v4()).await.unwrap();
        assert_eq!(first.tracking_id, replay.tracking_id);
        assert_eq!(first.claimed_at, replay.claimed_at);

        let state = store.inner.lock().unwrap();
        let claimed_events = state
            .events
            .iter()
            .filter(|e| e.kind == EventKind::SurplusClaimed)
            .count();
        assert_eq!(claimed_events, 1, "replay must not re-execute");
    }

    #[tokio::test]
    async fn self_pickup_beyond_five_km_is_unprocessable() {
        let store = Arc::new(MemStore::default());
        let svc = service(store.clone());
        let item = svc.post(draft(120), Uuid::new_v4()).await.unwrap();

        let req = ClaimRequest {
            item_id: item.id,
            claimant_id: "N1".into(),
            fulfillment: FulfillmentSpec {
                method: FulfillmentMethod::SelfPickup,
                // Roughly 15 km away.
                recipient_location: GeoPoint::new(-6.33, 106.85),
                sla_tier: None,
            },
            idempotency_token: None,
        };
        let err = svc.claim(req, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CoreError::Unprocessable(_)));

        // The item must not be marked claimed.
        let fresh = svc.get(item.id).await.unwrap();
        assert_eq!(fresh.status, SurplusStatus::Available);
    }

    #[tokio::test]
    async fn self_pickup_within_radius_gets_verification_code() {
        let store = Arc::new(MemStore::default());
        let svc = service(store.clone());
        let item = svc.post(draft(120), Uuid::new_v4()).await.unwrap();

        let req = ClaimRequest {
            item_id: item.id,
            claimant_id: "N1".into(),
            fulfillment: FulfillmentSpec {
                method: FulfillmentMethod::SelfPickup,
                recipient_location: GeoPoint::new(-6.205, 106.805),
                sla_tier: None,
            },
            idempotency_token: None,
        };
        let receipt = svc.claim(req, Uuid::new_v4()).await.unwrap();
        let code = receipt.verification_code.expect("self-pickup code");
        assert!(code.starts_with("PICK-"));

        // The provider can confirm with that code.
        let confirmed = svc
            .confirm_pickup("P1", &code, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(confirmed, item.id);
    }

    #[tokio::test]
    async fn requested_critical_tier_is_rejected() {
        let store = Arc::new(MemStore::default());
        let svc = service(store.clone());
        let item = svc.post(draft(120), Uuid::new_v4()).await.unwrap();

        let mut req = claim_req(item.id, "N1");
        req.fulfillment.sla_tier = Some(SlaTier::Critical);
        let err = svc.claim(req, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn cancel_releases_claim_into_terminal_state() {
        let store = Arc::new(MemStore::default());
        let svc = service(store.clone());
        let item = svc.post(draft(120), Uuid::new_v4()).await.unwrap();
        svc.claim(claim_req(item.id, "N1"), Uuid::new_v4())
            .await
            .unwrap();

        // Only the claimant may cancel.
        let err = svc.cancel(item.id, "N2").await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        svc.cancel(item.id, "N1").await.unwrap();
        let fresh = svc.get(item.id).await.unwrap();
        assert_eq!(fresh.status, SurplusStatus::Cancelled);
        assert_eq!(fresh.claimed_by, None);
        assert!(fresh.status.is_terminal());

        // Cancelled is terminal: no re-claim.
        let err = svc
            .claim(claim_req(item.id, "N3"), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn post_then_expire_emits_posted_then_expired() {
        let store = Arc::new(MemStore::default());
        let svc = service(store.clone());
        let item = svc.post(draft(120), Uuid::new_v4()).await.unwrap();
        store
            .inner
            .lock()
            .unwrap()
            .items
            .get_mut(&item.id)
            .unwrap()
            .expiry_time = Utc::now() - Duration::seconds(1);

        let expired = svc.expire_due(Uuid::new_v4()).await.unwrap();
        assert_eq!(expired, vec![item.id]);

        let state = store.inner.lock().unwrap();
        let kinds: Vec<EventKind> = state.events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::SurplusPosted, EventKind::SurplusExpired]);
    }

    #[tokio::test]
    async fn marketplace_orders_by_expiry_ascending() {
        let store = Arc::new(MemStore::default());
        let svc = service(store.clone());
        let late = svc.post(draft(240), Uuid::new_v4()).await.unwrap();
        let soon = svc.post(draft(30), Uuid::new_v4()).await.unwrap();

        let items = svc.marketplace(20).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, soon.id);
        assert_eq!(items[1].id, late.id);
    }
}
