//! Dispatch & batching engine: SLA classification, cell clustering,
//! score-ranked assignment and the no-order-may-starve escalation path.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::error::CoreError;
use crate::geo::{centroid, haversine_km, CellId, GeoPoint};
use crate::ports::{CourierDirectory, DispatchStore, Result};
use crate::types::{
    Batch, BatchId, DeliveryOrder, OrderId, OrderStatus, SlaTier, SurplusId, Waypoint, WaypointKind,
};

/// Score weights: urgency and expiry pressure outrank proximity so food at
/// risk of waste beats convenient-but-lax pickups.
const WEIGHT_DISTANCE: f64 = 0.3;
const WEIGHT_URGENCY: f64 = 0.4;
const WEIGHT_PRESSURE: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Orders expiring within this window are escalated to CRITICAL.
    pub critical_window: Duration,
    /// A STANDARD/HEMAT order still pending this long after creation is
    /// force-dispatched.
    pub escalation_after: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            critical_window: Duration::minutes(15),
            escalation_after: Duration::minutes(5),
        }
    }
}

/// Input to `DispatchEngine::create_order`.
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub item_id: SurplusId,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub expiry_time: DateTime<Utc>,
    pub requested_tier: SlaTier,
    pub quantity_kg: f64,
}

/// A candidate batch produced by one planning pass: member orders with
/// their recomputed effective tiers, plus the ranking score.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub orders: Vec<DeliveryOrder>,
    pub effective_tiers: Vec<(OrderId, SlaTier)>,
    pub score: f64,
    earliest_created: DateTime<Utc>,
}

/// Pure planning logic — no stores, fully unit-testable.
#[derive(Debug, Clone)]
pub struct DispatchPlanner {
    cfg: DispatchConfig,
}

impl DispatchPlanner {
    pub fn new(cfg: DispatchConfig) -> Self {
        Self { cfg }
    }

    pub fn effective_tier(&self, order: &DeliveryOrder, now: DateTime<Utc>) -> SlaTier {
        order.effective_tier_at(now, self.cfg.critical_window)
    }

    /// Group pending orders into candidate batches and rank them.
    ///
    /// CRITICAL and EXPRESS orders become size-1 batches. STANDARD and
    /// HEMAT orders cluster by the pickup's dispatch cell, same tier, up
    /// to the tier's cap; a full batch opens a successor in the same cell
    /// so overflow is never silently left behind.
    pub fn plan_cycle(
        &self,
        pending: &[DeliveryOrder],
        vantage: GeoPoint,
        now: DateTime<Utc>,
    ) -> Vec<BatchPlan> {
        let mut singles: Vec<(DeliveryOrder, SlaTier)> = Vec::new();
        let mut clusters: HashMap<(CellId, SlaTier), Vec<Vec<DeliveryOrder>>> = HashMap::new();

        for order in pending {
            let tier = self.effective_tier(order, now);
            match tier {
                SlaTier::Express | SlaTier::Critical => singles.push((order.clone(), tier)),
                SlaTier::Standard | SlaTier::Hemat => {
                    let key = (order.dispatch_cell(), tier);
                    let batches = clusters.entry(key).or_default();
                    match batches.last_mut() {
                        Some(open) if open.len() < tier.batch_cap() => open.push(order.clone()),
                        _ => batches.push(vec![order.clone()]),
                    }
                }
            }
        }

        let mut plans: Vec<BatchPlan> = Vec::new();
        for (order, tier) in singles {
            plans.push(self.make_plan(vec![order], vec![tier], vantage, now));
        }
        for ((_, tier), batches) in clusters {
            for orders in batches {
                let tiers = vec![tier; orders.len()];
                plans.push(self.make_plan(orders, tiers, vantage, now));
            }
        }

        // Highest score first; ties broken by the earliest-created order.
        plans.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.earliest_created.cmp(&b.earliest_created))
        });
        plans
    }

    fn make_plan(
        &self,
        orders: Vec<DeliveryOrder>,
        tiers: Vec<SlaTier>,
        vantage: GeoPoint,
        now: DateTime<Utc>,
    ) -> BatchPlan {
        let score = self.score(&orders, &tiers, vantage, now);
        let earliest_created = orders
            .iter()
            .map(|o| o.created_at)
            .min()
            .unwrap_or(now);
        let effective_tiers = orders
            .iter()
            .zip(tiers)
            .map(|(o, t)| (o.id, t))
            .collect();
        BatchPlan {
            orders,
            effective_tiers,
            score,
            earliest_created,
        }
    }

    /// score = 0.3·distance + 0.4·urgency + 0.3·pressure, where distance
    /// rewards proximity of the courier to the pickup centroid, urgency is
    /// the max tier urgency and pressure is max over orders of
    /// 1000/(minutes_to_expiry + 1).
    pub fn score(
        &self,
        orders: &[DeliveryOrder],
        tiers: &[SlaTier],
        vantage: GeoPoint,
        now: DateTime<Utc>,
    ) -> f64 {
        let pickups: Vec<GeoPoint> = orders.iter().map(|o| o.pickup).collect();
        let dist_km = haversine_km(vantage, centroid(&pickups));
        let distance_score = 100.0 / (dist_km + 0.1);

        let urgency = tiers.iter().map(|t| t.urgency()).fold(0.0, f64::max);

        let pressure = orders
            .iter()
            .map(|o| {
                let minutes_left = (o.expiry_time - now).num_seconds() as f64 / 60.0;
                1000.0 / (minutes_left.max(0.0) + 1.0)
            })
            .fold(0.0, f64::max);

        WEIGHT_DISTANCE * distance_score + WEIGHT_URGENCY * urgency + WEIGHT_PRESSURE * pressure
    }

    /// Route for a batch: all pickups greedy nearest-first from the
    /// courier, then all dropoffs greedy nearest-first from the last
    /// pickup. Every pickup precedes its dropoff by construction.
    pub fn route(&self, orders: &[DeliveryOrder], courier_loc: GeoPoint) -> Vec<Waypoint> {
        let mut route = Vec::with_capacity(orders.len() * 2);

        let mut remaining: Vec<&DeliveryOrder> = orders.iter().collect();
        let mut at = courier_loc;
        while !remaining.is_empty() {
            let (idx, _) = remaining
                .iter()
                .enumerate()
                .map(|(i, o)| (i, haversine_km(at, o.pickup)))
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .expect("remaining is non-empty");
            let order = remaining.swap_remove(idx);
            at = order.pickup;
            route.push(Waypoint {
                order_id: order.id,
                kind: WaypointKind::Pickup,
                point: order.pickup,
            });
        }

        let mut remaining: Vec<&DeliveryOrder> = orders.iter().collect();
        while !remaining.is_empty() {
            let (idx, _) = remaining
                .iter()
                .enumerate()
                .map(|(i, o)| (i, haversine_km(at, o.dropoff)))
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .expect("remaining is non-empty");
            let order = remaining.swap_remove(idx);
            at = order.dropoff;
            route.push(Waypoint {
                order_id: order.id,
                kind: WaypointKind::Dropoff,
                point: order.dropoff,
            });
        }

        route
    }

    /// When the anti-starvation timer for an order fires.
    pub fn escalation_deadline(&self, order: &DeliveryOrder) -> DateTime<Utc> {
        order.created_at + self.cfg.escalation_after
    }
}

// ── Engine ────────────────────────────────────────────────────

/// Orchestrates the planner over the dispatch store and courier directory.
/// Driven by the server's 30 s ticker and per-order escalation timers.
pub struct DispatchEngine {
    store: Arc<dyn DispatchStore>,
    couriers: Arc<dyn CourierDirectory>,
    planner: DispatchPlanner,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        couriers: Arc<dyn CourierDirectory>,
        cfg: DispatchConfig,
    ) -> Self {
        Self {
            store,
            couriers,
            planner: DispatchPlanner::new(cfg),
        }
    }

    pub fn planner(&self) -> &DispatchPlanner {
        &self.planner
    }

    pub async fn create_order(&self, draft: OrderDraft) -> Result<DeliveryOrder> {
        if draft.quantity_kg <= 0.0 {
            return Err(CoreError::Validation("quantity_kg must be positive".into()));
        }
        let now = Utc::now();
        if draft.expiry_time <= now {
            return Err(CoreError::Validation("expiry_time must be in the future".into()));
        }
        if !draft.pickup.is_valid() || !draft.dropoff.is_valid() {
            return Err(CoreError::Validation("coordinates out of range".into()));
        }

        let mut order = DeliveryOrder {
            id: OrderId::new(),
            item_id: draft.item_id,
            pickup: draft.pickup,
            dropoff: draft.dropoff,
            expiry_time: draft.expiry_time,
            requested_tier: draft.requested_tier,
            effective_tier: draft.requested_tier,
            quantity_kg: draft.quantity_kg,
            status: OrderStatus::PendingMatching,
            batch_id: None,
            created_at: now,
        };
        order.effective_tier = self.planner.effective_tier(&order, now);
        self.store.insert_order(&order).await?;
        tracing::info!(
            order_id = %order.id,
            tier = order.effective_tier.as_str(),
            "delivery order created"
        );
        Ok(order)
    }

    pub async fn get_order(&self, id: OrderId) -> Result<DeliveryOrder> {
        self.store.get_order(id).await
    }

    pub async fn pending_orders(&self) -> Result<Vec<DeliveryOrder>> {
        self.store.pending_orders().await
    }

    /// One batching pass: plan, assign couriers in descending score order,
    /// commit. Returns the number of batches dispatched.
    pub async fn run_batch_cycle(&self) -> Result<usize> {
        let pending = self.store.pending_orders().await?;
        if pending.is_empty() {
            return Ok(0);
        }
        let mut idle = self.couriers.idle_couriers().await?;
        if idle.is_empty() {
            tracing::warn!(pending = pending.len(), "no idle couriers for batch cycle");
            return Ok(0);
        }

        let now = Utc::now();
        let vantage = idle[0].location;
        let plans = self.planner.plan_cycle(&pending, vantage, now);

        let mut dispatched = 0usize;
        for plan in plans {
            if idle.is_empty() {
                break;
            }
            let pickups: Vec<GeoPoint> = plan.orders.iter().map(|o| o.pickup).collect();
            let target = centroid(&pickups);
            let (idx, _) = idle
                .iter()
                .enumerate()
                .map(|(i, c)| (i, haversine_km(c.location, target)))
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .expect("idle is non-empty");
            let courier = idle[idx].clone();

            let batch = Batch {
                id: BatchId::new(),
                courier_id: Some(courier.id.clone()),
                order_ids: plan.orders.iter().map(|o| o.id).collect(),
                route: self.planner.route(&plan.orders, courier.location),
                score: plan.score,
            };

            if self.store.commit_batch(&batch, &plan.effective_tiers).await? {
                self.couriers.mark_busy(&courier.id).await?;
                idle.swap_remove(idx);
                dispatched += 1;
                tracing::info!(
                    batch_id = %batch.id,
                    courier = courier.id,
                    orders = batch.order_ids.len(),
                    score = batch.score,
                    "batch dispatched"
                );
            }
        }
        Ok(dispatched)
    }

    /// Convert a still-pending order into a size-1 batch assigned to the
    /// nearest idle courier. Returns false when the order was already
    /// picked up by a batch cycle or no courier is available.
    pub async fn force_dispatch(&self, order_id: OrderId) -> Result<bool> {
        let order = self.store.get_order(order_id).await?;
        if order.status != OrderStatus::PendingMatching {
            return Ok(false);
        }
        let Some(courier) = self.couriers.nearest_idle(order.pickup).await? else {
            tracing::warn!(order_id = %order_id, "force dispatch deferred: no idle courier");
            return Ok(false);
        };

        let now = Utc::now();
        let tier = self.planner.effective_tier(&order, now);
        let orders = vec![order.clone()];
        let score = self.planner.score(&orders, &[tier], courier.location, now);
        let batch = Batch {
            id: BatchId::new(),
            courier_id: Some(courier.id.clone()),
            order_ids: vec![order.id],
            route: self.planner.route(&orders, courier.location),
            score,
        };

        let committed = self
            .store
            .commit_batch(&batch, &[(order.id, tier)])
            .await?;
        if committed {
            self.couriers.mark_busy(&courier.id).await?;
            tracing::info!(order_id = %order_id, courier = courier.id, "order force-dispatched");
        }
        Ok(committed)
    }

    pub fn escalation_deadline(&self, order: &DeliveryOrder) -> DateTime<Utc> {
        self.planner.escalation_deadline(order)
    }
}
