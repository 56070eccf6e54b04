//! Dispatch engine behavior over the in-memory stores: batch cycles,
//! escalation and courier assignment.

use std::sync::Arc;

use chrono::{Duration, Utc};

use foodmesh_core::dispatch::{DispatchConfig, DispatchEngine, OrderDraft};
use foodmesh_core::geo::GeoPoint;
use foodmesh_core::types::{OrderStatus, SlaTier, SurplusId};
use foodmesh_harness::mem::{MemCourierDirectory, MemDispatchStore};

fn engine(
    store: Arc<MemDispatchStore>,
    couriers: Arc<MemCourierDirectory>,
) -> DispatchEngine {
    DispatchEngine::new(store, couriers, DispatchConfig::default())
}

fn draft(tier: SlaTier, expiry_minutes: i64, pickup: GeoPoint) -> OrderDraft {
    OrderDraft {
        item_id: SurplusId::new(),
        pickup,
        dropoff: GeoPoint::new(pickup.lat + 0.01, pickup.lon + 0.01),
        expiry_time: Utc::now() + Duration::minutes(expiry_minutes),
        requested_tier: tier,
        quantity_kg: 4.0,
    }
}

const DEPOT: GeoPoint = GeoPoint {
    lat: -6.2,
    lon: 106.8,
};

#[tokio::test]
async fn hemat_order_near_expiry_dispatches_as_critical_singleton() {
    let store = MemDispatchStore::new();
    let couriers = MemCourierDirectory::new();
    couriers.add_courier("c1", DEPOT);
    let engine = engine(store.clone(), couriers);

    let order = engine
        .create_order(draft(SlaTier::Hemat, 10, DEPOT))
        .await
        .unwrap();
    assert_eq!(order.effective_tier, SlaTier::Critical);

    let dispatched = engine.run_batch_cycle().await.unwrap();
    assert_eq!(dispatched, 1);

    let batches = store.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].order_ids, vec![order.id]);
    assert_eq!(batches[0].courier_id.as_deref(), Some("c1"));

    let stored = engine.get_order(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Dispatched);
    assert_eq!(stored.effective_tier, SlaTier::Critical);
}

#[tokio::test]
async fn standard_orders_in_one_cell_share_a_batch() {
    let store = MemDispatchStore::new();
    let couriers = MemCourierDirectory::new();
    couriers.add_courier("c1", DEPOT);
    let engine = engine(store.clone(), couriers);

    let a = engine
        .create_order(draft(SlaTier::Standard, 120, DEPOT))
        .await
        .unwrap();
    let b = engine
        .create_order(draft(
            SlaTier::Standard,
            120,
            GeoPoint::new(-6.2002, 106.8002),
        ))
        .await
        .unwrap();

    assert_eq!(engine.run_batch_cycle().await.unwrap(), 1);
    let batches = store.batches();
    assert_eq!(batches.len(), 1);
    let mut ids = batches[0].order_ids.clone();
    ids.sort();
    let mut expected = vec![a.id, b.id];
    expected.sort();
    assert_eq!(ids, expected);
    assert_eq!(batches[0].route.len(), 4);
}

#[tokio::test]
async fn no_idle_couriers_leaves_orders_pending() {
    let store = MemDispatchStore::new();
    let couriers = MemCourierDirectory::new();
    let engine = engine(store.clone(), couriers);

    let order = engine
        .create_order(draft(SlaTier::Hemat, 120, DEPOT))
        .await
        .unwrap();
    assert_eq!(engine.run_batch_cycle().await.unwrap(), 0);
    let stored = engine.get_order(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::PendingMatching);
}

#[tokio::test]
async fn force_dispatch_assigns_nearest_idle_and_is_idempotent() {
    let store = MemDispatchStore::new();
    let couriers = MemCourierDirectory::new();
    couriers.add_courier("far", GeoPoint::new(-6.4, 107.0));
    couriers.add_courier("near", GeoPoint::new(-6.201, 106.801));
    let engine = engine(store.clone(), couriers);

    let order = engine
        .create_order(draft(SlaTier::Hemat, 120, DEPOT))
        .await
        .unwrap();

    assert!(engine.force_dispatch(order.id).await.unwrap());
    let batches = store.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].courier_id.as_deref(), Some("near"));

    // Already dispatched: the second fire is a no-op.
    assert!(!engine.force_dispatch(order.id).await.unwrap());
    assert_eq!(store.batches().len(), 1);
}

#[tokio::test]
async fn batch_cycle_consumes_one_courier_per_batch() {
    let store = MemDispatchStore::new();
    let couriers = MemCourierDirectory::new();
    couriers.add_courier("c1", DEPOT);
    let engine = engine(store.clone(), couriers);

    // Two cells → two candidate batches, one courier available.
    engine
        .create_order(draft(SlaTier::Hemat, 120, DEPOT))
        .await
        .unwrap();
    engine
        .create_order(draft(SlaTier::Hemat, 120, GeoPoint::new(-6.5, 107.2)))
        .await
        .unwrap();

    assert_eq!(engine.run_batch_cycle().await.unwrap(), 1);
    let pending = engine.pending_orders().await.unwrap();
    assert_eq!(pending.len(), 1, "second batch waits for the next courier");
}
