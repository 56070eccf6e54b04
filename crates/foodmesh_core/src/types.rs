//! Core domain types for the foodmesh marketplace engine.
//! Pure value types — no sqlx, no HTTP dependencies.

// Several enums intentionally use `from_str() -> Option<Self>` instead of
// `FromStr` because they return None for unknown values rather than an error.
#![allow(clippy::should_implement_trait)]

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::{CellId, GeoPoint, DISPATCH_CELL_LEVEL};

// ── Identifiers ───────────────────────────────────────────────

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(SurplusId);
id_type!(EventId);
id_type!(OrderId);
id_type!(BatchId);
id_type!(EntryId);

// ── Food categories ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FoodCategory {
    Meat,
    Dairy,
    Produce,
    Bread,
    Mixed,
}

impl FoodCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Meat => "MEAT",
            Self::Dairy => "DAIRY",
            Self::Produce => "PRODUCE",
            Self::Bread => "BREAD",
            Self::Mixed => "MIXED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "MEAT" => Some(Self::Meat),
            "DAIRY" => Some(Self::Dairy),
            "PRODUCE" => Some(Self::Produce),
            "BREAD" => Some(Self::Bread),
            "MIXED" => Some(Self::Mixed),
            _ => None,
        }
    }
}

impl std::fmt::Display for FoodCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Surplus items ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurplusStatus {
    Available,
    Claimed,
    Expired,
    Delivered,
    Cancelled,
}

impl SurplusStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Claimed => "claimed",
            Self::Expired => "expired",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "available" => Some(Self::Available),
            "claimed" => Some(Self::Claimed),
            "expired" => Some(Self::Expired),
            "delivered" => Some(Self::Delivered),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Delivered | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurplusItem {
    pub id: SurplusId,
    pub provider_id: String,
    pub location: GeoPoint,
    pub cell_id: CellId,
    pub quantity_kg: f64,
    pub category: FoodCategory,
    pub posted_at: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    pub status: SurplusStatus,
    pub claimed_by: Option<String>,
    pub version: i64,
}

/// Input to `ClaimService::post`. The service assigns id, cell and status.
#[derive(Debug, Clone, Deserialize)]
pub struct SurplusDraft {
    pub provider_id: String,
    pub location: GeoPoint,
    pub quantity_kg: f64,
    pub category: FoodCategory,
    pub expiry_time: DateTime<Utc>,
}

// ── Outbox events ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "surplus.posted")]
    SurplusPosted,
    #[serde(rename = "surplus.claimed")]
    SurplusClaimed,
    #[serde(rename = "surplus.expired")]
    SurplusExpired,
    #[serde(rename = "surplus.rematch_required")]
    RematchRequired,
    #[serde(rename = "delivery.completed")]
    DeliveryCompleted,
    #[serde(rename = "escrow.funds_released")]
    FundsReleased,
    #[serde(rename = "auth.otp_requested")]
    OtpRequested,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SurplusPosted => "surplus.posted",
            Self::SurplusClaimed => "surplus.claimed",
            Self::SurplusExpired => "surplus.expired",
            Self::RematchRequired => "surplus.rematch_required",
            Self::DeliveryCompleted => "delivery.completed",
            Self::FundsReleased => "escrow.funds_released",
            Self::OtpRequested => "auth.otp_requested",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "surplus.posted" => Some(Self::SurplusPosted),
            "surplus.claimed" => Some(Self::SurplusClaimed),
            "surplus.expired" => Some(Self::SurplusExpired),
            "surplus.rematch_required" => Some(Self::RematchRequired),
            "delivery.completed" => Some(Self::DeliveryCompleted),
            "escrow.funds_released" => Some(Self::FundsReleased),
            "auth.otp_requested" => Some(Self::OtpRequested),
            _ => None,
        }
    }

    /// Fixed broker subject per kind.
    pub fn subject(&self) -> &'static str {
        match self {
            Self::SurplusPosted => "SURPLUS.posted",
            Self::SurplusClaimed => "SURPLUS.claimed",
            Self::SurplusExpired => "SURPLUS.expired",
            Self::RematchRequired => "MATCHING.rematch",
            Self::DeliveryCompleted => "DELIVERY.completed",
            Self::FundsReleased => "ESCROW.funds_released",
            Self::OtpRequested => "AUTH.otp",
        }
    }

    /// Kinds whose delivery is worse than useless once stale. A five-minute
    /// old OTP must never reach the user; a five-minute old claim is still
    /// meaningful and must always be emitted.
    pub fn stale_droppable(&self) -> bool {
        matches!(self, Self::OtpRequested)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A durably queued domain event, as read back from the outbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    pub aggregate_id: Uuid,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub published: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub correlation_id: Uuid,
}

/// An event to be enqueued. `created_at` and `published` are assigned by
/// the store at insert time.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub id: EventId,
    pub aggregate_id: Uuid,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub correlation_id: Uuid,
}

impl NewOutboxEvent {
    pub fn new(
        aggregate_id: Uuid,
        kind: EventKind,
        payload: serde_json::Value,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            id: EventId::new(),
            aggregate_id,
            kind,
            payload,
            correlation_id,
        }
    }
}

// ── Event payloads ────────────────────────────────────────────
// Self-describing payload shapes. The propagator never inspects these;
// they are the contract between producers and broker consumers.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurplusPostedPayload {
    pub surplus_id: SurplusId,
    pub provider_id: String,
    pub lat: f64,
    pub lon: f64,
    pub quantity_kg: f64,
    pub category: FoodCategory,
    pub expiry_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurplusClaimedPayload {
    pub surplus_id: SurplusId,
    pub claimant_id: String,
    pub method: FulfillmentMethod,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub quantity_kg: f64,
    pub category: FoodCategory,
    pub expiry_time: DateTime<Utc>,
    pub sla_tier: SlaTier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RematchPayload {
    pub surplus_id: SurplusId,
    pub excluded_recipients: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryCompletedPayload {
    pub vendor_id: String,
    pub order_id: Uuid,
    pub category: FoodCategory,
    pub weight_kg: f64,
}

// ── Claims & fulfillment ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentMethod {
    Courier,
    SelfPickup,
}

impl FulfillmentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Courier => "courier",
            Self::SelfPickup => "self_pickup",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FulfillmentSpec {
    pub method: FulfillmentMethod,
    /// Claimant's current position; dropoff for courier deliveries,
    /// distance check origin for self-pickup.
    pub recipient_location: GeoPoint,
    /// Requested delivery tier; only meaningful for courier fulfillment.
    pub sla_tier: Option<SlaTier>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimReceipt {
    pub item_id: SurplusId,
    pub claimant_id: String,
    pub method: FulfillmentMethod,
    pub tracking_id: Option<String>,
    pub verification_code: Option<String>,
    pub distance_to_provider_m: Option<f64>,
    pub claimed_at: DateTime<Utc>,
}

/// Row in the `deliveries` table created alongside a successful claim.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub item_id: SurplusId,
    pub method: FulfillmentMethod,
    pub verification_code: Option<String>,
}

// ── Dispatch ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaTier {
    Express,
    Standard,
    Hemat,
    Critical,
}

impl SlaTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Express => "EXPRESS",
            Self::Standard => "STANDARD",
            Self::Hemat => "HEMAT",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "EXPRESS" => Some(Self::Express),
            "STANDARD" => Some(Self::Standard),
            "HEMAT" => Some(Self::Hemat),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Maximum batch size for the tier. EXPRESS and CRITICAL ride alone.
    pub fn batch_cap(&self) -> usize {
        match self {
            Self::Express | Self::Critical => 1,
            Self::Standard => 2,
            Self::Hemat => 4,
        }
    }

    pub fn urgency(&self) -> f64 {
        match self {
            Self::Express | Self::Critical => 100.0,
            Self::Standard => 50.0,
            Self::Hemat => 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingMatching,
    Batched,
    Dispatched,
    PickedUp,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingMatching => "pending_matching",
            Self::Batched => "batched",
            Self::Dispatched => "dispatched",
            Self::PickedUp => "picked_up",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending_matching" => Some(Self::PendingMatching),
            "batched" => Some(Self::Batched),
            "dispatched" => Some(Self::Dispatched),
            "picked_up" => Some(Self::PickedUp),
            "delivered" => Some(Self::Delivered),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOrder {
    pub id: OrderId,
    pub item_id: SurplusId,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub expiry_time: DateTime<Utc>,
    pub requested_tier: SlaTier,
    pub effective_tier: SlaTier,
    pub quantity_kg: f64,
    pub status: OrderStatus,
    pub batch_id: Option<BatchId>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryOrder {
    /// Recompute the effective tier: anything expiring within the critical
    /// window is escalated regardless of what was requested.
    pub fn effective_tier_at(&self, now: DateTime<Utc>, critical_window: Duration) -> SlaTier {
        if self.expiry_time - now < critical_window {
            SlaTier::Critical
        } else {
            self.requested_tier
        }
    }

    pub fn dispatch_cell(&self) -> CellId {
        CellId::from_point(self.pickup, DISPATCH_CELL_LEVEL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaypointKind {
    Pickup,
    Dropoff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waypoint {
    pub order_id: OrderId,
    pub kind: WaypointKind,
    pub point: GeoPoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub courier_id: Option<String>,
    pub order_ids: Vec<OrderId>,
    pub route: Vec<Waypoint>,
    pub score: f64,
}

// ── Couriers & recipients ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Courier {
    pub id: String,
    pub location: GeoPoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientLocation {
    pub recipient_id: String,
    pub point: GeoPoint,
    pub updated_at: DateTime<Utc>,
}

// ── Carbon ledger ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarbonEntry {
    pub id: EntryId,
    pub vendor_id: String,
    pub order_id: Uuid,
    pub category: FoodCategory,
    pub weight_kg: f64,
    pub saved_kg: f64,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: String,
    pub own_hash: String,
}

/// A ledger entry before it is chained. The store reads the current tail
/// under the append lock and seals the hash.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: EntryId,
    pub vendor_id: String,
    pub order_id: Uuid,
    pub category: FoodCategory,
    pub weight_kg: f64,
    pub saved_kg: f64,
    pub timestamp: DateTime<Utc>,
}
