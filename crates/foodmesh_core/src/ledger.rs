//! Carbon impact ledger: per-category savings factors, the hash chain and
//! its verifier, and period reporting.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::CoreError;
use crate::ports::{LedgerStore, Result};
use crate::types::{CarbonEntry, EntryId, FoodCategory, PendingEntry};

/// Previous-hash of the first entry in the chain.
pub const GENESIS_HASH: &str = "0000000000000000";

/// Emission savings per kg of rescued food, in kg CO₂e. Fixed at compile
/// time; changing a factor requires a new ledger epoch.
pub fn impact_factor(category: FoodCategory) -> f64 {
    match category {
        FoodCategory::Meat => 27.0,
        FoodCategory::Dairy => 12.0,
        FoodCategory::Produce => 2.5,
        FoodCategory::Bread => 1.2,
        FoodCategory::Mixed => 3.5,
    }
}

pub fn savings_kg(weight_kg: f64, category: FoodCategory) -> f64 {
    weight_kg * impact_factor(category)
}

/// Canonical byte string hashed into `own_hash`. `|` never occurs in the
/// fixed-format fields, so the concatenation is unambiguous.
fn canonical_input(entry: &PendingEntry, previous_hash: &str) -> String {
    format!(
        "{}|{}|{}|{:.3}|{:.3}|{}|{}",
        entry.id,
        entry.vendor_id,
        entry.order_id,
        entry.weight_kg,
        entry.saved_kg,
        entry.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        previous_hash,
    )
}

/// Chain a pending entry onto `previous_hash`, producing the sealed entry.
pub fn seal(entry: PendingEntry, previous_hash: &str) -> CarbonEntry {
    let digest = Sha256::digest(canonical_input(&entry, previous_hash).as_bytes());
    CarbonEntry {
        id: entry.id,
        vendor_id: entry.vendor_id,
        order_id: entry.order_id,
        category: entry.category,
        weight_kg: entry.weight_kg,
        saved_kg: entry.saved_kg,
        timestamp: entry.timestamp,
        previous_hash: previous_hash.to_string(),
        own_hash: hex::encode(digest),
    }
}

/// Recompute an entry's hash from its stored fields.
fn recompute_hash(entry: &CarbonEntry) -> String {
    let pending = PendingEntry {
        id: entry.id,
        vendor_id: entry.vendor_id.clone(),
        order_id: entry.order_id,
        category: entry.category,
        weight_kg: entry.weight_kg,
        saved_kg: entry.saved_kg,
        timestamp: entry.timestamp,
    };
    hex::encode(Sha256::digest(
        canonical_input(&pending, &entry.previous_hash).as_bytes(),
    ))
}

/// Outcome of walking the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ChainVerdict {
    Intact { length: usize },
    /// First position (0-based) whose stored hash does not match, with the
    /// reason.
    Broken { position: usize, reason: String },
}

/// Walk `entries` (global timestamp order) and fail on the first mismatch:
/// either a recomputed own-hash differs (field tampering) or a link does
/// not reference its predecessor's hash.
pub fn verify_chain(entries: &[CarbonEntry]) -> ChainVerdict {
    let mut previous = GENESIS_HASH.to_string();
    for (position, entry) in entries.iter().enumerate() {
        if entry.previous_hash != previous {
            return ChainVerdict::Broken {
                position,
                reason: "previous_hash does not match chain tail".into(),
            };
        }
        if recompute_hash(entry) != entry.own_hash {
            return ChainVerdict::Broken {
                position,
                reason: "own_hash does not match entry contents".into(),
            };
        }
        previous = entry.own_hash.clone();
    }
    ChainVerdict::Intact {
        length: entries.len(),
    }
}

// ── Period reporting ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactReport {
    pub vendor_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_food_kg: f64,
    pub total_saved_kg: f64,
    pub entry_count: usize,
    pub verification_hash: String,
}

fn report_hash(
    vendor_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    total_food: f64,
    total_saved: f64,
    count: usize,
) -> String {
    let input = format!(
        "{vendor_id}|{}|{}|{total_food:.3}|{total_saved:.3}|{count}",
        from.to_rfc3339_opts(SecondsFormat::Micros, true),
        to.to_rfc3339_opts(SecondsFormat::Micros, true),
    );
    hex::encode(Sha256::digest(input.as_bytes()))
}

// ── Service ───────────────────────────────────────────────────

/// Append and reporting facade over the ledger store.
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Record the savings of a completed delivery. Returns the sealed
    /// entry's hash.
    pub async fn record(
        &self,
        vendor_id: &str,
        order_id: Uuid,
        category: FoodCategory,
        weight_kg: f64,
    ) -> Result<String> {
        if weight_kg <= 0.0 {
            return Err(CoreError::Validation("weight_kg must be positive".into()));
        }
        let entry = PendingEntry {
            id: EntryId::new(),
            vendor_id: vendor_id.to_string(),
            order_id,
            category,
            weight_kg,
            saved_kg: savings_kg(weight_kg, category),
            timestamp: Utc::now(),
        };
        let sealed = self.store.append(entry).await?;
        Ok(sealed.own_hash)
    }

    pub async fn report(
        &self,
        vendor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<ImpactReport> {
        if to <= from {
            return Err(CoreError::Validation("period end must follow start".into()));
        }
        let entries = self.store.entries_for_period(vendor_id, from, to).await?;
        let total_food: f64 = entries.iter().map(|e| e.weight_kg).sum();
        let total_saved: f64 = entries.iter().map(|e| e.saved_kg).sum();
        Ok(ImpactReport {
            vendor_id: vendor_id.to_string(),
            period_start: from,
            period_end: to,
            total_food_kg: total_food,
            total_saved_kg: total_saved,
            entry_count: entries.len(),
            verification_hash: report_hash(vendor_id, from, to, total_food, total_saved, entries.len()),
        })
    }

    /// Walk the whole chain. An intact chain is the identity on append;
    /// any break is an invariant violation worth alerting on.
    pub async fn verify(&self) -> Result<ChainVerdict> {
        let entries = self.store.chain().await?;
        let verdict = verify_chain(&entries);
        if let ChainVerdict::Broken { position, reason } = &verdict {
            tracing::error!(position, reason, "carbon ledger chain mismatch");
        }
        Ok(verdict)
    }
}
