//! In-process geo index over grid cells.
//!
//! Recipient locations are write-heavy (mobile clients report every few
//! minutes) and read in bursts by the fanout notifier, so the index shards
//! by cell with a concurrent map. Updates are idempotent on recipient id
//! and stamp a TTL; queries filter expired entries lazily and evict them.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use foodmesh_core::geo::{
    cells_covering, haversine_m, CellId, GeoPoint, RECIPIENT_CELL_LEVEL,
};
use foodmesh_core::ports::{GeoIndex, Result};

pub struct MemoryGeoIndex {
    cells: DashMap<CellId, HashMap<String, (GeoPoint, DateTime<Utc>)>>,
    recipients: DashMap<String, CellId>,
    ttl: Duration,
}

impl Default for MemoryGeoIndex {
    fn default() -> Self {
        Self::new(Duration::hours(24))
    }
}

impl MemoryGeoIndex {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cells: DashMap::new(),
            recipients: DashMap::new(),
            ttl,
        }
    }
}

#[async_trait]
impl GeoIndex for MemoryGeoIndex {
    async fn update_location(&self, recipient_id: &str, point: GeoPoint) -> Result<()> {
        let cell = CellId::from_point(point, RECIPIENT_CELL_LEVEL);
        if let Some(previous) = self.recipients.insert(recipient_id.to_string(), cell) {
            if previous != cell {
                if let Some(mut members) = self.cells.get_mut(&previous) {
                    members.remove(recipient_id);
                }
            }
        }
        self.cells
            .entry(cell)
            .or_default()
            .insert(recipient_id.to_string(), (point, Utc::now()));
        Ok(())
    }

    async fn query_within(
        &self,
        center: GeoPoint,
        radius_m: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        let now = Utc::now();
        let mut hits: Vec<(String, f64)> = Vec::new();

        for cell in cells_covering(center, radius_m, RECIPIENT_CELL_LEVEL) {
            let Some(mut members) = self.cells.get_mut(&cell) else {
                continue;
            };
            let mut expired = Vec::new();
            for (id, (point, updated_at)) in members.iter() {
                if now - *updated_at > self.ttl {
                    expired.push(id.clone());
                    continue;
                }
                let distance = haversine_m(center, *point);
                // Radius zero means "the containing cell", not a point
                // match, so the distance filter only applies for radius > 0.
                if radius_m <= 0.0 || distance <= radius_m {
                    hits.push((id.clone(), distance));
                }
            }
            for id in expired {
                members.remove(&id);
                self.recipients.remove(&id);
            }
        }

        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }
}
