//! In-process courier directory. Couriers report their position over the
//! HTTP surface; a position report returns a busy courier to the idle
//! pool (drop-off complete from the rider app's perspective).

use async_trait::async_trait;
use dashmap::DashMap;

use foodmesh_core::geo::{haversine_km, GeoPoint};
use foodmesh_core::ports::{CourierDirectory, Result};
use foodmesh_core::types::Courier;

#[derive(Default)]
pub struct MemoryCourierDirectory {
    couriers: DashMap<String, (GeoPoint, bool)>, // position, idle
}

impl MemoryCourierDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CourierDirectory for MemoryCourierDirectory {
    async fn update_location(&self, courier_id: &str, point: GeoPoint) -> Result<()> {
        self.couriers.insert(courier_id.to_string(), (point, true));
        Ok(())
    }

    async fn idle_couriers(&self) -> Result<Vec<Courier>> {
        Ok(self
            .couriers
            .iter()
            .filter(|entry| entry.value().1)
            .map(|entry| Courier {
                id: entry.key().clone(),
                location: entry.value().0,
            })
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
        if let Some(mut entry) = self.couriers.get_mut(courier_id) {
            entry.value_mut().1 = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nearest_idle_skips_busy_couriers() {
        let directory = MemoryCourierDirectory::new();
        let target = GeoPoint::new(-6.2, 106.8);
        directory.update_location("close", target).await.unwrap();
        directory
            .update_location("far", GeoPoint::new(-6.4, 107.0))
            .await
            .unwrap();

        directory.mark_busy("close").await.unwrap();
        let nearest = directory.nearest_idle(target).await.unwrap().unwrap();
        assert_eq!(nearest.id, "far");

        // Reporting a new position returns the courier to the pool.
        directory.update_location("close", target).await.unwrap();
        let nearest = directory.nearest_idle(target).await.unwrap().unwrap();
        assert_eq!(nearest.id, "close");
    }
}
