//! Shared application state handed to every handler.

use std::sync::Arc;

use sqlx::PgPool;

use foodmesh_core::claim::ClaimService;
use foodmesh_core::dispatch::DispatchEngine;
use foodmesh_core::ledger::LedgerService;
use foodmesh_core::ports::{CourierDirectory, GeoIndex};
use foodmesh_core::shed::LoadShedder;

#[derive(Clone)]
pub struct AppState {
    pub claims: Arc<ClaimService>,
    pub dispatch: Arc<DispatchEngine>,
    pub ledger: Arc<LedgerService>,
    pub geo: Arc<dyn GeoIndex>,
    pub couriers: Arc<dyn CourierDirectory>,
    pub shedder: Arc<LoadShedder>,
    /// Present in production wiring; absent in contract tests driven by
    /// in-memory ports. Readiness degrades gracefully without it.
    pub db: Option<PgPool>,
}
