//! Postgres implementations of the foodmesh storage ports.
//!
//! Each adapter is a newtype wrapping PgPool. All SQL is runtime-checked
//! (`sqlx::query`, not `sqlx::query!`) to avoid a compile-time database
//! requirement.

pub mod dispatch;
pub mod ledger;
pub mod outbox;
pub mod surplus;

use sqlx::PgPool;

pub use dispatch::PgDispatchStore;
pub use ledger::PgLedgerStore;
pub use outbox::{append_in_tx, PgOutboxStore};
pub use surplus::PgSurplusStore;

/// Ordered migration set, embedded so harnesses can build isolated
/// databases without a migration CLI.
pub const MIGRATIONS: &[(&str, &str)] = &[
    ("001_surplus.sql", include_str!("../migrations/001_surplus.sql")),
    (
        "002_outbox_events.sql",
        include_str!("../migrations/002_outbox_events.sql"),
    ),
    (
        "003_deliveries.sql",
        include_str!("../migrations/003_deliveries.sql"),
    ),
    (
        "004_dispatch.sql",
        include_str!("../migrations/004_dispatch.sql"),
    ),
    (
        "005_carbon_ledger.sql",
        include_str!("../migrations/005_carbon_ledger.sql"),
    ),
];

/// All port implementations over one pool, in wiring order.
pub struct PgStores {
    pub surplus: PgSurplusStore,
    pub outbox: PgOutboxStore,
    pub dispatch: PgDispatchStore,
    pub ledger: PgLedgerStore,
}

impl PgStores {
    pub fn new(pool: PgPool) -> Self {
        Self {
            surplus: PgSurplusStore::new(pool.clone()),
            outbox: PgOutboxStore::new(pool.clone()),
            dispatch: PgDispatchStore::new(pool.clone()),
            ledger: PgLedgerStore::new(pool),
        }
    }
}
