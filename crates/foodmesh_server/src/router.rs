//! Router construction for the foodmesh server.

use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};

use crate::handlers;
use crate::middleware::{correlation, load_shed};
use crate::state::AppState;

/// Build the full axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/surplus", post(handlers::surplus::post_surplus))
        .route("/surplus/:id", get(handlers::surplus::get_surplus))
        .route("/surplus/:id/claim", post(handlers::surplus::claim_surplus))
        .route(
            "/surplus/:id/claim/cancel",
            post(handlers::surplus::cancel_claim),
        )
        .route("/marketplace", get(handlers::surplus::marketplace))
        .route(
            "/deliveries/verify-pickup",
            post(handlers::surplus::verify_pickup),
        )
        .route("/orders", post(handlers::orders::create_order))
        .route("/orders/:id", get(handlers::orders::get_order))
        .route(
            "/orders/:id/force-dispatch",
            post(handlers::orders::force_dispatch),
        )
        .route("/locations", post(handlers::locations::update_recipient))
        .route(
            "/couriers/location",
            post(handlers::locations::update_courier),
        )
        .route("/carbon/report", get(handlers::carbon::report))
        .route("/carbon/verify", get(handlers::carbon::verify))
        .layer(axum_mw::from_fn_with_state(state.clone(), load_shed));

    // Health endpoints bypass the shedder: an overloaded instance is
    // still alive.
    let health = Router::new()
        .route("/health/live", get(handlers::health::live))
        .route("/health/ready", get(handlers::health::ready));

    api.merge(health)
        .layer(axum_mw::from_fn(correlation))
        .with_state(state)
}
