//! HTTP routes

pub mod accounts;
pub mod ops;
pub mod webhooks;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(ops::health))
        // Provider webhook intake
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .route("/webhooks/gocardless", post(webhooks::gocardless_webhook))
        // Account-facing billing endpoints
        .route("/accounts", post(accounts::create_account))
        .route("/accounts/{id}/plan", post(accounts::select_plan))
        .route(
            "/accounts/{id}/subscription",
            get(accounts::get_subscription),
        )
        .route(
            "/accounts/{id}/entitlement",
            get(accounts::get_entitlement),
        )
        .route("/accounts/{id}/history", get(accounts::get_history))
        .route("/plans", get(accounts::list_plans))
        // Operator endpoints
        .route("/ops/invariants", get(ops::run_invariants))
        .route("/ops/invariants/{name}", post(ops::run_invariant))
        .route("/ops/unmatched/sweep", post(ops::sweep_unmatched))
        .route("/ops/ledger/unmatched", get(ops::recent_unmatched))
        .route("/ops/outbound/backlog", get(ops::outbound_backlog))
        .with_state(state)
}
