//! Operator endpoints
//!
//! Health, invariant checks, the unmatched-event sweep, and queue
//! visibility. These sit behind the deployment's internal network; they
//! carry no authentication of their own.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use billhook_billing::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, UnmatchedSweepReport,
};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    sqlx::query("SELECT 1").execute(&state.pool).await?;
    Ok(Json(json!({
        "status": "ok",
        "service": "billhook-api",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

pub async fn run_invariants(State(state): State<AppState>) -> ApiResult<Json<InvariantCheckSummary>> {
    let checker = InvariantChecker::new(state.pool.clone());
    let summary = checker.run_all_checks().await?;
    if !summary.healthy {
        tracing::warn!(
            violations = summary.violations.len(),
            "Invariant check requested via API found violations"
        );
    }
    Ok(Json(summary))
}

pub async fn run_invariant(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<InvariantViolation>>> {
    if !InvariantChecker::available_checks().contains(&name.as_str()) {
        return Err(ApiError::Validation(format!("Unknown invariant '{name}'")));
    }
    let checker = InvariantChecker::new(state.pool.clone());
    let violations = checker.run_check(&name).await?;
    Ok(Json(violations))
}

#[derive(Debug, Deserialize)]
pub struct SweepParams {
    pub lookback_hours: Option<i32>,
    pub limit: Option<i64>,
}

/// Manually trigger the unmatched-event sweep the worker otherwise runs
/// hourly. Useful right after fixing account data.
pub async fn sweep_unmatched(
    State(state): State<AppState>,
    Query(params): Query<SweepParams>,
) -> ApiResult<Json<UnmatchedSweepReport>> {
    let lookback_hours = params.lookback_hours.unwrap_or(24).clamp(1, 720);
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    let report = state
        .billing
        .webhooks
        .resolve_unmatched(lookback_hours, limit)
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
pub struct UnmatchedEntryResponse {
    pub id: Uuid,
    pub provider: String,
    pub external_event_id: String,
    pub event_type: String,
    pub detail: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub event_occurred_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

pub async fn recent_unmatched(
    State(state): State<AppState>,
    Query(params): Query<SweepParams>,
) -> ApiResult<Json<Vec<UnmatchedEntryResponse>>> {
    let lookback_hours = params.lookback_hours.unwrap_or(24).clamp(1, 720);
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let entries = state
        .billing
        .ledger
        .recent_unmatched(lookback_hours, limit)
        .await?;
    let entries = entries
        .into_iter()
        .map(|entry| UnmatchedEntryResponse {
            id: entry.id,
            provider: entry.provider.as_str().to_string(),
            external_event_id: entry.external_event_id,
            event_type: entry.event_type,
            detail: entry.detail,
            event_occurred_at: entry.event_occurred_at,
            received_at: entry.received_at,
        })
        .collect();
    Ok(Json(entries))
}

pub async fn outbound_backlog(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let backlog = state.billing.outbound.backlog_size().await?;
    Ok(Json(json!({ "backlog": backlog })))
}
