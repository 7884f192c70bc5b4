//! Account-facing billing endpoints
//!
//! Account creation, plan selection, and read views over subscription
//! state, entitlement, and the audit trail.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use billhook_billing::{EntitlementView, PlanStatusEvent, Subscription};
use billhook_shared::{BillingCadence, PaymentProvider, SubscriptionStatus};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct AccountResponse {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub plan_code: Option<String>,
    pub plan_status: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

pub async fn create_account(
    State(state): State<AppState>,
    Json(req): Json<CreateAccountRequest>,
) -> ApiResult<Json<AccountResponse>> {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::Validation("A valid email is required".to_string()));
    }

    let account: AccountResponse = sqlx::query_as(
        r#"
        INSERT INTO accounts (email, display_name)
        VALUES ($1, $2)
        RETURNING id, email, display_name, plan_code, plan_status, created_at
        "#,
    )
    .bind(&email)
    .bind(&req.display_name)
    .fetch_one(&state.pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            ApiError::Validation("An account with this email already exists".to_string())
        } else {
            ApiError::from(e)
        }
    })?;

    tracing::info!(account_id = %account.id, "Account created");
    Ok(Json(account))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505")
}

#[derive(Debug, Deserialize)]
pub struct SelectPlanRequest {
    pub plan_code: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub id: Uuid,
    pub account_id: Uuid,
    pub status: SubscriptionStatus,
    pub provider: Option<PaymentProvider>,
    pub plan_code: Option<String>,
    pub cadence: BillingCadence,
    pub provider_mandate_ref: Option<String>,
    pub provider_customer_ref: Option<String>,
    pub provider_subscription_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_event_at: Option<OffsetDateTime>,
    pub last_event_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(s: Subscription) -> Self {
        Self {
            id: s.id,
            account_id: s.account_id,
            status: s.status,
            provider: s.provider,
            plan_code: s.plan_code,
            cadence: s.cadence,
            provider_mandate_ref: s.provider_mandate_ref,
            provider_customer_ref: s.provider_customer_ref,
            provider_subscription_ref: s.provider_subscription_ref,
            last_event_at: s.last_event_at,
            last_event_id: s.last_event_id,
            created_at: s.created_at,
        }
    }
}

pub async fn select_plan(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(req): Json<SelectPlanRequest>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let subscription = state
        .billing
        .engine
        .select_plan(account_id, &req.plan_code)
        .await?;
    Ok(Json(subscription.into()))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let subscription = state
        .billing
        .engine
        .get_subscription(account_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(subscription.into()))
}

pub async fn get_entitlement(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> ApiResult<Json<EntitlementView>> {
    let view = state.billing.entitlement.check(account_id).await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
}

pub async fn get_history(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<Vec<PlanStatusEvent>>> {
    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let events = state
        .billing
        .audit
        .events_for_account(account_id, limit)
        .await?;
    Ok(Json(events))
}

#[derive(Debug, Serialize, FromRow)]
pub struct PlanResponse {
    pub code: String,
    pub name: String,
    pub cadence: String,
    pub price_cents: i32,
    pub currency: String,
}

pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<PlanResponse>>> {
    let plans: Vec<PlanResponse> = sqlx::query_as(
        "SELECT code, name, cadence, price_cents, currency FROM plans ORDER BY price_cents",
    )
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(plans))
}
