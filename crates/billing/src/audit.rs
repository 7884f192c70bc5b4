//! Status transition audit trail
//!
//! `plan_status_events` is append-only: one row per accepted status change,
//! written inside the same transaction as the subscription update so a
//! change without its audit record is never observable. Rejected events
//! (stale, unmatched, duplicate) write nothing here.

use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgExecutor, PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use billhook_shared::{PaymentProvider, SubscriptionStatus};

use crate::error::BillingResult;

/// One accepted transition, as stored.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStatusEvent {
    pub id: Uuid,
    pub account_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub old_status: Option<SubscriptionStatus>,
    pub new_status: SubscriptionStatus,
    pub reason_code: String,
    pub provider: Option<PaymentProvider>,
    pub provider_event_id: Option<String>,
    pub provider_event_type: Option<String>,
    pub metadata: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl FromRow<'_, PgRow> for PlanStatusEvent {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let old_status: Option<String> = row.try_get("old_status")?;
        let new_status: String = row.try_get("new_status")?;
        let provider: Option<String> = row.try_get("provider")?;
        Ok(PlanStatusEvent {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            subscription_id: row.try_get("subscription_id")?,
            old_status: old_status
                .map(|s| s.parse())
                .transpose()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            new_status: new_status
                .parse()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            reason_code: row.try_get("reason_code")?,
            provider: provider
                .map(|s| s.parse())
                .transpose()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            provider_event_id: row.try_get("provider_event_id")?,
            provider_event_type: row.try_get("provider_event_type")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Input for one audit append.
#[derive(Debug)]
pub struct TransitionRecord<'a> {
    pub account_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub old_status: Option<SubscriptionStatus>,
    pub new_status: SubscriptionStatus,
    pub reason_code: &'a str,
    pub provider: Option<PaymentProvider>,
    pub provider_event_id: Option<&'a str>,
    pub provider_event_type: Option<&'a str>,
    pub metadata: Value,
}

#[derive(Clone)]
pub struct AuditRecorder {
    pool: PgPool,
}

impl AuditRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one transition record. Callers invoke this only when the old
    /// and new status differ, and always on the transaction that carries
    /// the subscription update.
    pub async fn record<'e, E>(executor: E, entry: &TransitionRecord<'_>) -> BillingResult<Uuid>
    where
        E: PgExecutor<'e>,
    {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO plan_status_events
                (account_id, subscription_id, old_status, new_status, reason_code,
                 provider, provider_event_id, provider_event_type, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(entry.account_id)
        .bind(entry.subscription_id)
        .bind(entry.old_status.map(|s| s.as_str()))
        .bind(entry.new_status.as_str())
        .bind(entry.reason_code)
        .bind(entry.provider.map(|p| p.as_str()))
        .bind(entry.provider_event_id)
        .bind(entry.provider_event_type)
        .bind(&entry.metadata)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Newest-first transition history for an account.
    pub async fn events_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<PlanStatusEvent>> {
        let events = sqlx::query_as(
            r#"
            SELECT id, account_id, subscription_id, old_status, new_status, reason_code,
                   provider, provider_event_id, provider_event_type, metadata, created_at
            FROM plan_status_events
            WHERE account_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    /// Most recent transition for a subscription, if any.
    pub async fn latest_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<PlanStatusEvent>> {
        let event = sqlx::query_as(
            r#"
            SELECT id, account_id, subscription_id, old_status, new_status, reason_code,
                   provider, provider_event_id, provider_event_type, metadata, created_at
            FROM plan_status_events
            WHERE subscription_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }
}
