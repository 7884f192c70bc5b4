//! Post-commit side-effect queue
//!
//! Transition transactions enqueue rows here so effects become visible
//! exactly when the state change does. The worker drains the queue after
//! commit; a failing task retries on its own schedule and never touches
//! subscription state.

use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgExecutor, PgPool, Row};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use billhook_shared::types::UnknownValue;

use crate::error::BillingResult;

/// Attempts before a task is abandoned.
pub const MAX_TASK_ATTEMPTS: i32 = 5;

/// Claimed tasks older than this are presumed orphaned by a crashed worker
/// and become claimable again.
const STUCK_TASK_TIMEOUT_MINUTES: i32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    EmailPaymentFailed,
    EmailPlanCancelled,
    EmailPaymentReceipt,
    CreateInvoice,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::EmailPaymentFailed => "email_payment_failed",
            TaskKind::EmailPlanCancelled => "email_plan_cancelled",
            TaskKind::EmailPaymentReceipt => "email_payment_receipt",
            TaskKind::CreateInvoice => "create_invoice",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email_payment_failed" => Ok(TaskKind::EmailPaymentFailed),
            "email_plan_cancelled" => Ok(TaskKind::EmailPlanCancelled),
            "email_payment_receipt" => Ok(TaskKind::EmailPaymentReceipt),
            "create_invoice" => Ok(TaskKind::CreateInvoice),
            other => Err(UnknownValue {
                kind: "task kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Retry delay after the given (1-based) failed attempt. Exponential from
/// one minute, capped at an hour.
pub fn retry_backoff(attempt: i32) -> Duration {
    let exp = attempt.saturating_sub(1).clamp(0, 6);
    let secs = 60i64 << exp;
    Duration::seconds(secs.min(3600))
}

#[derive(Debug, Clone)]
pub struct OutboundTask {
    pub id: Uuid,
    pub kind: TaskKind,
    pub account_id: Uuid,
    pub provider_event_id: Option<String>,
    pub payload: Value,
    pub attempt_count: i32,
    pub next_attempt_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

impl FromRow<'_, PgRow> for OutboundTask {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        Ok(OutboundTask {
            id: row.try_get("id")?,
            kind: kind.parse().map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            account_id: row.try_get("account_id")?,
            provider_event_id: row.try_get("provider_event_id")?,
            payload: row.try_get("payload")?,
            attempt_count: row.try_get("attempt_count")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Clone)]
pub struct OutboundQueue {
    pool: PgPool,
}

impl OutboundQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a task. Executor-generic so transition transactions can
    /// enqueue atomically with the state change.
    pub async fn enqueue<'e, E: PgExecutor<'e>>(
        executor: E,
        kind: TaskKind,
        account_id: Uuid,
        provider_event_id: Option<&str>,
        payload: Value,
    ) -> BillingResult<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO outbound_tasks (kind, account_id, provider_event_id, payload)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(kind.as_str())
        .bind(account_id)
        .bind(provider_event_id)
        .bind(payload)
        .fetch_one(executor)
        .await?;
        tracing::debug!(task_id = %id, kind = %kind, account_id = %account_id, "Outbound task queued");
        Ok(id)
    }

    /// Claim up to `limit` due tasks. `SKIP LOCKED` keeps concurrent
    /// drainers off each other's rows; stuck claims from a crashed worker
    /// become claimable after a timeout.
    pub async fn claim_batch(&self, limit: i64) -> BillingResult<Vec<OutboundTask>> {
        let tasks = sqlx::query_as(
            r#"
            UPDATE outbound_tasks SET locked_at = NOW()
            WHERE id IN (
                SELECT id FROM outbound_tasks
                WHERE status IN ('pending', 'failed')
                  AND next_attempt_at <= NOW()
                  AND (locked_at IS NULL OR locked_at < NOW() - ($2 || ' minutes')::INTERVAL)
                ORDER BY next_attempt_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, kind, account_id, provider_event_id, payload,
                      attempt_count, next_attempt_at, created_at
            "#,
        )
        .bind(limit)
        .bind(STUCK_TASK_TIMEOUT_MINUTES)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    pub async fn mark_done(&self, task_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE outbound_tasks
            SET status = 'done', completed_at = NOW(), locked_at = NULL, last_error = NULL
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed attempt. Schedules a retry with backoff, or
    /// abandons the task once the attempt cap is reached. Returns whether
    /// the task was abandoned.
    pub async fn mark_failed(
        &self,
        task_id: Uuid,
        attempt_count: i32,
        error: &str,
    ) -> BillingResult<bool> {
        let attempts = attempt_count + 1;
        if attempts >= MAX_TASK_ATTEMPTS {
            sqlx::query(
                r#"
                UPDATE outbound_tasks
                SET status = 'abandoned', attempt_count = $2, last_error = $3, locked_at = NULL
                WHERE id = $1
                "#,
            )
            .bind(task_id)
            .bind(attempts)
            .bind(error)
            .execute(&self.pool)
            .await?;
            tracing::warn!(
                task_id = %task_id,
                attempts = attempts,
                error = %error,
                "Outbound task abandoned after repeated failures"
            );
            Ok(true)
        } else {
            let delay = retry_backoff(attempts);
            sqlx::query(
                r#"
                UPDATE outbound_tasks
                SET status = 'failed', attempt_count = $2, last_error = $3,
                    next_attempt_at = NOW() + ($4 || ' seconds')::INTERVAL, locked_at = NULL
                WHERE id = $1
                "#,
            )
            .bind(task_id)
            .bind(attempts)
            .bind(error)
            .bind(delay.whole_seconds() as i32)
            .execute(&self.pool)
            .await?;
            tracing::warn!(
                task_id = %task_id,
                attempts = attempts,
                retry_in_secs = delay.whole_seconds(),
                error = %error,
                "Outbound task failed; retry scheduled"
            );
            Ok(false)
        }
    }

    /// Tasks not yet in a terminal state. Used by operator endpoints and
    /// the invariant sweep.
    pub async fn backlog_size(&self) -> BillingResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM outbound_tasks WHERE status IN ('pending', 'failed')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn task_kind_round_trips() {
        for kind in [
            TaskKind::EmailPaymentFailed,
            TaskKind::EmailPlanCancelled,
            TaskKind::EmailPaymentReceipt,
            TaskKind::CreateInvoice,
        ] {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_task_kind_is_rejected() {
        assert!("send_fax".parse::<TaskKind>().is_err());
    }

    #[test]
    fn backoff_doubles_from_one_minute() {
        assert_eq!(retry_backoff(1), Duration::seconds(60));
        assert_eq!(retry_backoff(2), Duration::seconds(120));
        assert_eq!(retry_backoff(3), Duration::seconds(240));
        assert_eq!(retry_backoff(4), Duration::seconds(480));
    }

    #[test]
    fn backoff_is_capped_at_one_hour() {
        assert_eq!(retry_backoff(7), Duration::seconds(3600));
        assert_eq!(retry_backoff(50), Duration::seconds(3600));
    }

    #[test]
    fn backoff_tolerates_degenerate_attempts() {
        assert_eq!(retry_backoff(0), Duration::seconds(60));
        assert_eq!(retry_backoff(-3), Duration::seconds(60));
    }
}
