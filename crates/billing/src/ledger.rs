//! Idempotency ledger
//!
//! One `webhook_log` row per (provider, external event id). The claim is a
//! single INSERT ... ON CONFLICT ... RETURNING statement so only one
//! concurrent delivery can own processing rights; a redelivery while the
//! first attempt is in flight gets nothing back and is absorbed as a
//! duplicate. Rows stuck in `received` past a timeout are re-claimable,
//! which is the crash-recovery path: the transition is re-attempted
//! idempotently instead of failing permanently.

use std::str::FromStr;

use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgExecutor, PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use billhook_shared::PaymentProvider;

use crate::error::BillingResult;
use crate::event::ProviderEvent;

/// Minutes after which a `received` row counts as a crashed attempt.
const STUCK_CLAIM_TIMEOUT_MINUTES: i32 = 30;

/// Processing state of a ledger row. `received` is the in-flight claim;
/// the other three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    Received,
    Processed,
    Unmatched,
    Duplicate,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Received => "received",
            LedgerStatus::Processed => "processed",
            LedgerStatus::Unmatched => "unmatched",
            LedgerStatus::Duplicate => "duplicate",
        }
    }
}

impl FromStr for LedgerStatus {
    type Err = billhook_shared::types::UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(LedgerStatus::Received),
            "processed" => Ok(LedgerStatus::Processed),
            "unmatched" => Ok(LedgerStatus::Unmatched),
            "duplicate" => Ok(LedgerStatus::Duplicate),
            other => Err(billhook_shared::types::UnknownValue {
                kind: "ledger status",
                value: other.to_string(),
            }),
        }
    }
}

/// Result of the atomic claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// First sighting; this handler owns processing.
    New { ledger_id: Uuid },
    /// Re-claimed a stuck row from a crashed attempt; this handler owns
    /// re-processing.
    Retry { ledger_id: Uuid },
    /// Another delivery owns (or already finished) this event.
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub provider: PaymentProvider,
    pub external_event_id: String,
    pub event_type: String,
    pub processing_status: LedgerStatus,
    pub detail: Option<String>,
    pub summary: Value,
    pub event_occurred_at: Option<OffsetDateTime>,
    pub received_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

impl FromRow<'_, PgRow> for LedgerEntry {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let provider: String = row.try_get("provider")?;
        let status: String = row.try_get("processing_status")?;
        Ok(LedgerEntry {
            id: row.try_get("id")?,
            provider: provider
                .parse()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            external_event_id: row.try_get("external_event_id")?,
            event_type: row.try_get("event_type")?,
            processing_status: status
                .parse()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            detail: row.try_get("detail")?,
            summary: row.try_get("summary")?,
            event_occurred_at: row.try_get("event_occurred_at")?,
            received_at: row.try_get("received_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

#[derive(Clone)]
pub struct EventLedger {
    pool: PgPool,
}

impl EventLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomically claim exclusive processing rights for an event.
    ///
    /// The INSERT and the uniqueness check are one statement: if the row is
    /// new we own it, if it conflicts with a stuck `received` row we
    /// re-claim it, otherwise nothing comes back and the delivery is a
    /// duplicate. There is no check-then-insert window.
    pub async fn claim(&self, event: &ProviderEvent) -> BillingResult<ClaimOutcome> {
        let claimed: Option<(Uuid, bool)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_log
                (provider, external_event_id, event_type, summary, event_occurred_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (provider, external_event_id) DO UPDATE SET
                claimed_at = NOW(),
                detail = CONCAT('re-claimed stuck row at ', NOW()::TEXT)
            WHERE webhook_log.processing_status = 'received'
              AND webhook_log.claimed_at < NOW() - ($6 || ' minutes')::INTERVAL
            RETURNING id, (claimed_at = received_at) AS first_claim
            "#,
        )
        .bind(event.provider.as_str())
        .bind(&event.external_id)
        .bind(&event.event_type)
        .bind(&event.summary)
        .bind(event.occurred_at)
        .bind(STUCK_CLAIM_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match claimed {
            Some((ledger_id, true)) => ClaimOutcome::New { ledger_id },
            Some((ledger_id, false)) => {
                tracing::warn!(
                    provider = %event.provider,
                    event_id = %event.external_id,
                    "Re-claimed webhook event stuck in received state"
                );
                ClaimOutcome::Retry { ledger_id }
            }
            None => ClaimOutcome::Duplicate,
        })
    }

    /// Terminal mark for an applied (or no-op/stale) event. Called with the
    /// transition transaction as executor so `processed` commits together
    /// with the state change it describes.
    pub async fn mark_processed<'e, E>(
        executor: E,
        ledger_id: Uuid,
        detail: Option<String>,
    ) -> BillingResult<()>
    where
        E: PgExecutor<'e>,
    {
        Self::mark(executor, ledger_id, LedgerStatus::Processed, detail).await
    }

    pub async fn mark_unmatched<'e, E>(
        executor: E,
        ledger_id: Uuid,
        detail: Option<String>,
    ) -> BillingResult<()>
    where
        E: PgExecutor<'e>,
    {
        Self::mark(executor, ledger_id, LedgerStatus::Unmatched, detail).await
    }

    /// Terminal mark for a re-claimed row whose event turned out to be
    /// already applied (stored last-applied id equals the event id).
    pub async fn mark_duplicate<'e, E>(
        executor: E,
        ledger_id: Uuid,
        detail: Option<String>,
    ) -> BillingResult<()>
    where
        E: PgExecutor<'e>,
    {
        Self::mark(executor, ledger_id, LedgerStatus::Duplicate, detail).await
    }

    async fn mark<'e, E>(
        executor: E,
        ledger_id: Uuid,
        status: LedgerStatus,
        detail: Option<String>,
    ) -> BillingResult<()>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            UPDATE webhook_log
            SET processing_status = $2, detail = COALESCE($3, detail), processed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(ledger_id)
        .bind(status.as_str())
        .bind(detail)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Unmatched rows newer than the lookback window, oldest first, for the
    /// re-resolution sweep.
    pub async fn recent_unmatched(
        &self,
        lookback_hours: i32,
        limit: i64,
    ) -> BillingResult<Vec<LedgerEntry>> {
        let entries = sqlx::query_as(
            r#"
            SELECT id, provider, external_event_id, event_type, processing_status,
                   detail, summary, event_occurred_at, received_at, processed_at
            FROM webhook_log
            WHERE processing_status = 'unmatched'
              AND received_at > NOW() - ($1 || ' hours')::INTERVAL
            ORDER BY event_occurred_at ASC NULLS LAST
            LIMIT $2
            "#,
        )
        .bind(lookback_hours)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// Delete terminal `processed`/`duplicate` rows older than the retention
    /// window. `unmatched` rows are kept for operator forensics.
    pub async fn prune_terminal(&self, older_than_days: i32) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM webhook_log
            WHERE processing_status IN ('processed', 'duplicate')
              AND received_at < NOW() - ($1 || ' days')::INTERVAL
            "#,
        )
        .bind(older_than_days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Single-row lookup for the operator surface.
    pub async fn find(
        &self,
        provider: PaymentProvider,
        external_event_id: &str,
    ) -> BillingResult<Option<LedgerEntry>> {
        let entry = sqlx::query_as(
            r#"
            SELECT id, provider, external_event_id, event_type, processing_status,
                   detail, summary, event_occurred_at, received_at, processed_at
            FROM webhook_log
            WHERE provider = $1 AND external_event_id = $2
            "#,
        )
        .bind(provider.as_str())
        .bind(external_event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn ledger_status_round_trips() {
        for status in [
            LedgerStatus::Received,
            LedgerStatus::Processed,
            LedgerStatus::Unmatched,
            LedgerStatus::Duplicate,
        ] {
            assert_eq!(status.as_str().parse::<LedgerStatus>().unwrap(), status);
        }
        assert!("pending".parse::<LedgerStatus>().is_err());
    }

    #[test]
    fn claim_outcomes_carry_the_ledger_id() {
        let id = Uuid::new_v4();
        match (ClaimOutcome::New { ledger_id: id }) {
            ClaimOutcome::New { ledger_id } => assert_eq!(ledger_id, id),
            _ => panic!("wrong variant"),
        }
        assert_eq!(ClaimOutcome::Duplicate, ClaimOutcome::Duplicate);
    }
}
