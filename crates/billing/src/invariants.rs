//! Billing Invariants Module
//!
//! Provides runnable consistency checks for the subscription state engine.
//! These invariants can be run after any webhook replay or on a schedule to
//! ensure the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write
//! 4. **Complete**: Covers the consistency rules the engine relies on

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Account(s) affected
    pub account_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - entitlement or billing state may be wrong
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for duplicate subscription violation
#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    account_id: Uuid,
    sub_count: i64,
}

/// Row type for cached status drift violation
#[derive(Debug, sqlx::FromRow)]
struct StatusDriftRow {
    account_id: Uuid,
    plan_status: Option<String>,
    status: String,
}

/// Row type for grace bookkeeping violation
#[derive(Debug, sqlx::FromRow)]
struct GraceFieldsRow {
    account_id: Uuid,
    status: String,
    first_payment_failure_at: Option<OffsetDateTime>,
    grace_until: Option<OffsetDateTime>,
    payment_retry_count: i32,
}

/// Row type for unaudited transition violation
#[derive(Debug, sqlx::FromRow)]
struct UnauditedTransitionRow {
    account_id: Uuid,
    subscription_id: Uuid,
    status: String,
}

/// Row type for stuck ledger claim violation
#[derive(Debug, sqlx::FromRow)]
struct StuckClaimRow {
    ledger_id: Uuid,
    provider: String,
    external_event_id: String,
    claimed_at: OffsetDateTime,
}

/// Row type for inconsistent terminal mark violation
#[derive(Debug, sqlx::FromRow)]
struct TerminalMarkRow {
    ledger_id: Uuid,
    processing_status: String,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_subscription_per_account().await?);
        violations.extend(self.check_cached_status_matches_subscription().await?);
        violations.extend(self.check_grace_fields_consistent().await?);
        violations.extend(self.check_transitions_audited().await?);
        violations.extend(self.check_no_stuck_ledger_claims().await?);
        violations.extend(self.check_terminal_marks_consistent().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: Exactly one subscription row per account
    ///
    /// The unique constraint should make duplicates impossible; finding one
    /// means the schema or a migration went wrong.
    async fn check_single_subscription_per_account(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT account_id, COUNT(*) as sub_count
            FROM subscriptions
            GROUP BY account_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_subscription_per_account".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Account has {} subscription rows (expected 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Cached account status matches the subscription row
    ///
    /// `accounts.plan_status` is an advisory read model. Drift means a
    /// transition transaction skipped the projection update.
    async fn check_cached_status_matches_subscription(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StatusDriftRow> = sqlx::query_as(
            r#"
            SELECT a.id as account_id, a.plan_status, s.status
            FROM accounts a
            JOIN subscriptions s ON s.account_id = a.id
            WHERE a.plan_status IS DISTINCT FROM s.status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "cached_status_matches_subscription".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Cached plan_status '{}' differs from subscription status '{}'",
                    row.plan_status.as_deref().unwrap_or("(none)"),
                    row.status
                ),
                context: serde_json::json!({
                    "plan_status": row.plan_status,
                    "subscription_status": row.status,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 3: Grace bookkeeping matches subscription status
    ///
    /// A `past_due` subscription must carry a grace deadline, and an
    /// `active` one must not carry failure markers.
    async fn check_grace_fields_consistent(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<GraceFieldsRow> = sqlx::query_as(
            r#"
            SELECT
                a.id as account_id,
                s.status,
                a.first_payment_failure_at,
                a.grace_until,
                a.payment_retry_count
            FROM accounts a
            JOIN subscriptions s ON s.account_id = a.id
            WHERE (s.status = 'past_due' AND (a.grace_until IS NULL OR a.first_payment_failure_at IS NULL))
               OR (s.status = 'active' AND (a.grace_until IS NOT NULL
                                            OR a.first_payment_failure_at IS NOT NULL
                                            OR a.payment_retry_count <> 0))
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "grace_fields_consistent".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Subscription status '{}' disagrees with payment-failure bookkeeping",
                    row.status
                ),
                context: serde_json::json!({
                    "status": row.status,
                    "first_payment_failure_at": row.first_payment_failure_at.map(|t| t.unix_timestamp()),
                    "grace_until": row.grace_until.map(|t| t.unix_timestamp()),
                    "payment_retry_count": row.payment_retry_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Every status away from `pending` has an audit trail
    ///
    /// A subscription can only leave its creation status through the
    /// engine, and the engine writes an audit row for each real change.
    async fn check_transitions_audited(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnauditedTransitionRow> = sqlx::query_as(
            r#"
            SELECT s.account_id, s.id as subscription_id, s.status
            FROM subscriptions s
            WHERE s.status != 'pending'
              AND NOT EXISTS (
                  SELECT 1 FROM plan_status_events e
                  WHERE e.account_id = s.account_id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "transitions_audited".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Subscription reached status '{}' with no audit events",
                    row.status
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: No ledger claims stuck in `received`
    ///
    /// Claims older than an hour mean a handler crashed mid-transaction
    /// and nothing has retried the event since.
    async fn check_no_stuck_ledger_claims(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckClaimRow> = sqlx::query_as(
            r#"
            SELECT id as ledger_id, provider, external_event_id, claimed_at
            FROM webhook_log
            WHERE processing_status = 'received'
              AND claimed_at < NOW() - INTERVAL '1 hour'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_ledger_claims".to_string(),
                account_ids: vec![],
                description: format!(
                    "Ledger entry for {} event '{}' has been claimed for over an hour",
                    row.provider, row.external_event_id
                ),
                context: serde_json::json!({
                    "ledger_id": row.ledger_id,
                    "claimed_at": row.claimed_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: Terminal ledger statuses carry a processed timestamp
    async fn check_terminal_marks_consistent(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TerminalMarkRow> = sqlx::query_as(
            r#"
            SELECT id as ledger_id, processing_status
            FROM webhook_log
            WHERE processing_status IN ('processed', 'unmatched', 'duplicate')
              AND processed_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "terminal_marks_consistent".to_string(),
                account_ids: vec![],
                description: format!(
                    "Ledger entry marked '{}' without a processed timestamp",
                    row.processing_status
                ),
                context: serde_json::json!({
                    "ledger_id": row.ledger_id,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_subscription_per_account" => self.check_single_subscription_per_account().await,
            "cached_status_matches_subscription" => {
                self.check_cached_status_matches_subscription().await
            }
            "grace_fields_consistent" => self.check_grace_fields_consistent().await,
            "transitions_audited" => self.check_transitions_audited().await,
            "no_stuck_ledger_claims" => self.check_no_stuck_ledger_claims().await,
            "terminal_marks_consistent" => self.check_terminal_marks_consistent().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_subscription_per_account",
            "cached_status_matches_subscription",
            "grace_fields_consistent",
            "transitions_audited",
            "no_stuck_ledger_claims",
            "terminal_marks_consistent",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"single_subscription_per_account"));
        assert!(checks.contains(&"grace_fields_consistent"));
    }
}
