//! Subscription state machine
//!
//! Applies categorized provider events to the one subscription row each
//! account owns. Ordering authority is the provider-assigned event
//! timestamp, not arrival order: the stale guard rejects anything at or
//! before the last applied timestamp, so a delayed "payment confirmed" can
//! never overwrite a later "payment failed".
//!
//! ## Design Principles
//!
//! - One transaction per applied event: subscription update, audit append,
//!   account projection, side-effect enqueue, and the ledger's terminal
//!   mark commit together or not at all.
//! - Transitions are idempotent in effect: re-applying a category that
//!   yields the current status advances the last-applied marker without
//!   writing an audit row.
//! - The row is created lazily (born `pending`) the first time an account
//!   needs one, whether through plan selection or a provider event.

use serde_json::json;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use billhook_shared::{BillingCadence, PaymentProvider, SubscriptionStatus};

use crate::audit::{AuditRecorder, TransitionRecord};
use crate::error::{BillingError, BillingResult};
use crate::event::{EventCategory, ProviderEvent};
use crate::ledger::EventLedger;
use crate::outbound::{OutboundQueue, TaskKind};

/// Grace window granted at the first failed payment.
pub const GRACE_PERIOD: Duration = Duration::days(7);

/// Reason code for worker-driven cancellation after the grace window.
pub const REASON_GRACE_EXPIRED: &str = "grace_period_expired";

/// One account's subscription row.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub account_id: Uuid,
    pub status: SubscriptionStatus,
    pub provider: Option<PaymentProvider>,
    pub provider_mandate_ref: Option<String>,
    pub provider_customer_ref: Option<String>,
    pub provider_subscription_ref: Option<String>,
    pub plan_code: Option<String>,
    pub cadence: BillingCadence,
    pub last_event_at: Option<OffsetDateTime>,
    pub last_event_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl FromRow<'_, PgRow> for Subscription {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let provider: Option<String> = row.try_get("provider")?;
        let cadence: String = row.try_get("cadence")?;
        Ok(Subscription {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            status: status
                .parse()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            provider: provider
                .map(|s| s.parse())
                .transpose()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            provider_mandate_ref: row.try_get("provider_mandate_ref")?,
            provider_customer_ref: row.try_get("provider_customer_ref")?,
            provider_subscription_ref: row.try_get("provider_subscription_ref")?,
            plan_code: row.try_get("plan_code")?,
            cadence: cadence
                .parse()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            last_event_at: row.try_get("last_event_at")?,
            last_event_id: row.try_get("last_event_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Status changed; one audit row written, side effects enqueued.
    Applied {
        old: Option<SubscriptionStatus>,
        new: SubscriptionStatus,
    },
    /// Event applied but the status it maps to is already current; marker
    /// advanced, no audit row.
    NoChange { status: SubscriptionStatus },
    /// Rejected by the stale guard; no subscription write.
    Stale {
        last_applied: OffsetDateTime,
        event_at: OffsetDateTime,
    },
    /// Stored last-applied id equals this event's id: a previous attempt
    /// applied it and crashed before the terminal ledger mark.
    AlreadyApplied,
}

/// Status a category drives the subscription toward, given where it is now.
pub fn next_status(current: SubscriptionStatus, category: EventCategory) -> SubscriptionStatus {
    match category {
        EventCategory::AuthorizationActivated | EventCategory::PaymentConfirmed => {
            SubscriptionStatus::Active
        }
        EventCategory::PaymentFailed => SubscriptionStatus::PastDue,
        EventCategory::SubscriptionCancelled => SubscriptionStatus::Cancelled,
        EventCategory::SubscriptionLinked => current,
    }
}

/// Stale-event guard. Equal timestamps lose: only strictly newer events
/// apply. With no prior timestamp nothing is stale.
pub fn is_stale(last_applied: Option<OffsetDateTime>, event_at: OffsetDateTime) -> bool {
    match last_applied {
        Some(last) => event_at <= last,
        None => false,
    }
}

#[derive(Clone)]
pub struct TransitionEngine {
    pool: PgPool,
}

impl TransitionEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply one resolved, categorized event. Runs the full transition
    /// transaction and leaves the ledger row terminally marked.
    pub async fn apply_event(
        &self,
        account_id: Uuid,
        category: EventCategory,
        event: &ProviderEvent,
        ledger_id: Uuid,
    ) -> BillingResult<TransitionOutcome> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let (subscription, was_created) = self.lock_or_create(&mut tx, account_id).await?;

        // Re-application check before staleness: the same event id stored
        // as last-applied means a prior attempt committed the transition
        // and crashed before marking its ledger row.
        if subscription.last_event_id.as_deref() == Some(event.external_id.as_str()) {
            EventLedger::mark_duplicate(
                &mut *tx,
                ledger_id,
                Some("event already applied by a previous attempt".to_string()),
            )
            .await?;
            tx.commit().await?;
            tracing::info!(
                account_id = %account_id,
                event_id = %event.external_id,
                "Event was already applied; ledger marked duplicate"
            );
            return Ok(TransitionOutcome::AlreadyApplied);
        }

        if let Some(last_applied) = subscription.last_event_at {
            if is_stale(Some(last_applied), event.occurred_at) {
                EventLedger::mark_processed(
                    &mut *tx,
                    ledger_id,
                    Some(format!(
                        "stale: event_at={} last_applied={}",
                        event.occurred_at, last_applied
                    )),
                )
                .await?;
                tx.commit().await?;
                tracing::warn!(
                    account_id = %account_id,
                    event_id = %event.external_id,
                    event_at = %event.occurred_at,
                    last_applied = %last_applied,
                    "Stale event rejected; subscription state unchanged"
                );
                return Ok(TransitionOutcome::Stale {
                    last_applied,
                    event_at: event.occurred_at,
                });
            }
        }

        let current = subscription.status;
        let old_status = if was_created { None } else { Some(current) };
        let new_status = next_status(current, category);
        let status_changed = new_status != current;

        sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = $2,
                provider = $3,
                provider_mandate_ref = COALESCE($4, provider_mandate_ref),
                provider_customer_ref = COALESCE($5, provider_customer_ref),
                provider_subscription_ref = COALESCE($6, provider_subscription_ref),
                last_event_at = $7,
                last_event_id = $8,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(new_status.as_str())
        .bind(event.provider.as_str())
        .bind(&event.mandate_ref)
        .bind(&event.customer_ref)
        .bind(&event.subscription_ref)
        .bind(event.occurred_at)
        .bind(&event.external_id)
        .execute(&mut *tx)
        .await?;

        self.update_account_projection(&mut tx, account_id, category, event, new_status, now)
            .await?;

        if status_changed {
            AuditRecorder::record(
                &mut *tx,
                &TransitionRecord {
                    account_id,
                    subscription_id: Some(subscription.id),
                    old_status,
                    new_status,
                    reason_code: category.reason_code(),
                    provider: Some(event.provider),
                    provider_event_id: Some(&event.external_id),
                    provider_event_type: Some(&event.event_type),
                    metadata: json!({
                        "payment_ref": event.payment_ref,
                        "amount_cents": event.amount_cents,
                    }),
                },
            )
            .await?;
        }

        self.enqueue_side_effects(&mut tx, account_id, category, event, new_status, status_changed)
            .await?;

        EventLedger::mark_processed(
            &mut *tx,
            ledger_id,
            if status_changed {
                None
            } else {
                Some("no-op: status unchanged, marker advanced".to_string())
            },
        )
        .await?;

        tx.commit().await?;

        if status_changed {
            tracing::info!(
                account_id = %account_id,
                event_id = %event.external_id,
                event_type = %event.event_type,
                old_status = old_status.map(|s| s.as_str()).unwrap_or("none"),
                new_status = %new_status,
                "Subscription transition applied"
            );
            Ok(TransitionOutcome::Applied {
                old: old_status,
                new: new_status,
            })
        } else {
            tracing::info!(
                account_id = %account_id,
                event_id = %event.external_id,
                status = %new_status,
                "Event applied with no status change"
            );
            Ok(TransitionOutcome::NoChange { status: new_status })
        }
    }

    /// Lock the account's subscription row, creating it `pending` if this
    /// is the account's first contact with billing. The insert honors the
    /// unique constraint, so a concurrent creator wins cleanly.
    async fn lock_or_create(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
    ) -> BillingResult<(Subscription, bool)> {
        if let Some(subscription) = Self::select_for_update(tx, account_id).await? {
            return Ok((subscription, false));
        }

        let inserted: Option<Subscription> = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (account_id, status)
            VALUES ($1, 'pending')
            ON CONFLICT (account_id) DO NOTHING
            RETURNING id, account_id, status, provider, provider_mandate_ref,
                      provider_customer_ref, provider_subscription_ref, plan_code,
                      cadence, last_event_at, last_event_id, created_at, updated_at
            "#,
        )
        .bind(account_id)
        .fetch_optional(&mut **tx)
        .await?;

        match inserted {
            Some(subscription) => Ok((subscription, true)),
            None => {
                // Lost the creation race; the row exists now.
                let subscription = Self::select_for_update(tx, account_id)
                    .await?
                    .ok_or(BillingError::AccountNotFound(account_id))?;
                Ok((subscription, false))
            }
        }
    }

    async fn select_for_update(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let subscription = sqlx::query_as(
            r#"
            SELECT id, account_id, status, provider, provider_mandate_ref,
                   provider_customer_ref, provider_subscription_ref, plan_code,
                   cadence, last_event_at, last_event_id, created_at, updated_at
            FROM subscriptions
            WHERE account_id = $1
            FOR UPDATE
            "#,
        )
        .bind(account_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(subscription)
    }

    /// Account-side bookkeeping inside the transition transaction: the
    /// advisory `plan_status` projection plus payment-failure fields.
    async fn update_account_projection(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
        category: EventCategory,
        event: &ProviderEvent,
        new_status: SubscriptionStatus,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        match category {
            EventCategory::PaymentFailed => {
                // First failure starts the grace window; repeats only bump
                // the retry counter. All right-hand sides read pre-update
                // values, so the CASE sees the old failure timestamp.
                sqlx::query(
                    r#"
                    UPDATE accounts SET
                        payment_retry_count = CASE
                            WHEN first_payment_failure_at IS NULL THEN 0
                            ELSE payment_retry_count + 1
                        END,
                        first_payment_failure_at = COALESCE(first_payment_failure_at, $2),
                        grace_until = COALESCE(grace_until, $3),
                        plan_status = $4,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(account_id)
                .bind(now)
                .bind(now + GRACE_PERIOD)
                .bind(new_status.as_str())
                .execute(&mut **tx)
                .await?;
            }
            EventCategory::PaymentConfirmed => {
                sqlx::query(
                    r#"
                    UPDATE accounts SET
                        first_payment_failure_at = NULL,
                        payment_retry_count = 0,
                        grace_until = NULL,
                        plan_status = $2,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(account_id)
                .bind(new_status.as_str())
                .execute(&mut **tx)
                .await?;
            }
            EventCategory::SubscriptionLinked => {
                sqlx::query(
                    r#"
                    UPDATE accounts SET
                        provider_customer_ref = COALESCE($2, provider_customer_ref),
                        plan_status = $3,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(account_id)
                .bind(&event.customer_ref)
                .bind(new_status.as_str())
                .execute(&mut **tx)
                .await?;
            }
            EventCategory::AuthorizationActivated | EventCategory::SubscriptionCancelled => {
                sqlx::query(
                    r#"
                    UPDATE accounts SET plan_status = $2, updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(account_id)
                .bind(new_status.as_str())
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }

    /// Queue the side effects this event warrants. Rows land in the same
    /// transaction; the worker dispatches them after commit.
    async fn enqueue_side_effects(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
        category: EventCategory,
        event: &ProviderEvent,
        new_status: SubscriptionStatus,
        status_changed: bool,
    ) -> BillingResult<()> {
        match category {
            EventCategory::PaymentConfirmed => {
                if let Some(payment_ref) = &event.payment_ref {
                    OutboundQueue::enqueue(
                        &mut **tx,
                        TaskKind::CreateInvoice,
                        account_id,
                        Some(&event.external_id),
                        json!({
                            "provider": event.provider.as_str(),
                            "payment_ref": payment_ref,
                            "amount_cents": event.amount_cents,
                            "currency": event.currency,
                            "paid_at": event.occurred_at.unix_timestamp(),
                        }),
                    )
                    .await?;
                } else {
                    tracing::warn!(
                        account_id = %account_id,
                        event_id = %event.external_id,
                        "Payment confirmation without a payment reference; no invoice record queued"
                    );
                }
                OutboundQueue::enqueue(
                    &mut **tx,
                    TaskKind::EmailPaymentReceipt,
                    account_id,
                    Some(&event.external_id),
                    json!({ "amount_cents": event.amount_cents, "currency": event.currency }),
                )
                .await?;
            }
            EventCategory::PaymentFailed => {
                OutboundQueue::enqueue(
                    &mut **tx,
                    TaskKind::EmailPaymentFailed,
                    account_id,
                    Some(&event.external_id),
                    json!({}),
                )
                .await?;
            }
            _ => {}
        }

        if status_changed && new_status == SubscriptionStatus::Cancelled {
            OutboundQueue::enqueue(
                &mut **tx,
                TaskKind::EmailPlanCancelled,
                account_id,
                Some(&event.external_id),
                json!({}),
            )
            .await?;
        }

        Ok(())
    }

    /// Current subscription row for an account.
    pub async fn get_subscription(&self, account_id: Uuid) -> BillingResult<Option<Subscription>> {
        let subscription = sqlx::query_as(
            r#"
            SELECT id, account_id, status, provider, provider_mandate_ref,
                   provider_customer_ref, provider_subscription_ref, plan_code,
                   cadence, last_event_at, last_event_id, created_at, updated_at
            FROM subscriptions
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(subscription)
    }

    /// Lazily create (or re-point) the account's subscription at a plan.
    /// Only `pending` and `cancelled` rows accept a plan change here; live
    /// subscriptions change plans through the provider, not this path.
    pub async fn select_plan(
        &self,
        account_id: Uuid,
        plan_code: &str,
    ) -> BillingResult<Subscription> {
        let plan: Option<(String,)> =
            sqlx::query_as("SELECT cadence FROM plans WHERE code = $1")
                .bind(plan_code)
                .fetch_optional(&self.pool)
                .await?;
        let Some((cadence,)) = plan else {
            return Err(BillingError::UnknownPlan(plan_code.to_string()));
        };

        let account: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        if account.is_none() {
            return Err(BillingError::AccountNotFound(account_id));
        }

        let mut tx = self.pool.begin().await?;

        let updated: Option<Subscription> = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (account_id, status, plan_code, cadence)
            VALUES ($1, 'pending', $2, $3)
            ON CONFLICT (account_id) DO UPDATE SET
                plan_code = $2,
                cadence = $3,
                updated_at = NOW()
            WHERE subscriptions.status IN ('pending', 'cancelled')
            RETURNING id, account_id, status, provider, provider_mandate_ref,
                      provider_customer_ref, provider_subscription_ref, plan_code,
                      cadence, last_event_at, last_event_id, created_at, updated_at
            "#,
        )
        .bind(account_id)
        .bind(plan_code)
        .bind(&cadence)
        .fetch_optional(&mut *tx)
        .await?;

        let subscription = match updated {
            Some(subscription) => {
                sqlx::query("UPDATE accounts SET plan_code = $2, updated_at = NOW() WHERE id = $1")
                    .bind(account_id)
                    .bind(plan_code)
                    .execute(&mut *tx)
                    .await?;
                subscription
            }
            None => {
                // Live subscription; plan selection is a no-op.
                tracing::info!(
                    account_id = %account_id,
                    plan_code = %plan_code,
                    "Plan selection ignored for live subscription"
                );
                Self::select_for_update(&mut tx, account_id)
                    .await?
                    .ok_or(BillingError::AccountNotFound(account_id))?
            }
        };

        tx.commit().await?;
        Ok(subscription)
    }

    /// Cancel `past_due` subscriptions whose grace window lapsed. Each one
    /// goes through the same transaction shape as a webhook cancellation.
    pub async fn enforce_grace_expiry(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let expired: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT s.account_id
            FROM subscriptions s
            JOIN accounts a ON a.id = s.account_id
            WHERE s.status = 'past_due'
              AND a.grace_until IS NOT NULL
              AND a.grace_until < $1
            ORDER BY a.grace_until
            LIMIT 100
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut cancelled = 0u64;
        for (account_id,) in expired {
            match self.cancel_for_grace_expiry(account_id).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        account_id = %account_id,
                        error = %e,
                        "Grace-expiry cancellation failed"
                    );
                }
            }
        }
        Ok(cancelled)
    }

    async fn cancel_for_grace_expiry(&self, account_id: Uuid) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        let Some(subscription) = Self::select_for_update(&mut tx, account_id).await? else {
            return Ok(false);
        };
        // Raced with an incoming payment; leave it alone.
        if subscription.status != SubscriptionStatus::PastDue {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE subscriptions SET status = 'cancelled', updated_at = NOW() WHERE id = $1",
        )
        .bind(subscription.id)
        .execute(&mut *tx)
        .await?;

        let grace_until: Option<(Option<OffsetDateTime>,)> =
            sqlx::query_as("SELECT grace_until FROM accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&mut *tx)
                .await?;

        AuditRecorder::record(
            &mut *tx,
            &TransitionRecord {
                account_id,
                subscription_id: Some(subscription.id),
                old_status: Some(SubscriptionStatus::PastDue),
                new_status: SubscriptionStatus::Cancelled,
                reason_code: REASON_GRACE_EXPIRED,
                provider: subscription.provider,
                provider_event_id: None,
                provider_event_type: None,
                metadata: json!({
                    "grace_until": grace_until
                        .and_then(|(g,)| g)
                        .map(|g| g.unix_timestamp()),
                }),
            },
        )
        .await?;

        sqlx::query(
            "UPDATE accounts SET plan_status = 'cancelled', updated_at = NOW() WHERE id = $1",
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await?;

        OutboundQueue::enqueue(
            &mut *tx,
            TaskKind::EmailPlanCancelled,
            account_id,
            None,
            json!({ "reason": REASON_GRACE_EXPIRED }),
        )
        .await?;

        tx.commit().await?;
        tracing::info!(
            account_id = %account_id,
            "Subscription cancelled after grace window expiry"
        );
        Ok(true)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use time::macros::datetime;

    // =========================================================================
    // Status machine
    // =========================================================================

    #[test]
    fn activation_and_payment_drive_to_active() {
        for current in SubscriptionStatus::ALL {
            assert_eq!(
                next_status(current, EventCategory::AuthorizationActivated),
                SubscriptionStatus::Active
            );
            assert_eq!(
                next_status(current, EventCategory::PaymentConfirmed),
                SubscriptionStatus::Active
            );
        }
    }

    #[test]
    fn failure_drives_to_past_due_and_cancellation_to_cancelled() {
        for current in SubscriptionStatus::ALL {
            assert_eq!(
                next_status(current, EventCategory::PaymentFailed),
                SubscriptionStatus::PastDue
            );
            assert_eq!(
                next_status(current, EventCategory::SubscriptionCancelled),
                SubscriptionStatus::Cancelled
            );
        }
    }

    #[test]
    fn linking_never_changes_status() {
        for current in SubscriptionStatus::ALL {
            assert_eq!(next_status(current, EventCategory::SubscriptionLinked), current);
        }
    }

    // =========================================================================
    // Stale guard
    // =========================================================================

    #[test]
    fn nothing_is_stale_without_a_prior_timestamp() {
        let event_at = datetime!(2024-11-14 16:00 UTC);
        assert!(!is_stale(None, event_at));
    }

    #[test]
    fn equal_timestamp_is_stale() {
        let ts = datetime!(2024-11-14 16:00 UTC);
        assert!(is_stale(Some(ts), ts));
    }

    #[test]
    fn older_event_is_stale_newer_is_not() {
        let last = datetime!(2024-11-14 16:00 UTC);
        assert!(is_stale(Some(last), last - Duration::seconds(1)));
        assert!(!is_stale(Some(last), last + Duration::seconds(1)));
    }

    // =========================================================================
    // Grace arithmetic
    // =========================================================================

    #[test]
    fn grace_period_is_exactly_seven_days_in_milliseconds() {
        assert_eq!(GRACE_PERIOD.whole_milliseconds(), 604_800_000);
    }

    #[test]
    fn grace_until_lands_seven_days_after_processing_time() {
        let now = datetime!(2024-11-14 16:00 UTC);
        let grace_until = now + GRACE_PERIOD;
        assert_eq!((grace_until - now).whole_milliseconds(), 604_800_000);
        assert_eq!(grace_until, datetime!(2024-11-21 16:00 UTC));
    }
}
