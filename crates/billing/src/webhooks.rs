//! Webhook intake pipeline
//!
//! One path for both providers: verify the signature against the raw body,
//! parse the envelope, then run each event through claim, resolve, and
//! apply. Every event the pipeline accepts ends in a terminal ledger
//! status; storage failures bubble up as retryable so the provider
//! redelivers and the claim logic absorbs the repeat.

use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;

use billhook_shared::PaymentProvider;

use crate::config::BillingConfig;
use crate::engine::{TransitionEngine, TransitionOutcome};
use crate::error::{BillingError, BillingResult};
use crate::event::{
    gocardless_category, parse_events, stripe_category, EventCategory, ProviderEvent,
};
use crate::ledger::{ClaimOutcome, EventLedger, LedgerEntry};
use crate::resolver::AccountResolver;
use crate::signature::SignatureVerifier;

/// Terminal disposition of one delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// Ran the transition transaction (status change or idempotent no-op).
    Applied,
    /// Redelivery of an event that already settled.
    Duplicate,
    /// Verified and recorded, but no owning account was found.
    Unmatched,
    /// Rejected by the stale guard.
    Stale,
    /// Event type outside the category model; acknowledged only.
    Ignored,
}

impl EventDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventDisposition::Applied => "applied",
            EventDisposition::Duplicate => "duplicate",
            EventDisposition::Unmatched => "unmatched",
            EventDisposition::Stale => "stale",
            EventDisposition::Ignored => "ignored",
        }
    }
}

/// Per-delivery summary, accumulated over a provider's batch.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DeliveryReport {
    pub received: usize,
    pub applied: usize,
    pub duplicate: usize,
    pub unmatched: usize,
    pub stale: usize,
    pub ignored: usize,
}

impl DeliveryReport {
    fn bump(&mut self, disposition: EventDisposition) {
        match disposition {
            EventDisposition::Applied => self.applied += 1,
            EventDisposition::Duplicate => self.duplicate += 1,
            EventDisposition::Unmatched => self.unmatched += 1,
            EventDisposition::Stale => self.stale += 1,
            EventDisposition::Ignored => self.ignored += 1,
        }
    }
}

/// Outcome of one unmatched-replay sweep.
#[derive(Debug, Default, Clone, Serialize)]
pub struct UnmatchedSweepReport {
    pub examined: usize,
    pub resolved: usize,
    pub still_unmatched: usize,
    pub skipped: usize,
}

/// Webhook handler for both payment providers
#[derive(Clone)]
pub struct WebhookHandler {
    pool: PgPool,
    verifier: SignatureVerifier,
    ledger: EventLedger,
    resolver: AccountResolver,
    engine: TransitionEngine,
}

impl WebhookHandler {
    pub fn new(config: &BillingConfig, pool: PgPool) -> Self {
        Self {
            verifier: SignatureVerifier::new(config),
            ledger: EventLedger::new(pool.clone()),
            resolver: AccountResolver::new(pool.clone()),
            engine: TransitionEngine::new(pool.clone()),
            pool,
        }
    }

    /// Entry point for one provider delivery: the raw body exactly as
    /// received, plus the provider's signature header value.
    pub async fn handle_delivery(
        &self,
        provider: PaymentProvider,
        payload: &str,
        signature: &str,
    ) -> BillingResult<DeliveryReport> {
        if !self.verifier.verify(provider, payload, signature) {
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let events = parse_events(provider, payload)?;

        let mut report = DeliveryReport {
            received: events.len(),
            ..DeliveryReport::default()
        };
        for event in &events {
            let disposition = self.process_event(event).await?;
            report.bump(disposition);
        }

        tracing::info!(
            provider = %provider,
            received = report.received,
            applied = report.applied,
            duplicate = report.duplicate,
            unmatched = report.unmatched,
            stale = report.stale,
            ignored = report.ignored,
            "Webhook delivery processed"
        );
        Ok(report)
    }

    /// Claim, resolve, apply. Every path out of here leaves the ledger row
    /// terminal, except a lost claim race, which writes nothing.
    async fn process_event(&self, event: &ProviderEvent) -> BillingResult<EventDisposition> {
        let ledger_id = match self.ledger.claim(event).await? {
            ClaimOutcome::New { ledger_id } => ledger_id,
            ClaimOutcome::Retry { ledger_id } => {
                tracing::info!(
                    provider = %event.provider,
                    event_id = %event.external_id,
                    "Re-claimed a stuck ledger entry; retrying the event"
                );
                ledger_id
            }
            ClaimOutcome::Duplicate => {
                tracing::info!(
                    provider = %event.provider,
                    event_id = %event.external_id,
                    "Duplicate delivery; already settled or in flight"
                );
                return Ok(EventDisposition::Duplicate);
            }
        };

        let Some(category) = event.category else {
            EventLedger::mark_processed(
                &self.pool,
                ledger_id,
                Some(format!("ignored: no handling for '{}'", event.event_type)),
            )
            .await?;
            tracing::debug!(
                provider = %event.provider,
                event_type = %event.event_type,
                "Event type not handled; acknowledged"
            );
            return Ok(EventDisposition::Ignored);
        };

        let Some((account_id, path)) = self.resolver.resolve(event).await? else {
            EventLedger::mark_unmatched(
                &self.pool,
                ledger_id,
                Some("no account matched event references".to_string()),
            )
            .await?;
            tracing::warn!(
                provider = %event.provider,
                event_id = %event.external_id,
                event_type = %event.event_type,
                "Verified event matched no account; stored for later resolution"
            );
            return Ok(EventDisposition::Unmatched);
        };

        tracing::debug!(
            account_id = %account_id,
            event_id = %event.external_id,
            resolved_via = path.as_str(),
            "Event resolved to account"
        );

        let outcome = self
            .engine
            .apply_event(account_id, category, event, ledger_id)
            .await?;
        Ok(match outcome {
            TransitionOutcome::Applied { .. } | TransitionOutcome::NoChange { .. } => {
                EventDisposition::Applied
            }
            TransitionOutcome::Stale { .. } => EventDisposition::Stale,
            TransitionOutcome::AlreadyApplied => EventDisposition::Duplicate,
        })
    }

    /// Retry recently unmatched ledger entries. Runs from the worker after
    /// account data may have changed (a customer ref attached, say).
    /// Entries are rebuilt from the stored summary; anything without
    /// enough context to replay is counted and left alone.
    pub async fn resolve_unmatched(
        &self,
        lookback_hours: i32,
        limit: i64,
    ) -> BillingResult<UnmatchedSweepReport> {
        let entries = self.ledger.recent_unmatched(lookback_hours, limit).await?;
        let mut report = UnmatchedSweepReport {
            examined: entries.len(),
            ..UnmatchedSweepReport::default()
        };

        for entry in entries {
            let Some(event) = rebuild_event(&entry) else {
                report.skipped += 1;
                continue;
            };
            let Some(category) = event.category else {
                report.skipped += 1;
                continue;
            };

            match self.resolver.resolve(&event).await {
                Ok(Some((account_id, path))) => {
                    match self
                        .engine
                        .apply_event(account_id, category, &event, entry.id)
                        .await
                    {
                        Ok(_) => {
                            report.resolved += 1;
                            tracing::info!(
                                account_id = %account_id,
                                event_id = %event.external_id,
                                resolved_via = path.as_str(),
                                "Previously unmatched event resolved and applied"
                            );
                        }
                        Err(e) => {
                            tracing::error!(
                                event_id = %event.external_id,
                                error = %e,
                                "Replay of unmatched event failed"
                            );
                            report.skipped += 1;
                        }
                    }
                }
                Ok(None) => report.still_unmatched += 1,
                Err(e) => {
                    tracing::error!(
                        event_id = %event.external_id,
                        error = %e,
                        "Resolution retry failed"
                    );
                    report.skipped += 1;
                }
            }
        }

        if report.resolved > 0 {
            tracing::info!(
                examined = report.examined,
                resolved = report.resolved,
                still_unmatched = report.still_unmatched,
                "Unmatched sweep resolved events"
            );
        }
        Ok(report)
    }
}

/// Reconstruct a normalized event from its ledger row. The stored summary
/// keeps exactly the reference fields resolution and application need. A
/// row without an event timestamp cannot face the stale guard and is not
/// replayable.
fn rebuild_event(entry: &LedgerEntry) -> Option<ProviderEvent> {
    let occurred_at = entry.event_occurred_at?;
    let summary = &entry.summary;

    let category = match entry.provider {
        PaymentProvider::Stripe => stripe_category(
            &entry.event_type,
            summary.get("status").and_then(Value::as_str),
        ),
        PaymentProvider::GoCardless => {
            let (resource_type, action) = entry.event_type.split_once('.')?;
            gocardless_category(resource_type, action)
        }
    };

    Some(ProviderEvent {
        provider: entry.provider,
        external_id: entry.external_event_id.clone(),
        event_type: entry.event_type.clone(),
        category,
        occurred_at,
        account_hint: None,
        customer_ref: summary_field(summary, "customer"),
        subscription_ref: summary_field(summary, "subscription"),
        mandate_ref: summary_field(summary, "mandate"),
        payment_ref: summary_field(summary, "payment"),
        amount_cents: summary.get("amount_paid").and_then(Value::as_i64),
        currency: summary_field(summary, "currency"),
        summary: entry.summary.clone(),
    })
}

fn summary_field(summary: &Value, key: &str) -> Option<String> {
    summary.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ledger::LedgerStatus;
    use serde_json::json;
    use time::macros::datetime;
    use uuid::Uuid;

    fn unmatched_entry(
        provider: PaymentProvider,
        event_type: &str,
        summary: Value,
    ) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::new_v4(),
            provider,
            external_event_id: "EVT1".to_string(),
            event_type: event_type.to_string(),
            processing_status: LedgerStatus::Unmatched,
            detail: None,
            summary,
            event_occurred_at: Some(datetime!(2024-11-14 16:00 UTC)),
            received_at: datetime!(2024-11-14 16:00:01 UTC),
            processed_at: Some(datetime!(2024-11-14 16:00:01 UTC)),
        }
    }

    #[test]
    fn rebuilds_gocardless_event_from_ledger_row() {
        let entry = unmatched_entry(
            PaymentProvider::GoCardless,
            "payments.confirmed",
            json!({
                "resource_type": "payments",
                "action": "confirmed",
                "mandate": "MD1",
                "subscription": "SB1",
                "customer": "CU1",
                "payment": "PM1",
            }),
        );

        let event = rebuild_event(&entry).unwrap();
        assert_eq!(event.category, Some(EventCategory::PaymentConfirmed));
        assert_eq!(event.external_id, "EVT1");
        assert_eq!(event.customer_ref.as_deref(), Some("CU1"));
        assert_eq!(event.subscription_ref.as_deref(), Some("SB1"));
        assert_eq!(event.payment_ref.as_deref(), Some("PM1"));
        assert_eq!(event.occurred_at, datetime!(2024-11-14 16:00 UTC));
    }

    #[test]
    fn rebuilds_stripe_event_using_stored_status_hint() {
        let entry = unmatched_entry(
            PaymentProvider::Stripe,
            "customer.subscription.updated",
            json!({
                "object": "subscription",
                "status": "past_due",
                "customer": "cus_1",
                "subscription": "sub_1",
            }),
        );

        let event = rebuild_event(&entry).unwrap();
        assert_eq!(event.category, Some(EventCategory::PaymentFailed));
        assert_eq!(event.subscription_ref.as_deref(), Some("sub_1"));
    }

    #[test]
    fn entry_without_timestamp_is_not_replayable() {
        let mut entry = unmatched_entry(PaymentProvider::Stripe, "invoice.paid", json!({}));
        entry.event_occurred_at = None;
        assert!(rebuild_event(&entry).is_none());
    }

    #[test]
    fn disposition_names_are_stable() {
        assert_eq!(EventDisposition::Applied.as_str(), "applied");
        assert_eq!(EventDisposition::Duplicate.as_str(), "duplicate");
        assert_eq!(EventDisposition::Unmatched.as_str(), "unmatched");
        assert_eq!(EventDisposition::Stale.as_str(), "stale");
        assert_eq!(EventDisposition::Ignored.as_str(), "ignored");
    }

    #[test]
    fn delivery_report_accumulates_dispositions() {
        let mut report = DeliveryReport::default();
        report.bump(EventDisposition::Applied);
        report.bump(EventDisposition::Applied);
        report.bump(EventDisposition::Unmatched);
        report.bump(EventDisposition::Stale);
        assert_eq!(report.applied, 2);
        assert_eq!(report.unmatched, 1);
        assert_eq!(report.stale, 1);
        assert_eq!(report.duplicate, 0);
    }
}
