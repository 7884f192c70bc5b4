//! Outbound task queue processor
//!
//! Drains the side-effect queue that transition transactions write to:
//! customer emails through the billing email service and invoice records
//! for confirmed payments. A failing task is rescheduled with backoff and
//! abandoned after repeated failures; the subscription state it belongs
//! to is already committed and never revisited from here.

use anyhow::Context;
use billhook_billing::{BillingService, OutboundTask, TaskKind, GRACE_PERIOD};
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tasks claimed per drain cycle.
const BATCH_SIZE: i64 = 25;

/// Claim one batch of due tasks and run them.
pub async fn drain_queue(billing: &BillingService, pool: &PgPool) -> anyhow::Result<()> {
    let tasks = billing.outbound.claim_batch(BATCH_SIZE).await?;
    if tasks.is_empty() {
        return Ok(());
    }

    info!(count = tasks.len(), "Processing outbound tasks");

    let mut done = 0usize;
    let mut failed = 0usize;
    for task in tasks {
        match run_task(billing, pool, &task).await {
            Ok(()) => {
                billing.outbound.mark_done(task.id).await?;
                done += 1;
            }
            Err(e) => {
                billing
                    .outbound
                    .mark_failed(task.id, task.attempt_count, &e.to_string())
                    .await?;
                failed += 1;
            }
        }
    }

    info!(done = done, failed = failed, "Outbound task batch complete");
    Ok(())
}

async fn run_task(
    billing: &BillingService,
    pool: &PgPool,
    task: &OutboundTask,
) -> anyhow::Result<()> {
    match task.kind {
        TaskKind::EmailPaymentFailed => {
            let Some(to) = account_email(pool, task.account_id).await? else {
                warn!(task_id = %task.id, account_id = %task.account_id, "Account email missing; dropping email task");
                return Ok(());
            };
            billing
                .email
                .send_payment_failed(&to, GRACE_PERIOD.whole_days())
                .await?;
        }
        TaskKind::EmailPlanCancelled => {
            let Some(to) = account_email(pool, task.account_id).await? else {
                warn!(task_id = %task.id, account_id = %task.account_id, "Account email missing; dropping email task");
                return Ok(());
            };
            billing.email.send_plan_cancelled(&to).await?;
        }
        TaskKind::EmailPaymentReceipt => {
            let Some(to) = account_email(pool, task.account_id).await? else {
                warn!(task_id = %task.id, account_id = %task.account_id, "Account email missing; dropping email task");
                return Ok(());
            };
            let amount_cents = task.payload.get("amount_cents").and_then(Value::as_i64);
            let currency = task.payload.get("currency").and_then(Value::as_str);
            billing
                .email
                .send_payment_receipt(&to, amount_cents, currency)
                .await?;
        }
        TaskKind::CreateInvoice => {
            let invoice = InvoicePayload::parse(&task.payload)?;
            record_invoice(pool, task, &invoice).await?;
        }
    }
    Ok(())
}

async fn account_email(pool: &PgPool, account_id: Uuid) -> anyhow::Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT email FROM accounts WHERE id = $1")
        .bind(account_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(email,)| email))
}

/// Parsed fields of a `create_invoice` task payload.
#[derive(Debug)]
struct InvoicePayload {
    provider: String,
    payment_ref: String,
    amount_cents: Option<i64>,
    currency: Option<String>,
    paid_at: OffsetDateTime,
}

impl InvoicePayload {
    fn parse(payload: &Value) -> anyhow::Result<Self> {
        let provider = payload
            .get("provider")
            .and_then(Value::as_str)
            .context("invoice task payload missing 'provider'")?
            .to_string();
        let payment_ref = payload
            .get("payment_ref")
            .and_then(Value::as_str)
            .context("invoice task payload missing 'payment_ref'")?
            .to_string();
        let paid_at_ts = payload
            .get("paid_at")
            .and_then(Value::as_i64)
            .context("invoice task payload missing 'paid_at'")?;
        let paid_at = OffsetDateTime::from_unix_timestamp(paid_at_ts)
            .context("invoice task payload 'paid_at' out of range")?;

        Ok(Self {
            provider,
            payment_ref,
            amount_cents: payload.get("amount_cents").and_then(Value::as_i64),
            currency: payload
                .get("currency")
                .and_then(Value::as_str)
                .map(str::to_string),
            paid_at,
        })
    }
}

/// Insert the invoice row for a confirmed payment. The unique key on
/// (provider, payment ref) makes redeliveries and retries a no-op.
async fn record_invoice(
    pool: &PgPool,
    task: &OutboundTask,
    invoice: &InvoicePayload,
) -> anyhow::Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO invoices (account_id, provider, provider_payment_ref,
                              amount_cents, currency, paid_at, provider_event_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (provider, provider_payment_ref) DO NOTHING
        "#,
    )
    .bind(task.account_id)
    .bind(&invoice.provider)
    .bind(&invoice.payment_ref)
    .bind(invoice.amount_cents)
    .bind(&invoice.currency)
    .bind(invoice.paid_at)
    .bind(&task.provider_event_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        debug!(
            payment_ref = %invoice.payment_ref,
            "Invoice record already exists; skipping"
        );
    } else {
        info!(
            account_id = %task.account_id,
            payment_ref = %invoice.payment_ref,
            amount_cents = ?invoice.amount_cents,
            "Invoice recorded"
        );
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_invoice_payload() {
        let payload = json!({
            "provider": "gocardless",
            "payment_ref": "PM00123",
            "amount_cents": 1900,
            "currency": "eur",
            "paid_at": 1_755_000_000,
        });
        let invoice = InvoicePayload::parse(&payload).unwrap();
        assert_eq!(invoice.provider, "gocardless");
        assert_eq!(invoice.payment_ref, "PM00123");
        assert_eq!(invoice.amount_cents, Some(1900));
        assert_eq!(invoice.currency.as_deref(), Some("eur"));
        assert_eq!(invoice.paid_at.unix_timestamp(), 1_755_000_000);
    }

    #[test]
    fn tolerates_missing_amount_and_currency() {
        let payload = json!({
            "provider": "stripe",
            "payment_ref": "in_1PqXYZ",
            "paid_at": 1_755_000_000,
        });
        let invoice = InvoicePayload::parse(&payload).unwrap();
        assert_eq!(invoice.amount_cents, None);
        assert_eq!(invoice.currency, None);
    }

    #[test]
    fn rejects_payload_without_payment_ref() {
        let payload = json!({
            "provider": "stripe",
            "paid_at": 1_755_000_000,
        });
        assert!(InvoicePayload::parse(&payload).is_err());
    }
}
