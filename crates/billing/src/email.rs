//! Customer notification emails
//!
//! Delivered through the Resend HTTP API. Without a RESEND_API_KEY the
//! service runs disabled and sends become logged no-ops, so local stacks
//! work without an email account.

use reqwest::Client;
use serde::Serialize;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

#[derive(Clone)]
pub struct BillingEmailService {
    client: Client,
    api_key: Option<String>,
    from: String,
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

impl BillingEmailService {
    pub fn new(config: &BillingConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: config.resend_api_key.clone(),
            from: config.email_from.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    pub async fn send_payment_failed(&self, to: &str, grace_days: i64) -> BillingResult<()> {
        let subject = "Payment failed for your subscription";
        let html = format!(
            "<p>We could not collect your latest subscription payment.</p>\
             <p>We will retry automatically. Your plan stays usable for {grace_days} days \
             while we do; please check your payment method in the meantime.</p>"
        );
        self.send(to, subject, &html).await
    }

    pub async fn send_plan_cancelled(&self, to: &str) -> BillingResult<()> {
        let subject = "Your subscription has been cancelled";
        let html = "<p>Your subscription is now cancelled and will not renew.</p>\
             <p>You can pick a plan again at any time to restart it.</p>";
        self.send(to, subject, html).await
    }

    pub async fn send_payment_receipt(
        &self,
        to: &str,
        amount_cents: Option<i64>,
        currency: Option<&str>,
    ) -> BillingResult<()> {
        let subject = "Payment received";
        let amount_line = match amount_cents {
            Some(cents) => format!(
                "<p>Amount: {}</p>",
                format_amount(cents, currency.unwrap_or("eur"))
            ),
            None => String::new(),
        };
        let html = format!(
            "<p>Thanks, your subscription payment went through.</p>{amount_line}\
             <p>No action is needed.</p>"
        );
        self.send(to, subject, &html).await
    }

    async fn send(&self, to: &str, subject: &str, html: &str) -> BillingResult<()> {
        let Some(api_key) = &self.api_key else {
            tracing::info!(to = %to, subject = %subject, "Email disabled; skipping send");
            return Ok(());
        };

        let body = SendEmailRequest {
            from: &self.from,
            to: [to],
            subject,
            html,
        };
        let response = self
            .client
            .post(RESEND_ENDPOINT)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::EmailSend(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(BillingError::EmailSend(format!(
                "resend returned {status}: {detail}"
            )));
        }

        tracing::info!(to = %to, subject = %subject, "Email sent");
        Ok(())
    }
}

/// Human-readable money for receipt emails.
fn format_amount(amount_cents: i64, currency: &str) -> String {
    let units = amount_cents as f64 / 100.0;
    match currency.to_ascii_lowercase().as_str() {
        "eur" => format!("\u{20ac}{units:.2}"),
        "gbp" => format!("\u{a3}{units:.2}"),
        "usd" => format!("${units:.2}"),
        other => format!("{units:.2} {}", other.to_ascii_uppercase()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn formats_known_currencies_with_symbols() {
        assert_eq!(format_amount(1900, "eur"), "\u{20ac}19.00");
        assert_eq!(format_amount(500, "GBP"), "\u{a3}5.00");
        assert_eq!(format_amount(123, "usd"), "$1.23");
    }

    #[test]
    fn falls_back_to_currency_code() {
        assert_eq!(format_amount(250, "sek"), "2.50 SEK");
    }
}
