//! Billing configuration loaded from the environment.

use crate::error::{BillingError, BillingResult};

/// Webhook signing secrets for both providers plus the outbound mail
/// settings. Loaded once at startup; missing secrets fail fast rather than
/// silently accepting unsigned webhooks.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Stripe signing secret (`whsec_...`).
    pub stripe_webhook_secret: String,
    /// GoCardless endpoint secret for the raw-body HMAC scheme.
    pub gocardless_webhook_secret: String,
    /// Resend API key; `None` disables outbound email.
    pub resend_api_key: Option<String>,
    /// From address for billing mail.
    pub email_from: String,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let stripe_webhook_secret = require_env("STRIPE_WEBHOOK_SECRET")?;
        let gocardless_webhook_secret = require_env("GOCARDLESS_WEBHOOK_SECRET")?;
        let resend_api_key = std::env::var("RESEND_API_KEY").ok().filter(|v| !v.is_empty());
        let email_from = std::env::var("EMAIL_FROM")
            .unwrap_or_else(|_| "billing@billhook.dev".to_string());

        if resend_api_key.is_none() {
            tracing::warn!("RESEND_API_KEY not set; billing emails are disabled");
        }

        Ok(Self {
            stripe_webhook_secret,
            gocardless_webhook_secret,
            resend_api_key,
            email_from,
        })
    }
}

fn require_env(name: &'static str) -> BillingResult<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BillingError::Config(format!("{name} must be set")))
}
