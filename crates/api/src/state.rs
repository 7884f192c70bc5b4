//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use billhook_billing::BillingService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    /// Build the state, constructing the billing service from the
    /// environment. Missing webhook secrets abort startup: running a
    /// receiver that cannot verify deliveries is worse than not running.
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let billing = Arc::new(BillingService::from_env(pool.clone())?);

        if billing.email.is_enabled() {
            tracing::info!("Billing email notifications enabled");
        } else {
            tracing::warn!("Billing email notifications not configured (missing RESEND_API_KEY)");
        }

        Ok(Self {
            pool,
            config,
            billing,
        })
    }
}
