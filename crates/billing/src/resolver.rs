//! Account resolution
//!
//! Maps a provider event to an internal account. Resolution is a fallback
//! chain; an event that resolves through none of the steps is `unmatched`
//! and must not touch subscription state.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::event::ProviderEvent;

/// Which step of the chain matched; recorded in logs and audit metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPath {
    MetadataAccountId,
    SubscriptionRef,
    CustomerRef,
}

impl ResolutionPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionPath::MetadataAccountId => "metadata_account_id",
            ResolutionPath::SubscriptionRef => "subscription_ref",
            ResolutionPath::CustomerRef => "customer_ref",
        }
    }
}

#[derive(Clone)]
pub struct AccountResolver {
    pool: PgPool,
}

impl AccountResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve the account an event belongs to. First match wins:
    /// 1. explicit account id from event metadata (verified to exist),
    /// 2. provider subscription reference against the subscription table,
    /// 3. provider customer reference against the account table.
    pub async fn resolve(
        &self,
        event: &ProviderEvent,
    ) -> BillingResult<Option<(Uuid, ResolutionPath)>> {
        if let Some(hint) = event.account_hint {
            let found: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM accounts WHERE id = $1")
                .bind(hint)
                .fetch_optional(&self.pool)
                .await?;
            if let Some((account_id,)) = found {
                return Ok(Some((account_id, ResolutionPath::MetadataAccountId)));
            }
            // Metadata pointing at an account we do not have is worth a
            // warning of its own before falling through to the references.
            tracing::warn!(
                account_hint = %hint,
                provider = %event.provider,
                event_id = %event.external_id,
                "Event metadata names an unknown account"
            );
        }

        if let Some(subscription_ref) = &event.subscription_ref {
            let found: Option<(Uuid,)> = sqlx::query_as(
                "SELECT account_id FROM subscriptions WHERE provider_subscription_ref = $1",
            )
            .bind(subscription_ref)
            .fetch_optional(&self.pool)
            .await?;
            if let Some((account_id,)) = found {
                return Ok(Some((account_id, ResolutionPath::SubscriptionRef)));
            }
        }

        if let Some(customer_ref) = &event.customer_ref {
            let found: Option<(Uuid,)> =
                sqlx::query_as("SELECT id FROM accounts WHERE provider_customer_ref = $1")
                    .bind(customer_ref)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some((account_id,)) = found {
                return Ok(Some((account_id, ResolutionPath::CustomerRef)));
            }
        }

        Ok(None)
    }
}
