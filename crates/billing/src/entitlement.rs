//! Entitlement checks
//!
//! The authoritative answer always comes from the subscription row at read
//! time. `past_due` does not grant access: the grace window delays
//! cancellation, it never extends entitlement. The cached status on
//! `accounts` exists for cheap display reads and is advisory only.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use billhook_shared::SubscriptionStatus;

use crate::error::BillingResult;

/// Whether a status grants access to paid features.
pub fn entitled(status: SubscriptionStatus) -> bool {
    status == SubscriptionStatus::Active
}

/// Full answer for an entitlement probe.
#[derive(Debug, Clone, Serialize)]
pub struct EntitlementView {
    pub account_id: Uuid,
    pub entitled: bool,
    pub status: SubscriptionStatus,
    pub plan_code: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub grace_until: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct EntitlementService {
    pool: PgPool,
}

impl EntitlementService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Live entitlement read. An account without a subscription row has
    /// never been through billing and is treated as `pending`.
    pub async fn is_entitled(&self, account_id: Uuid) -> BillingResult<bool> {
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM subscriptions WHERE account_id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        match status {
            Some((status,)) => {
                let status: SubscriptionStatus = status.parse()?;
                Ok(entitled(status))
            }
            None => Ok(false),
        }
    }

    /// Entitlement with the context an operator wants next to it.
    pub async fn check(&self, account_id: Uuid) -> BillingResult<EntitlementView> {
        let row: Option<(String, Option<String>, Option<OffsetDateTime>)> = sqlx::query_as(
            r#"
            SELECT s.status, s.plan_code, a.grace_until
            FROM subscriptions s
            JOIN accounts a ON a.id = s.account_id
            WHERE s.account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((status, plan_code, grace_until)) => {
                let status: SubscriptionStatus = status.parse()?;
                Ok(EntitlementView {
                    account_id,
                    entitled: entitled(status),
                    status,
                    plan_code,
                    grace_until,
                })
            }
            None => Ok(EntitlementView {
                account_id,
                entitled: false,
                status: SubscriptionStatus::Pending,
                plan_code: None,
                grace_until: None,
            }),
        }
    }

    /// Advisory cached status from the account row. Display use only;
    /// anything gating access must call [`Self::is_entitled`].
    pub async fn cached_status(
        &self,
        account_id: Uuid,
    ) -> BillingResult<Option<SubscriptionStatus>> {
        let cached: Option<(Option<String>,)> =
            sqlx::query_as("SELECT plan_status FROM accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        match cached.and_then(|(s,)| s) {
            Some(status) => Ok(Some(status.parse()?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_active_is_entitled() {
        assert!(entitled(SubscriptionStatus::Active));
        assert!(!entitled(SubscriptionStatus::Pending));
        assert!(!entitled(SubscriptionStatus::PastDue));
        assert!(!entitled(SubscriptionStatus::Cancelled));
    }
}
