// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! BillHook Billing Module
//!
//! Reconciles payment-provider webhooks into subscription state.
//!
//! ## Features
//!
//! - **Webhook Intake**: Signature verification and envelope parsing for
//!   Stripe and GoCardless deliveries
//! - **Event Ledger**: At-most-once processing through an atomic claim on
//!   the provider's event id
//! - **Account Resolution**: Metadata, subscription-ref, and customer-ref
//!   lookup chain with an unmatched backstop
//! - **State Engine**: Out-of-order-safe transitions for the one
//!   subscription each account owns
//! - **Grace Handling**: Seven-day window after the first failed payment
//!   before enforcement cancels
//! - **Audit Trail**: Append-only record of every status change
//! - **Side Effects**: Transactionally queued emails and invoice records,
//!   dispatched after commit
//! - **Entitlement**: Strict live reads; only `active` grants access

pub mod audit;
pub mod config;
pub mod email;
pub mod engine;
pub mod entitlement;
pub mod error;
pub mod event;
pub mod invariants;
pub mod ledger;
pub mod outbound;
pub mod resolver;
pub mod signature;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Audit
pub use audit::{AuditRecorder, PlanStatusEvent, TransitionRecord};

// Config
pub use config::BillingConfig;

// Email
pub use email::BillingEmailService;

// Engine
pub use engine::{
    Subscription, TransitionEngine, TransitionOutcome, GRACE_PERIOD, REASON_GRACE_EXPIRED,
};

// Entitlement
pub use entitlement::{EntitlementService, EntitlementView};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use event::{EventCategory, ProviderEvent};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{ClaimOutcome, EventLedger, LedgerEntry, LedgerStatus};

// Outbound
pub use outbound::{OutboundQueue, OutboundTask, TaskKind, MAX_TASK_ATTEMPTS};

// Resolver
pub use resolver::{AccountResolver, ResolutionPath};

// Signature
pub use signature::SignatureVerifier;

// Webhooks
pub use webhooks::{DeliveryReport, EventDisposition, UnmatchedSweepReport, WebhookHandler};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub audit: AuditRecorder,
    pub email: BillingEmailService,
    pub engine: TransitionEngine,
    pub entitlement: EntitlementService,
    pub ledger: EventLedger,
    pub outbound: OutboundQueue,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        Ok(Self::new(config, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: BillingConfig, pool: PgPool) -> Self {
        Self {
            audit: AuditRecorder::new(pool.clone()),
            email: BillingEmailService::new(&config),
            engine: TransitionEngine::new(pool.clone()),
            entitlement: EntitlementService::new(pool.clone()),
            ledger: EventLedger::new(pool.clone()),
            outbound: OutboundQueue::new(pool.clone()),
            webhooks: WebhookHandler::new(&config, pool),
        }
    }
}
