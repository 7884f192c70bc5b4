//! Shared types and database plumbing used by the api, billing, and worker
//! crates.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{BillingCadence, PaymentProvider, SubscriptionStatus};
