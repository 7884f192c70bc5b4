//! Database pool construction and migrations.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Embedded migrations, applied at service startup.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

fn max_connections_from_env() -> u32 {
    std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10)
}

/// Pool for regular query traffic. Sized from `DATABASE_MAX_CONNECTIONS`
/// (default 10) with a bounded acquire timeout so webhook handlers fail
/// fast instead of queueing past provider delivery deadlines.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections_from_env())
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Single-connection pool with relaxed timeouts for running migrations.
/// Use a direct (non-pooler) URL; transaction poolers break prepared
/// statements that the migrator relies on.
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations");
    MIGRATOR.run(pool).await?;
    tracing::info!("Database migrations complete");
    Ok(())
}
