//! Shared Postgres pool.
//!
//! A deliberate departure from the teacher's `rusqlite` (synchronous, would
//! block the tokio executor): spec.md's `DB_DSN` default is a Postgres DSN
//! and one pool must serve the batch writers (§4.5) and the
//! `/api/v1/klines` read path (§5: "Database pool is shared among batch
//! writers and the historical query path") off the same async pool. See
//! DESIGN.md for the full rationale.

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

pub async fn connect(dsn: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(dsn)
        .await
        .context("failed to connect to postgres")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    Ok(pool)
}
