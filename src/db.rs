// src/db.rs
use std::time::Duration;

use backoff::{future::retry, ExponentialBackoff};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::PipelineResult;

/// Connect to Postgres, retrying while the database comes up, then migrate
pub async fn create_pool(database_url: &str, max_connections: u32) -> PipelineResult<PgPool> {
    let backoff_config = ExponentialBackoff {
        initial_interval: Duration::from_millis(500),
        max_interval: Duration::from_secs(10),
        multiplier: 2.0,
        max_elapsed_time: Some(Duration::from_secs(60)),
        ..Default::default()
    };

    let operation = move || async move {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| match e {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => {
                    tracing::warn!("Database not reachable yet (retrying): {}", e);
                    backoff::Error::transient(e)
                }
                other => backoff::Error::permanent(other),
            })
    };

    let pool = retry(backoff_config, operation).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> PipelineResult<()> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed successfully");
    Ok(())
}
