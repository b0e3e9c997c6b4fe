//! Conduit daemon
//!
//! Runs the routing engine with Postgres-backed storage until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use conduit::{
    Config, EngineBuilder, MemoryBackend, ObjectBackend, PostgresBackend, Unit, UNIT_DROPPED,
    UNIT_EXPIRED,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,conduit=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    tracing::info!("Starting conduit daemon");

    let config = Config::from_env()?;

    let primary: Arc<dyn ObjectBackend> = match &config.primary_database_url {
        Some(url) => Arc::new(connect("primary", url).await?),
        None => {
            tracing::warn!("CONDUIT_PRIMARY_DATABASE_URL not set, storing objects in memory");
            Arc::new(MemoryBackend::new("memory"))
        }
    };

    let mut builder = EngineBuilder::new(config.clone()).with_primary_backend(primary);
    if let Some(url) = &config.secondary_database_url {
        builder = builder.with_secondary_backend(Arc::new(connect("secondary", url).await?));
    } else {
        tracing::warn!("CONDUIT_SECONDARY_DATABASE_URL not set, running without fallback storage");
    }

    let handle = builder
        .build()
        .context("Failed to build conduit engine")?
        .start();

    handle.register_handler(UNIT_DROPPED, |unit: &Unit| {
        tracing::warn!(
            unit = %unit.id(),
            destination = %unit.destination(),
            recirculations = unit.recirculation_count(),
            "unit dropped"
        );
        Ok(())
    })?;
    handle.register_handler(UNIT_EXPIRED, |unit: &Unit| {
        tracing::info!(unit = %unit.id(), destination = %unit.destination(), "unit expired");
        Ok(())
    })?;

    tracing::info!(
        queue_capacity = config.queue_capacity,
        path_capacity = config.path_capacity,
        data_shards = config.data_shards,
        parity_shards = config.parity_shards,
        "conduit running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown signal received");
    let metrics = handle.engine().router().metrics().render_metrics();
    handle.shutdown().await;
    tracing::info!("Final counters:\n{}", metrics);

    Ok(())
}

async fn connect(name: &str, database_url: &str) -> Result<PostgresBackend> {
    let backend = PostgresBackend::connect(name, database_url).await?;
    backend
        .ensure_schema()
        .await
        .with_context(|| format!("Failed to prepare {} database", name))?;
    tracing::info!(backend = name, "connected to database");
    Ok(backend)
}
