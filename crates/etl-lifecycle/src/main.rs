// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ETL Lifecycle - Project Version Lifecycle Server
//!
//! Runs the background workers of the lifecycle engine:
//! - Project checker and schedule synchronizer
//! - Result dispatcher
//! - Status reconciliation against the execution registries
//! - Remote backfills on the Airflow host

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use etl_lifecycle::backfill::SshBackfillExecutor;
use etl_lifecycle::config::Config;
use etl_lifecycle::migrations;
use etl_lifecycle::registry::{HttpExecutionRegistry, HttpMonitoringClient};
use etl_lifecycle::runtime::LifecycleRuntime;
use etl_lifecycle::store::PostgresStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "etl_lifecycle=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        backend_dev = %config.backend_uri_dev,
        backend_prod = %config.backend_uri_prod,
        git_protocol = %config.git_protocol,
        backfill_workers = config.backfill_workers,
        "Starting ETL Lifecycle"
    );

    // Connect to database
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    migrations::run(&pool).await?;

    info!("Database schema verified");

    let mut builder = LifecycleRuntime::builder()
        .store(Arc::new(PostgresStore::new(pool)))
        .registry(Arc::new(HttpExecutionRegistry::new(
            &config.backend_uri_dev,
            &config.backend_uri_prod,
        )))
        .backfill_executor(Arc::new(SshBackfillExecutor::new(config.ssh.clone())))
        .snapshot_settings(config.snapshot_settings())
        .repositories(config.repositories())
        .target_reviewers(config.pr_target_reviewers.clone())
        .status_poll_interval(config.status_update_interval)
        .backfill_workers(config.backfill_workers)
        .retro_min_fs_etl_version(&config.retro_min_fs_etl_version);

    match &config.metric_manager_uri {
        Some(uri) => builder = builder.monitoring(Arc::new(HttpMonitoringClient::new(uri))),
        None => warn!("ETL_METRIC_MANAGER_URI not set; turned-off versions keep their monitoring"),
    }

    let runtime = builder.build()?.start().await?;

    info!("ETL Lifecycle ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("ETL Lifecycle shut down");

    Ok(())
}
