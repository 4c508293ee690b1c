// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for etl-lifecycle.
//!
//! [`LifecycleRuntime`] wires the queues and spawns every background worker
//! inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use etl_lifecycle::backfill::{SshBackfillExecutor, SshSettings};
//! use etl_lifecycle::registry::HttpExecutionRegistry;
//! use etl_lifecycle::runtime::LifecycleRuntime;
//! use etl_lifecycle::store::PostgresStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!
//!     let runtime = LifecycleRuntime::builder()
//!         .store(Arc::new(PostgresStore::new(pool)))
//!         .registry(Arc::new(HttpExecutionRegistry::new("http://dev", "http://prod")))
//!         .backfill_executor(Arc::new(SshBackfillExecutor::new(SshSettings::default())))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... submit work through runtime.submitter() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::backfill::{BackfillDispatcherConfig, BackfillExecutor, RemoteBackfillDispatcher};
use crate::checker::ProjectChecker;
use crate::checks::CheckRunner;
use crate::dispatcher::ResultDispatcher;
use crate::lifecycle::{Lifecycle, write_lock};
use crate::reconciler::{ExternalStatusReconciler, ReconcilerConfig};
use crate::registry::{ExecutionRegistry, MonitoringClient, RunWindow};
use crate::snapshot::SnapshotSettings;
use crate::store::RecordStore;
use crate::submit::{RepositoryTargets, SubmitQueues, Submitter};
use crate::synchronizer::ScheduleSynchronizer;
use crate::transfer::TransferReconciler;

/// Default minimal fs_etl version for retro calculations.
pub const DEFAULT_RETRO_MIN_FS_ETL_VERSION: &str = "0.23.24";

/// Builder for creating a [`LifecycleRuntime`].
pub struct LifecycleRuntimeBuilder {
    store: Option<Arc<dyn RecordStore>>,
    registry: Option<Arc<dyn ExecutionRegistry>>,
    monitoring: Option<Arc<dyn MonitoringClient>>,
    backfill_executor: Option<Arc<dyn BackfillExecutor>>,
    check_runner: CheckRunner,
    snapshot_settings: SnapshotSettings,
    repositories: RepositoryTargets,
    target_reviewers: Vec<String>,
    reconciler_config: ReconcilerConfig,
    backfill_workers: usize,
    retro_min_fs_etl_version: String,
}

impl Default for LifecycleRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            registry: None,
            monitoring: None,
            backfill_executor: None,
            check_runner: CheckRunner::default(),
            snapshot_settings: SnapshotSettings::default(),
            repositories: RepositoryTargets::default(),
            target_reviewers: Vec::new(),
            reconciler_config: ReconcilerConfig::default(),
            backfill_workers: BackfillDispatcherConfig::default().workers,
            retro_min_fs_etl_version: DEFAULT_RETRO_MIN_FS_ETL_VERSION.to_string(),
        }
    }
}

impl LifecycleRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the record store (required).
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the execution registry (required).
    pub fn registry(mut self, registry: Arc<dyn ExecutionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the monitoring client used when versions are turned off.
    ///
    /// Default: none (monitoring is left enabled and a warning is logged)
    pub fn monitoring(mut self, monitoring: Arc<dyn MonitoringClient>) -> Self {
        self.monitoring = Some(monitoring);
        self
    }

    /// Set the backfill executor (required).
    pub fn backfill_executor(mut self, executor: Arc<dyn BackfillExecutor>) -> Self {
        self.backfill_executor = Some(executor);
        self
    }

    /// Set the checks run by the project checker.
    ///
    /// Default: required files and materialization call checks
    pub fn check_runner(mut self, runner: CheckRunner) -> Self {
        self.check_runner = runner;
        self
    }

    /// Set how repositories are cloned.
    ///
    /// Default: HTTP, no credentials, 5 minute timeout
    pub fn snapshot_settings(mut self, settings: SnapshotSettings) -> Self {
        self.snapshot_settings = settings;
        self
    }

    /// Set the repositories checks and synchronizations clone.
    ///
    /// Default: none (submissions fail with a missing repository error)
    pub fn repositories(mut self, repositories: RepositoryTargets) -> Self {
        self.repositories = repositories;
        self
    }

    /// Set the reviewers requested on TARGETS pull requests.
    ///
    /// Default: none
    pub fn target_reviewers(mut self, reviewers: Vec<String>) -> Self {
        self.target_reviewers = reviewers;
        self
    }

    /// Set the status reconciliation interval.
    ///
    /// Default: 2 minutes
    pub fn status_poll_interval(mut self, interval: Duration) -> Self {
        self.reconciler_config.poll_interval = interval;
        self
    }

    /// Set the window of runs listed per reconciliation cycle.
    ///
    /// Default: 1 hour
    pub fn run_window(mut self, window: RunWindow) -> Self {
        self.reconciler_config.window = window;
        self
    }

    /// Set the capacity of each environment's processed-run cache.
    ///
    /// Default: 100
    pub fn run_cache_capacity(mut self, capacity: usize) -> Self {
        self.reconciler_config.cache_capacity = capacity;
        self
    }

    /// Set the number of concurrent backfill workers.
    ///
    /// Default: 5
    pub fn backfill_workers(mut self, workers: usize) -> Self {
        self.backfill_workers = workers;
        self
    }

    /// Set the minimal fs_etl version able to run retro calculations.
    ///
    /// Default: `0.23.24`
    pub fn retro_min_fs_etl_version(mut self, version: impl Into<String>) -> Self {
        self.retro_min_fs_etl_version = version.into();
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<LifecycleRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;
        let backfill_executor = self
            .backfill_executor
            .ok_or_else(|| anyhow::anyhow!("backfill_executor is required"))?;
        if self.backfill_workers == 0 {
            anyhow::bail!("backfill_workers must be at least 1");
        }

        Ok(LifecycleRuntimeConfig {
            store,
            registry,
            monitoring: self.monitoring,
            backfill_executor,
            check_runner: self.check_runner,
            snapshot_settings: self.snapshot_settings,
            repositories: self.repositories,
            target_reviewers: self.target_reviewers,
            reconciler_config: self.reconciler_config,
            backfill_workers: self.backfill_workers,
            retro_min_fs_etl_version: self.retro_min_fs_etl_version,
        })
    }
}

/// Configuration for a [`LifecycleRuntime`].
pub struct LifecycleRuntimeConfig {
    store: Arc<dyn RecordStore>,
    registry: Arc<dyn ExecutionRegistry>,
    monitoring: Option<Arc<dyn MonitoringClient>>,
    backfill_executor: Arc<dyn BackfillExecutor>,
    check_runner: CheckRunner,
    snapshot_settings: SnapshotSettings,
    repositories: RepositoryTargets,
    target_reviewers: Vec<String>,
    reconciler_config: ReconcilerConfig,
    backfill_workers: usize,
    retro_min_fs_etl_version: String,
}

impl LifecycleRuntimeConfig {
    /// Start the runtime, spawning every background worker.
    pub async fn start(self) -> Result<LifecycleRuntime> {
        let lock = write_lock();
        let mut lifecycle = Lifecycle::new(self.store.clone(), lock.clone());
        if let Some(monitoring) = self.monitoring {
            lifecycle = lifecycle.with_monitoring(monitoring);
        }

        let (check_tx, check_rx) = mpsc::unbounded_channel();
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let (backfill_tx, backfill_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        // Project checker
        let checker = ProjectChecker::new(
            self.snapshot_settings.clone(),
            Arc::new(self.check_runner),
            check_rx,
            results_tx.clone(),
        );
        let checker_shutdown = checker.shutdown_handle();
        let checker_handle = tokio::spawn(checker.run());

        // Schedule synchronizer
        let synchronizer = ScheduleSynchronizer::new(self.snapshot_settings, sync_rx, results_tx);
        let synchronizer_shutdown = synchronizer.shutdown_handle();
        let synchronizer_handle = tokio::spawn(synchronizer.run());

        // Result dispatcher
        let dispatcher = ResultDispatcher::new(
            self.store.clone(),
            self.registry.clone(),
            lock,
            results_rx,
        )
        .with_target_reviewers(self.target_reviewers);
        let dispatcher_handle = tokio::spawn(dispatcher.run());

        // Status reconciler
        let reconciler = Arc::new(ExternalStatusReconciler::new(
            self.registry.clone(),
            lifecycle.clone(),
            self.reconciler_config,
        ));
        let reconciler_shutdown = reconciler.shutdown_handle();
        let reconciler_handle = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move {
                reconciler.run().await;
            })
        };

        // Backfill pool
        let backfills = RemoteBackfillDispatcher::start(
            self.backfill_executor,
            backfill_rx,
            BackfillDispatcherConfig {
                workers: self.backfill_workers,
            },
        );

        let submitter = Submitter::new(
            lifecycle.clone(),
            self.registry,
            self.repositories,
            SubmitQueues {
                checks: check_tx,
                synchronizations: sync_tx,
                backfills: backfill_tx,
            },
            self.retro_min_fs_etl_version,
        );
        let transfers = TransferReconciler::new(lifecycle);

        info!(
            backfill_workers = backfills.worker_count(),
            "LifecycleRuntime started"
        );

        Ok(LifecycleRuntime {
            submitter,
            transfers,
            reconciler,
            backfills,
            checker_handle,
            synchronizer_handle,
            dispatcher_handle,
            reconciler_handle,
            checker_shutdown,
            synchronizer_shutdown,
            reconciler_shutdown,
        })
    }
}

/// A running lifecycle engine that can be embedded in an application.
///
/// The runtime manages:
/// - Project checker consuming check requests
/// - Schedule synchronizer consuming synchronize requests
/// - Result dispatcher recording both kinds of results
/// - Status reconciler polling the execution registries
/// - Backfill worker pool
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct LifecycleRuntime {
    submitter: Submitter,
    transfers: TransferReconciler,
    reconciler: Arc<ExternalStatusReconciler>,
    backfills: RemoteBackfillDispatcher,
    checker_handle: JoinHandle<()>,
    synchronizer_handle: JoinHandle<()>,
    dispatcher_handle: JoinHandle<()>,
    reconciler_handle: JoinHandle<()>,
    checker_shutdown: Arc<Notify>,
    synchronizer_shutdown: Arc<Notify>,
    reconciler_shutdown: Arc<Notify>,
}

impl LifecycleRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> LifecycleRuntimeBuilder {
        LifecycleRuntimeBuilder::new()
    }

    /// Submission API feeding the workers.
    pub fn submitter(&self) -> &Submitter {
        &self.submitter
    }

    /// Production transfer reconciliation.
    pub fn transfers(&self) -> &TransferReconciler {
        &self.transfers
    }

    /// Status reconciler, for on-demand refresh of a single version.
    pub fn reconciler(&self) -> &Arc<ExternalStatusReconciler> {
        &self.reconciler
    }

    /// Check if every worker is still running.
    pub fn is_running(&self) -> bool {
        !self.checker_handle.is_finished()
            && !self.synchronizer_handle.is_finished()
            && !self.dispatcher_handle.is_finished()
            && !self.reconciler_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// The checker and synchronizer stop first. Checks still queued are
    /// failed, and running ones finish. The result dispatcher then records
    /// every result left on its queue and stops once the queue closes. The
    /// status reconciler and the backfill pool stop last. A remote backfill
    /// already running is allowed to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("LifecycleRuntime shutting down...");

        let mut panicked = Vec::new();

        self.checker_shutdown.notify_one();
        self.synchronizer_shutdown.notify_one();
        let producers = [
            ("Project checker", self.checker_handle),
            ("Schedule synchronizer", self.synchronizer_handle),
        ];
        for (name, handle) in producers {
            if let Err(e) = handle.await {
                error!("{} task panicked: {}", name, e);
                panicked.push(name);
            }
        }

        // Both result senders are gone; the dispatcher drains and exits.
        if let Err(e) = self.dispatcher_handle.await {
            error!("Result dispatcher task panicked: {}", e);
            panicked.push("Result dispatcher");
        }

        self.reconciler_shutdown.notify_one();
        if let Err(e) = self.reconciler_handle.await {
            error!("Status reconciler task panicked: {}", e);
            panicked.push("Status reconciler");
        }

        self.backfills.shutdown().await;

        if !panicked.is_empty() {
            return Err(anyhow::anyhow!(
                "worker tasks panicked: {}",
                panicked.join(", ")
            ));
        }

        info!("LifecycleRuntime shutdown complete");
        Ok(())
    }
}
