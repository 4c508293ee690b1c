// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic reconciliation of version status with external run outcomes.
//!
//! Every cycle lists the runs each execution registry finished within the
//! trailing window, skips runs already handled, and applies the transitions
//! the remaining outcomes allow:
//!
//! | Environment | Current status | Run outcome | New status |
//! |-------------|----------------|-------------|------------|
//! | dev | DEVELOPING | SUCCESS | TESTING |
//! | prod | PROD_REVIEW | FAIL | PROD_RELEASE |
//! | prod | PROD_REVIEW, PROD_RELEASE | SUCCESS | PRODUCTION |
//!
//! Per-version updates run concurrently. A version whose update fails keeps
//! its run id out of the dedup cache so the next cycle retries it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::lifecycle::{Lifecycle, transition_for_run};
use crate::model::{Environment, EtlProjectVersion, VersionKey, VersionStatus};
use crate::registry::{EtlRun, ExecutionRegistry, RunWindow};

/// Bounded insertion-ordered set of processed run ids.
#[derive(Debug, Clone)]
pub struct DedupCache {
    capacity: usize,
    order: VecDeque<i64>,
    members: HashSet<i64>,
}

impl DedupCache {
    /// Create a cache holding at most `capacity` ids.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    /// Whether the id was seen recently.
    pub fn contains(&self, id: i64) -> bool {
        self.members.contains(&id)
    }

    /// Remember an id, evicting the oldest one when full.
    pub fn insert(&mut self, id: i64) {
        if self.capacity == 0 || self.members.contains(&id) {
            return;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.members.remove(&oldest);
        }
        self.order.push_back(id);
        self.members.insert(id);
    }

    /// Number of remembered ids.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Configuration for the status reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between cycles; the first cycle runs after one interval.
    pub poll_interval: Duration,
    /// Trailing window of runs listed per cycle.
    pub window: RunWindow,
    /// Capacity of each environment's dedup cache.
    pub cache_capacity: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(120), // 2 minutes
            window: RunWindow::hours(1),
            cache_capacity: 100,
        }
    }
}

/// Counts from one environment's cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Runs listed by the registry.
    pub listed: usize,
    /// Runs not seen before.
    pub fresh: usize,
    /// Versions whose status changed.
    pub transitioned: usize,
    /// Versions whose update failed.
    pub failed: usize,
}

/// Background worker reconciling version status with run outcomes.
pub struct ExternalStatusReconciler {
    registry: Arc<dyn ExecutionRegistry>,
    lifecycle: Lifecycle,
    config: ReconcilerConfig,
    dev_seen: Mutex<DedupCache>,
    prod_seen: Mutex<DedupCache>,
    shutdown: Arc<Notify>,
}

impl ExternalStatusReconciler {
    /// Create a new reconciler.
    pub fn new(
        registry: Arc<dyn ExecutionRegistry>,
        lifecycle: Lifecycle,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            dev_seen: Mutex::new(DedupCache::new(config.cache_capacity)),
            prod_seen: Mutex::new(DedupCache::new(config.cache_capacity)),
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconciler loop.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            window = ?self.config.window,
            "Status reconciler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Status reconciler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.run_cycle().await;
                }
            }
        }

        info!("Status reconciler stopped");
    }

    /// Reconcile dev, then prod. A failing environment does not stop the other.
    pub async fn run_cycle(&self) {
        for env in [Environment::Dev, Environment::Prod] {
            match self.reconcile_environment(env).await {
                Ok(report) if report.transitioned > 0 || report.failed > 0 => {
                    info!(
                        env = %env,
                        listed = report.listed,
                        fresh = report.fresh,
                        transitioned = report.transitioned,
                        failed = report.failed,
                        "Reconciliation cycle completed"
                    );
                }
                Ok(report) => {
                    debug!(env = %env, listed = report.listed, "Reconciliation cycle completed, nothing to do");
                }
                Err(e) => {
                    error!(env = %env, error = %e, "Reconciliation cycle failed");
                }
            }
        }
    }

    fn cache(&self, env: Environment) -> &Mutex<DedupCache> {
        match env {
            Environment::Dev => &self.dev_seen,
            Environment::Prod => &self.prod_seen,
        }
    }

    fn is_seen(&self, env: Environment, run_id: i64) -> bool {
        self.cache(env)
            .lock()
            .map(|cache| cache.contains(run_id))
            .unwrap_or(false)
    }

    fn remember(&self, env: Environment, run_ids: impl IntoIterator<Item = i64>) {
        if let Ok(mut cache) = self.cache(env).lock() {
            for id in run_ids {
                cache.insert(id);
            }
        }
    }

    /// Run one reconciliation pass for an environment.
    pub async fn reconcile_environment(&self, env: Environment) -> Result<CycleReport> {
        let runs = self
            .registry
            .list_recent_runs(env, self.config.window)
            .await?;
        let mut report = CycleReport {
            listed: runs.len(),
            ..Default::default()
        };

        // Last listed run per version wins.
        let mut fresh: HashMap<VersionKey, EtlRun> = HashMap::new();
        for run in runs {
            if self.is_seen(env, run.etl_run.id) {
                continue;
            }
            fresh.insert(run.key(), run.etl_run);
        }
        report.fresh = fresh.len();
        if fresh.is_empty() {
            return Ok(report);
        }

        let keys: Vec<VersionKey> = fresh.keys().copied().collect();
        let versions = self.lifecycle.store().find_versions(&keys).await?;

        let updates = versions.iter().filter_map(|version| {
            let run = fresh.get(&version.key())?;
            Some(async move { (version.key(), self.apply_run(env, version, run).await) })
        });

        let mut failed: HashSet<VersionKey> = HashSet::new();
        for (key, outcome) in join_all(updates).await {
            match outcome {
                Ok(Some(status)) => {
                    report.transitioned += 1;
                    debug!(env = %env, project_id = key.project_id, version = %key.version, status = %status, "Run applied");
                }
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    failed.insert(key);
                    error!(
                        env = %env,
                        project_id = key.project_id,
                        version = %key.version,
                        error = %e,
                        "Failed to apply run outcome"
                    );
                }
            }
        }

        self.remember(
            env,
            fresh
                .iter()
                .filter(|(key, _)| !failed.contains(key))
                .map(|(_, run)| run.id),
        );

        Ok(report)
    }

    /// Apply a run outcome to a version; returns the new status, if any.
    async fn apply_run(
        &self,
        env: Environment,
        version: &EtlProjectVersion,
        run: &EtlRun,
    ) -> Result<Option<VersionStatus>> {
        let Some(target) = transition_for_run(env, version.status, &run.result) else {
            return Ok(None);
        };
        self.lifecycle
            .transition(
                version,
                target,
                version.author_name.clone(),
                run.run_ts.unwrap_or_else(Utc::now),
            )
            .await?;
        Ok(Some(target))
    }

    /// Reconcile a single version with its last run.
    ///
    /// Versions under production review are checked against the prod
    /// registry, every other version against dev. Returns the version as
    /// it is after the update.
    pub async fn refresh_version(&self, key: VersionKey) -> Result<EtlProjectVersion> {
        let version = self
            .lifecycle
            .store()
            .find_version(key)
            .await?
            .ok_or(Error::VersionNotFound(key))?;

        let env = match version.status {
            VersionStatus::ProdReview | VersionStatus::ProdRelease => Environment::Prod,
            _ => Environment::Dev,
        };

        let Some(run) = self.registry.get_last_run(env, key).await? else {
            return Ok(version);
        };

        match transition_for_run(env, version.status, &run.result) {
            Some(target) => {
                self.lifecycle
                    .transition(
                        &version,
                        target,
                        version.author_name.clone(),
                        run.run_ts.unwrap_or_else(Utc::now),
                    )
                    .await
            }
            None => Ok(version),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_cache_evicts_oldest() {
        let mut cache = DedupCache::new(3);
        for id in [1, 2, 3] {
            cache.insert(id);
        }
        assert!(cache.contains(1));

        cache.insert(4);
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
        assert!(cache.contains(4));
    }

    #[test]
    fn test_dedup_cache_ignores_repeats() {
        let mut cache = DedupCache::new(2);
        cache.insert(1);
        cache.insert(1);
        cache.insert(2);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(1));
        assert!(cache.contains(2));
    }

    #[test]
    fn test_dedup_cache_zero_capacity() {
        let mut cache = DedupCache::new(0);
        cache.insert(1);
        assert!(cache.is_empty());
        assert!(!cache.contains(1));
    }

    #[test]
    fn test_default_config() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(120));
        assert_eq!(config.window, RunWindow::hours(1));
        assert_eq!(config.cache_capacity, 100);
    }
}
