// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Submission API.
//!
//! Entry points used by the outer service to start background work. Checks,
//! synchronizations and backfills are enqueued and return immediately; the
//! only errors surfaced to callers are precondition failures.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::lifecycle::Lifecycle;
use crate::messages::{CheckEventRequest, DagRunType, SshBackfillRequest, SynchronizeEventRequest};
use crate::model::{
    CheckKind, CheckResult, Environment, EtlProjectVersion, GeneralCheck, GitFlowType,
    HistoryRecord, NewHistoryEvent, SubCheck, UserRequestData, VersionKey, VersionStatus,
};
use crate::registry::{ExecutionRegistry, RegistryError};
use crate::store::{CheckCompletion, StoreError};

/// History event name of a started retro calculation.
pub const RETRO_CALCULATION_EVENT: &str = "Retro calculation started";

const RETRO_DATE_FORMAT: &str = "%d.%m.%Y";

/// Precondition and plumbing errors of the submission API.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Version does not exist.
    #[error("Project version not found: {0}")]
    VersionNotFound(VersionKey),

    /// A check is already running on the version.
    #[error("A check is already in progress for {0}")]
    CheckInProgress(VersionKey),

    /// Operation not allowed in the current status.
    #[error("Cannot {operation} a version in status {status}")]
    InvalidStatus {
        /// Current status.
        status: VersionStatus,
        /// Rejected operation.
        operation: &'static str,
    },

    /// A transfer request is already active.
    #[error("Production transfer already requested for {0}")]
    TransferAlreadyRequested(VersionKey),

    /// Version has no development branch.
    #[error("Version {0} has no branch")]
    MissingBranch(VersionKey),

    /// No repository configured for the git flow.
    #[error("No repository configured for git flow {0}")]
    MissingRepository(GitFlowType),

    /// The prod registry has no successful run of the version.
    #[error("No successful run found for {0}")]
    NoSuccessfulRun(VersionKey),

    /// The last successful run carries no dag id.
    #[error("Last successful run of {0} has no dag id")]
    MissingDagId(VersionKey),

    /// Dag id cannot be passed to the remote shell.
    #[error("Invalid dag id: {0}")]
    InvalidDagId(String),

    /// The DAG runs an fs_etl version too old for retro calculations.
    #[error("Retro calculation requires fs_etl >= {required}, found {found}")]
    UnsupportedFsEtlVersion {
        /// Version of the last successful run.
        found: String,
        /// Configured minimum.
        required: String,
    },

    /// Start date after end date.
    #[error("Invalid date range {start} - {end}")]
    InvalidDateRange {
        /// First day.
        start: NaiveDate,
        /// Last day.
        end: NaiveDate,
    },

    /// The worker behind a queue is gone.
    #[error("{0} queue is closed")]
    QueueClosed(&'static str),

    /// Record store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Execution registry failed.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Status change failed.
    #[error(transparent)]
    Lifecycle(#[from] crate::error::Error),
}

/// Result type for submission operations.
pub type Result<T> = std::result::Result<T, SubmitError>;

/// Repositories checks and synchronizations clone, by git flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryTargets {
    /// Repository of two-repo projects.
    pub dev: Option<String>,
    /// Repository of one-repo projects.
    pub prod: Option<String>,
}

impl RepositoryTargets {
    /// Repository used for a project with the given git flow.
    pub fn repository_for(&self, flow: GitFlowType) -> Option<&str> {
        match flow {
            GitFlowType::TwoRepos => self.dev.as_deref(),
            GitFlowType::OneRepo => self.prod.as_deref(),
        }
    }
}

/// Kind of retro calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetroKind {
    /// Recompute datamart metrics only.
    DatamartMetric,
    /// Rerun the whole ETL.
    Etl,
}

impl RetroKind {
    /// Backfill run type for this kind.
    pub fn dag_run_type(self) -> DagRunType {
        match self {
            RetroKind::DatamartMetric => DagRunType::BackfillMetricsOnly,
            RetroKind::Etl => DagRunType::BackfillFull,
        }
    }
}

/// Queue senders feeding the background workers.
#[derive(Debug, Clone)]
pub struct SubmitQueues {
    /// Checker queue.
    pub checks: mpsc::UnboundedSender<CheckEventRequest>,
    /// Synchronizer queue.
    pub synchronizations: mpsc::UnboundedSender<SynchronizeEventRequest>,
    /// Backfill pool queue.
    pub backfills: mpsc::UnboundedSender<SshBackfillRequest>,
}

/// Starts background work on project versions.
#[derive(Clone)]
pub struct Submitter {
    lifecycle: Lifecycle,
    registry: Arc<dyn ExecutionRegistry>,
    repositories: RepositoryTargets,
    queues: SubmitQueues,
    retro_min_fs_etl_version: String,
}

impl Submitter {
    /// Create a submitter.
    pub fn new(
        lifecycle: Lifecycle,
        registry: Arc<dyn ExecutionRegistry>,
        repositories: RepositoryTargets,
        queues: SubmitQueues,
        retro_min_fs_etl_version: impl Into<String>,
    ) -> Self {
        Self {
            lifecycle,
            registry,
            repositories,
            queues,
            retro_min_fs_etl_version: retro_min_fs_etl_version.into(),
        }
    }

    async fn version(&self, key: VersionKey) -> Result<EtlProjectVersion> {
        self.lifecycle
            .store()
            .find_version(key)
            .await?
            .ok_or(SubmitError::VersionNotFound(key))
    }

    fn source(&self, version: &EtlProjectVersion) -> Result<(String, String)> {
        let branch = version
            .branch_name
            .clone()
            .ok_or(SubmitError::MissingBranch(version.key()))?;
        let repo = self
            .repositories
            .repository_for(version.project.git_flow)
            .ok_or(SubmitError::MissingRepository(version.project.git_flow))?;
        Ok((branch, repo.to_string()))
    }

    /// Create a PROCESSING check and hand it to the checker.
    pub async fn submit_check(
        &self,
        key: VersionKey,
        kind: CheckKind,
        user: Option<UserRequestData>,
    ) -> Result<GeneralCheck> {
        let _guard = self.lifecycle.lock().lock().await;

        let version = self.version(key).await?;
        if version.processing_check().is_some() {
            return Err(SubmitError::CheckInProgress(key));
        }
        let (branch, git_repo) = self.source(&version)?;

        let check = self.lifecycle.store().create_check(version.id, kind).await?;

        let request = CheckEventRequest {
            etl_project_id: version.project.id,
            etl_project_version: version.version,
            etl_project_name: version.project.name.clone(),
            jira_task: version.jira_task.clone(),
            branch_name: format!("refs/remotes/origin/{branch}"),
            general_check_id: check.id,
            check_kind: kind,
            git_repo,
            project_type: version.project.output_type,
            user_data: user,
        };

        if self.queues.checks.send(request).is_err() {
            // Nobody will ever complete it otherwise.
            self.lifecycle
                .store()
                .complete_check(
                    version.id,
                    &CheckCompletion {
                        check_id: check.id,
                        result: CheckResult::Failed,
                        checks: vec![SubCheck::failed("Project checker is not running")],
                        transfer_request: None,
                    },
                )
                .await?;
            return Err(SubmitError::QueueClosed("check"));
        }

        info!(
            project_id = key.project_id,
            version = %key.version,
            check_id = check.id,
            kind = %kind,
            "Check submitted"
        );
        Ok(check)
    }

    /// Move a TESTING version to PROD_REQUEST and start its review check.
    ///
    /// A successful review check creates the transfer request for the user.
    /// A version left in PROD_REQUEST by a failed review, or by a transfer
    /// request that ran out of retries, can be requested again; it only gets
    /// a new review check.
    pub async fn request_production(
        &self,
        key: VersionKey,
        user: UserRequestData,
    ) -> Result<GeneralCheck> {
        let version = {
            let _guard = self.lifecycle.lock().lock().await;
            let version = self.version(key).await?;
            if !matches!(
                version.status,
                VersionStatus::Testing | VersionStatus::ProdRequest
            ) {
                return Err(SubmitError::InvalidStatus {
                    status: version.status,
                    operation: "request production for",
                });
            }
            if version
                .latest_transfer_request()
                .is_some_and(|t| t.is_active())
            {
                return Err(SubmitError::TransferAlreadyRequested(key));
            }
            if version.processing_check().is_some() {
                return Err(SubmitError::CheckInProgress(key));
            }
            self.source(&version)?;
            version
        };

        if version.status == VersionStatus::Testing {
            self.lifecycle
                .transition(
                    &version,
                    VersionStatus::ProdRequest,
                    Some(user.user_name.clone()),
                    Utc::now(),
                )
                .await?;
        } else {
            info!(
                project_id = key.project_id,
                version = %key.version,
                "Production requested again; restarting review"
            );
        }

        self.submit_check(key, CheckKind::Review, Some(user)).await
    }

    /// Ask the synchronizer to refresh the version's schedule.
    pub async fn submit_synchronize(&self, key: VersionKey) -> Result<()> {
        let version = self.version(key).await?;
        let (branch, git_repo) = self.source(&version)?;

        let request = SynchronizeEventRequest {
            etl_project_id: version.project.id,
            etl_project_version: version.version,
            etl_project_name: version.project.name.clone(),
            branch_name: format!("refs/remotes/origin/{branch}"),
            git_repo,
        };
        self.queues
            .synchronizations
            .send(request)
            .map_err(|_| SubmitError::QueueClosed("synchronize"))?;

        info!(project_id = key.project_id, version = %key.version, "Synchronization submitted");
        Ok(())
    }

    /// Enqueue a raw backfill request.
    pub fn submit_backfill(&self, request: SshBackfillRequest) -> Result<()> {
        if !request.has_valid_dag_id() {
            return Err(SubmitError::InvalidDagId(request.dag_id));
        }
        if request.start_date > request.end_date {
            return Err(SubmitError::InvalidDateRange {
                start: request.start_date,
                end: request.end_date,
            });
        }
        self.queues
            .backfills
            .send(request)
            .map_err(|_| SubmitError::QueueClosed("backfill"))
    }

    /// Start a retro calculation of a production version over a date range.
    ///
    /// The DAG and fs_etl version come from the last successful prod run.
    pub async fn start_retro_calculation(
        &self,
        key: VersionKey,
        start: NaiveDate,
        end: NaiveDate,
        kind: RetroKind,
        actor: Option<String>,
    ) -> Result<HistoryRecord> {
        let version = self.version(key).await?;
        if !matches!(
            version.status,
            VersionStatus::ProdReview | VersionStatus::ProdRelease | VersionStatus::Production
        ) {
            return Err(SubmitError::InvalidStatus {
                status: version.status,
                operation: "start a retro calculation for",
            });
        }

        let run = self
            .registry
            .get_last_successful_run(Environment::Prod, key)
            .await?
            .ok_or(SubmitError::NoSuccessfulRun(key))?;
        let dag_id = run.dag_id.ok_or(SubmitError::MissingDagId(key))?;

        let found = run.fs_etl_version.unwrap_or_default();
        if !fs_etl_version_at_least(&found, &self.retro_min_fs_etl_version) {
            return Err(SubmitError::UnsupportedFsEtlVersion {
                found,
                required: self.retro_min_fs_etl_version.clone(),
            });
        }

        self.submit_backfill(SshBackfillRequest {
            start_date: start,
            end_date: end,
            dag_id: dag_id.clone(),
            dag_run_type: kind.dag_run_type(),
        })?;

        let range = format!(
            "{} - {}",
            start.format(RETRO_DATE_FORMAT),
            end.format(RETRO_DATE_FORMAT)
        );
        let record = self
            .lifecycle
            .store()
            .add_history_event(&NewHistoryEvent {
                version_id: version.id,
                name: RETRO_CALCULATION_EVENT.to_string(),
                old_value: None,
                new_value: None,
                author: actor,
                created_at: Utc::now(),
                extra_data: Some(serde_json::json!([
                    { "header": "Date range", "value": range, "items": [] }
                ])),
            })
            .await;

        let record = match record {
            Ok(record) => record,
            Err(e) => {
                // The backfill is already queued.
                error!(project_id = key.project_id, version = %key.version, error = %e, "Failed to record retro calculation");
                return Err(e.into());
            }
        };

        info!(
            project_id = key.project_id,
            version = %key.version,
            dag_id = %dag_id,
            range = %range,
            "Retro calculation started"
        );
        Ok(record)
    }
}

/// Compare dotted versions on their first three numeric parts.
///
/// Missing parts count as zero; a part that is not a number fails the check.
pub fn fs_etl_version_at_least(found: &str, required: &str) -> bool {
    fn parts(version: &str) -> Option<[u64; 3]> {
        let mut parts = [0u64; 3];
        for (slot, part) in parts.iter_mut().zip(version.trim().split('.')) {
            *slot = part.parse().ok()?;
        }
        Some(parts)
    }

    match (parts(found), parts(required)) {
        (Some(found), Some(required)) => found >= required,
        _ => false,
    }
}
