// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messages moved across the worker queues.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::{
    CheckKind, CheckResult, ProjectOutputType, SubCheck, UserRequestData, VersionKey, VersionLabel,
};

/// Request to run checks on a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckEventRequest {
    /// Project id.
    pub etl_project_id: i64,
    /// Version label.
    pub etl_project_version: VersionLabel,
    /// Project name; the project directory inside the repository.
    pub etl_project_name: String,
    /// Jira task of the version.
    pub jira_task: Option<String>,
    /// Reference to check out.
    pub branch_name: String,
    /// Check record to complete.
    pub general_check_id: i64,
    /// Check kind.
    pub check_kind: CheckKind,
    /// Repository, without scheme.
    pub git_repo: String,
    /// Output type of the project.
    pub project_type: ProjectOutputType,
    /// User who asked for production, for REVIEW checks.
    pub user_data: Option<UserRequestData>,
}

impl CheckEventRequest {
    /// Key of the checked version.
    pub fn key(&self) -> VersionKey {
        VersionKey::new(self.etl_project_id, self.etl_project_version)
    }
}

/// Checks outcome for a [`CheckEventRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckEventResponse {
    /// Aggregate result.
    pub result: CheckResult,
    /// Sub-check results.
    pub checks: Vec<SubCheck>,
    /// The original request.
    pub request: CheckEventRequest,
}

/// Request to read the schedule declared by a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizeEventRequest {
    /// Project id.
    pub etl_project_id: i64,
    /// Version label.
    pub etl_project_version: VersionLabel,
    /// Project name; the project directory inside the repository.
    pub etl_project_name: String,
    /// Reference to check out.
    pub branch_name: String,
    /// Repository, without scheme.
    pub git_repo: String,
}

impl SynchronizeEventRequest {
    /// Key of the synchronized version.
    pub fn key(&self) -> VersionKey {
        VersionKey::new(self.etl_project_id, self.etl_project_version)
    }
}

/// Outcome of a [`SynchronizeEventRequest`]; exactly one of schedule or error is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizeEventResponse {
    /// The original request.
    pub request: SynchronizeEventRequest,
    /// Validated cron schedule.
    pub schedule_interval: Option<String>,
    /// Why the schedule could not be read.
    pub error_message: Option<String>,
}

impl SynchronizeEventResponse {
    /// Successful synchronization.
    pub fn found(request: SynchronizeEventRequest, schedule: String) -> Self {
        Self {
            request,
            schedule_interval: Some(schedule),
            error_message: None,
        }
    }

    /// Failed synchronization.
    pub fn failed(request: SynchronizeEventRequest, error: impl Into<String>) -> Self {
        Self {
            request,
            schedule_interval: None,
            error_message: Some(error.into()),
        }
    }
}

/// Event on the shared result queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultEvent {
    /// Checks finished.
    Check(CheckEventResponse),
    /// Schedule synchronization finished.
    Synchronize(SynchronizeEventResponse),
}

/// Kind of backfill run passed to the DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DagRunType {
    /// Recompute everything.
    #[serde(rename = "BACKFILL_FULL")]
    BackfillFull,
    /// Recompute datamart metrics only.
    #[serde(rename = "BACKFILL_METRICS_ONLY")]
    BackfillMetricsOnly,
}

impl DagRunType {
    fn as_str(self) -> &'static str {
        match self {
            Self::BackfillFull => "BACKFILL_FULL",
            Self::BackfillMetricsOnly => "BACKFILL_METRICS_ONLY",
        }
    }
}

/// Request to backfill a DAG over a date range on the Airflow host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshBackfillRequest {
    /// First day, inclusive.
    pub start_date: NaiveDate,
    /// Last day, inclusive.
    pub end_date: NaiveDate,
    /// DAG to backfill.
    pub dag_id: String,
    /// Run type passed in the DAG run conf.
    pub dag_run_type: DagRunType,
}

impl SshBackfillRequest {
    /// Whether the DAG id is safe to place on a shell command line.
    pub fn has_valid_dag_id(&self) -> bool {
        !self.dag_id.is_empty()
            && self
                .dag_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    }

    /// Airflow CLI command running the backfill.
    pub fn command(&self) -> String {
        format!(
            "airflow dags backfill --reset-dagruns -y --conf='{{\"run_type\": \"{}\"}}' -s {} -e {} {}",
            self.dag_run_type.as_str(),
            self.start_date.format("%Y-%m-%d"),
            self.end_date.format("%Y-%m-%d"),
            self.dag_id
        )
    }
}
