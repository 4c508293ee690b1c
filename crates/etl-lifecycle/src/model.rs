// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain model for ETL project versions.
//!
//! Everything the lifecycle engine reads from or writes to the record store is
//! defined here: versions and their projects, general checks with sub-check
//! results, transfer requests, history records and the version label scheme.
//! Enum values serialize to the upper-case names used by the record store and
//! the external registries (`PROD_REVIEW`, `TWO_REPOS`, ...).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Record store id of a project version.
pub type VersionId = i64;

/// Record store id of an ETL project.
pub type ProjectId = i64;

// ============================================================================
// Version labels
// ============================================================================

/// Version label of a project version.
///
/// Labels are positive integers rendered as `"N.0"`. The first version of a
/// project is [`VersionLabel::FIRST`] and every new version takes the
/// [`successor`](Self::successor) of the latest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionLabel(u32);

impl VersionLabel {
    /// Label of the first version of every project.
    pub const FIRST: Self = Self(1);

    /// Create a label from its number. Returns `None` for zero.
    pub fn new(number: u32) -> Option<Self> {
        (number >= 1).then_some(Self(number))
    }

    /// Numeric value of the label.
    pub fn number(self) -> u32 {
        self.0
    }

    /// Label of the next version, or `None` once the numbering is exhausted.
    pub fn successor(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }

    /// Label of the previous version, or `None` for the first one.
    pub fn predecessor(self) -> Option<Self> {
        Self::new(self.0 - 1)
    }
}

impl fmt::Display for VersionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.0", self.0)
    }
}

/// Error returned when a version label cannot be parsed.
#[derive(Debug, Clone, Error)]
#[error("Invalid version label: {0:?}")]
pub struct InvalidVersionLabel(pub String);

impl FromStr for VersionLabel {
    type Err = InvalidVersionLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed.strip_suffix(".0").unwrap_or(trimmed);
        digits
            .parse::<u32>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| InvalidVersionLabel(s.to_string()))
    }
}

impl TryFrom<String> for VersionLabel {
    type Error = InvalidVersionLabel;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionLabel> for String {
    fn from(label: VersionLabel) -> Self {
        label.to_string()
    }
}

/// Identifies a version by project and label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionKey {
    /// Project id.
    pub project_id: ProjectId,
    /// Version label.
    pub version: VersionLabel,
}

impl VersionKey {
    /// Create a new key.
    pub fn new(project_id: ProjectId, version: VersionLabel) -> Self {
        Self {
            project_id,
            version,
        }
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "project {} version {}", self.project_id, self.version)
    }
}

// ============================================================================
// Enumerations
// ============================================================================

/// Error returned when a stored enum value is not recognized.
#[derive(Debug, Clone, Error)]
#[error("Unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    /// Enum being parsed.
    pub kind: &'static str,
    /// Rejected value.
    pub value: String,
}

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident ($kind:literal) {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant, )+
        }

        impl $name {
            /// Stored representation.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $text, )+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok(Self::$variant), )+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum! {
    /// Lifecycle status of a project version.
    VersionStatus ("status") {
        /// Being developed; the initial status.
        Developing => "DEVELOPING",
        /// A dev run succeeded.
        Testing => "TESTING",
        /// A user asked to send the version to production.
        ProdRequest => "PROD_REQUEST",
        /// The production branch or pull request exists.
        ProdReview => "PROD_REVIEW",
        /// A prod run failed while under review.
        ProdRelease => "PROD_RELEASE",
        /// A prod run succeeded; the active production version.
        Production => "PRODUCTION",
        /// Replaced by a newer production version.
        TurnedOff => "TURNED_OFF",
    }
}

string_enum! {
    /// What a project produces; decides which manifest it must carry.
    ProjectOutputType ("project type") {
        /// Feature tables.
        Features => "FEATURES",
        /// Aggregate tables.
        Aggregates => "AGGREGATES",
        /// Target tables.
        Targets => "TARGETS",
    }
}

impl ProjectOutputType {
    /// Manifest file required at the project root.
    pub fn manifest_file(self) -> &'static str {
        match self {
            Self::Features => "features.yaml",
            Self::Aggregates => "aggregates.yaml",
            Self::Targets => "targets.yaml",
        }
    }
}

string_enum! {
    /// How a project's code is promoted to production.
    GitFlowType ("git flow type") {
        /// Dev and prod share one repository; promotion opens a pull request.
        OneRepo => "ONE_REPO",
        /// Dev and prod repositories are separate; promotion pushes a branch.
        TwoRepos => "TWO_REPOS",
    }
}

string_enum! {
    /// Purpose of a general check.
    CheckKind ("check type") {
        /// Routine check requested by a user.
        Testing => "TESTING",
        /// Pre-production check run on a production request.
        Review => "REVIEW",
    }
}

string_enum! {
    /// Aggregate result of a general check.
    CheckResult ("check result") {
        /// Checks have not finished yet.
        Processing => "PROCESSING",
        /// No sub-check failed.
        Success => "SUCCESS",
        /// At least one sub-check failed.
        Failed => "FAILED",
    }
}

string_enum! {
    /// Result of a single sub-check.
    SubCheckResult ("simple check result") {
        /// Nothing to report.
        Success => "SUCCESS",
        /// Something worth a look; does not fail the general check.
        Warning => "WARNING",
        /// The project cannot be promoted as is.
        Failed => "FAILED",
    }
}

string_enum! {
    /// Result of a transfer request.
    TransferResult ("transfer result") {
        /// Picked up by the promotion job.
        Processing => "PROCESSING",
        /// Promotion succeeded.
        Success => "SUCCESS",
        /// Retry budget exhausted.
        Failed => "FAILED",
        /// Last attempt failed; will be picked up again.
        Retrying => "RETRYING",
    }
}

string_enum! {
    /// Execution environment of a registry.
    Environment ("environment") {
        /// Development cluster.
        Dev => "DEV",
        /// Production cluster.
        Prod => "PROD",
    }
}

// ============================================================================
// Records
// ============================================================================

/// Identity of the project a version belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    /// Project id.
    pub id: ProjectId,
    /// Project name; also the project directory inside the repository.
    pub name: String,
    /// Output type.
    pub output_type: ProjectOutputType,
    /// Git flow type.
    pub git_flow: GitFlowType,
}

/// One sub-check result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubCheck {
    /// Human readable description of what was found.
    pub description: String,
    /// Outcome.
    pub result: SubCheckResult,
}

impl SubCheck {
    /// Successful sub-check.
    pub fn success(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            result: SubCheckResult::Success,
        }
    }

    /// Sub-check with a warning.
    pub fn warning(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            result: SubCheckResult::Warning,
        }
    }

    /// Failed sub-check.
    pub fn failed(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            result: SubCheckResult::Failed,
        }
    }
}

/// One verification run attached to a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralCheck {
    /// Check id.
    pub id: i64,
    /// Check kind.
    pub kind: CheckKind,
    /// Aggregate result.
    pub result: CheckResult,
    /// Ordered sub-check results.
    pub checks: Vec<SubCheck>,
    /// When the check was requested.
    pub created_at: DateTime<Utc>,
}

/// Data of the user who initiated a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRequestData {
    /// Login of the user.
    pub user_name: String,
    /// Email used as commit author.
    pub author_email: String,
    /// Display name used as commit author.
    pub author_name: String,
}

/// Handoff of a version from review to production git promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Request id.
    pub id: i64,
    /// Result, `None` until the promotion job picks it up.
    pub result: Option<TransferResult>,
    /// Remaining attempts.
    pub retry_counter: i32,
    /// Last error, set once the request fails for good.
    pub error_message: Option<String>,
    /// Requesting user.
    pub user: Option<UserRequestData>,
    /// Pull request reviewers.
    pub reviewers: Vec<String>,
    /// Pull request comment.
    pub comment: Option<String>,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
}

impl TransferRequest {
    /// Attempts a new transfer request gets.
    pub const RETRY_BUDGET: i32 = 3;

    /// Whether the request can still change.
    pub fn is_active(&self) -> bool {
        matches!(
            self.result,
            None | Some(TransferResult::Processing) | Some(TransferResult::Retrying)
        )
    }

    /// Whether the promotion job should pick the request up.
    pub fn is_pending(&self) -> bool {
        matches!(self.result, None | Some(TransferResult::Retrying)) && self.error_message.is_none()
    }

    /// Record a successful promotion.
    pub fn register_success(&mut self) {
        self.result = Some(TransferResult::Success);
    }

    /// Record a failed promotion attempt.
    ///
    /// The retry counter never goes below zero; the request becomes FAILED
    /// with the given error exactly when it reaches zero.
    pub fn register_failure(&mut self, error: impl Into<String>) {
        self.retry_counter = (self.retry_counter - 1).max(0);
        if self.retry_counter == 0 {
            self.result = Some(TransferResult::Failed);
            self.error_message = Some(error.into());
        } else {
            self.result = Some(TransferResult::Retrying);
        }
    }
}

/// Transfer request to be created alongside a check completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransferRequest {
    /// Requesting user.
    pub user: UserRequestData,
    /// Pull request reviewers.
    pub reviewers: Vec<String>,
    /// Pull request comment.
    pub comment: Option<String>,
}

/// Status-transition timestamps, one per status reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTimestamps {
    /// Moved to TESTING.
    pub testing: Option<DateTime<Utc>>,
    /// Moved to PROD_REQUEST.
    pub prod_request: Option<DateTime<Utc>>,
    /// Moved to PROD_REVIEW.
    pub prod_review: Option<DateTime<Utc>>,
    /// Moved to PROD_RELEASE.
    pub prod_release: Option<DateTime<Utc>>,
    /// Moved to PRODUCTION.
    pub production: Option<DateTime<Utc>>,
    /// Moved to TURNED_OFF.
    pub turned_off: Option<DateTime<Utc>>,
}

impl StatusTimestamps {
    /// Timestamp slot of a status; DEVELOPING has none.
    pub fn slot_mut(&mut self, status: VersionStatus) -> Option<&mut Option<DateTime<Utc>>> {
        match status {
            VersionStatus::Developing => None,
            VersionStatus::Testing => Some(&mut self.testing),
            VersionStatus::ProdRequest => Some(&mut self.prod_request),
            VersionStatus::ProdReview => Some(&mut self.prod_review),
            VersionStatus::ProdRelease => Some(&mut self.prod_release),
            VersionStatus::Production => Some(&mut self.production),
            VersionStatus::TurnedOff => Some(&mut self.turned_off),
        }
    }
}

/// Unit of lifecycle tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtlProjectVersion {
    /// Version id.
    pub id: VersionId,
    /// Owning project.
    pub project: ProjectInfo,
    /// Version label.
    pub version: VersionLabel,
    /// Lifecycle status.
    pub status: VersionStatus,
    /// Jira task the version implements.
    pub jira_task: Option<String>,
    /// Development branch.
    pub branch_name: Option<String>,
    /// Development branch URI.
    pub dev_branch_uri: Option<String>,
    /// Production branch URI (two-repo flow).
    pub prod_branch_uri: Option<String>,
    /// Pull request URL (one-repo flow).
    pub pull_request_url: Option<String>,
    /// Cron schedule of the DAG.
    pub schedule_interval: Option<String>,
    /// Author display name.
    pub author_name: Option<String>,
    /// Author email.
    pub author_email: Option<String>,
    /// Status-transition timestamps.
    pub timestamps: StatusTimestamps,
    /// Master commit the next version replaced.
    pub master_commit_hash: Option<String>,
    /// Checks, oldest first.
    pub checks: Vec<GeneralCheck>,
    /// Transfer requests, oldest first.
    pub transfer_requests: Vec<TransferRequest>,
    /// Users assigned to the version.
    pub user_ids: Vec<i64>,
}

impl EtlProjectVersion {
    /// Create a version with only the identifying fields set.
    pub fn new(
        id: VersionId,
        project: ProjectInfo,
        version: VersionLabel,
        status: VersionStatus,
    ) -> Self {
        Self {
            id,
            project,
            version,
            status,
            jira_task: None,
            branch_name: None,
            dev_branch_uri: None,
            prod_branch_uri: None,
            pull_request_url: None,
            schedule_interval: None,
            author_name: None,
            author_email: None,
            timestamps: StatusTimestamps::default(),
            master_commit_hash: None,
            checks: Vec::new(),
            transfer_requests: Vec::new(),
            user_ids: Vec::new(),
        }
    }

    /// Project/label key of this version.
    pub fn key(&self) -> VersionKey {
        VersionKey::new(self.project.id, self.version)
    }

    /// The check still running, if any.
    pub fn processing_check(&self) -> Option<&GeneralCheck> {
        self.checks
            .iter()
            .find(|c| c.result == CheckResult::Processing)
    }

    /// Find a check by id.
    pub fn find_check(&self, check_id: i64) -> Option<&GeneralCheck> {
        self.checks.iter().find(|c| c.id == check_id)
    }

    /// Most recent transfer request.
    pub fn latest_transfer_request(&self) -> Option<&TransferRequest> {
        self.transfer_requests.iter().max_by_key(|t| t.id)
    }
}

/// A persisted history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Record id.
    pub id: i64,
    /// Version the event belongs to.
    pub version_id: VersionId,
    /// Event name.
    pub name: String,
    /// Previous value.
    pub old_value: Option<String>,
    /// New value.
    pub new_value: Option<String>,
    /// Actor.
    pub author: Option<String>,
    /// When the event happened.
    pub created_at: DateTime<Utc>,
    /// Free-form extra data.
    pub extra_data: Option<serde_json::Value>,
}

/// A history record to be appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewHistoryEvent {
    /// Version the event belongs to.
    pub version_id: VersionId,
    /// Event name.
    pub name: String,
    /// Previous value.
    pub old_value: Option<String>,
    /// New value.
    pub new_value: Option<String>,
    /// Actor.
    pub author: Option<String>,
    /// When the event happened.
    pub created_at: DateTime<Utc>,
    /// Free-form extra data.
    pub extra_data: Option<serde_json::Value>,
}
