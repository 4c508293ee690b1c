// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Record store abstraction.
//!
//! The lifecycle engine only needs a narrow set of operations from the
//! record store. Every multi-step operation is atomic: either every write
//! lands or none does.
//!
//! Implementations:
//! - [`PostgresStore`]: production adapter over sqlx
//! - [`MemoryStore`]: in-process store for tests and embedding

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::lifecycle::StatusTransition;
use crate::model::{
    CheckKind, CheckResult, EtlProjectVersion, GeneralCheck, HistoryRecord, NewHistoryEvent,
    NewTransferRequest, ProjectId, SubCheck, TransferRequest, UnknownVariant, VersionId,
    VersionKey, VersionStatus,
};

/// Errors from record store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Version was not found.
    #[error("Version {0} not found")]
    VersionNotFound(VersionId),

    /// Check was not found on the version.
    #[error("Check {check_id} not found on version {version_id}")]
    CheckNotFound {
        /// Version id.
        version_id: VersionId,
        /// Check id.
        check_id: i64,
    },

    /// Transfer request was not found on the version.
    #[error("Transfer request {request_id} not found on version {version_id}")]
    TransferRequestNotFound {
        /// Version id.
        version_id: VersionId,
        /// Request id.
        request_id: i64,
    },

    /// The version's status changed since it was read.
    #[error("Status conflict on version {version_id}: expected {expected}, found {actual}")]
    StatusConflict {
        /// Version id.
        version_id: VersionId,
        /// Status the transition started from.
        expected: VersionStatus,
        /// Status found in the store.
        actual: VersionStatus,
    },

    /// A stored value could not be decoded.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

impl From<UnknownVariant> for StoreError {
    fn from(e: UnknownVariant) -> Self {
        Self::InvalidData(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Final result of a general check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckCompletion {
    /// Check to complete.
    pub check_id: i64,
    /// Aggregate result.
    pub result: CheckResult,
    /// Sub-check results replacing the stored ones.
    pub checks: Vec<SubCheck>,
    /// Transfer request created in the same unit, for successful REVIEW checks.
    pub transfer_request: Option<NewTransferRequest>,
}

/// A version waiting for production git promotion.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTransfer {
    /// The version, in PROD_REQUEST.
    pub version: EtlProjectVersion,
    /// Its latest transfer request.
    pub request: TransferRequest,
}

/// Versions changed by a promotion to PRODUCTION.
#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    /// The version now in PRODUCTION.
    pub promoted: EtlProjectVersion,
    /// Versions of the same project moved from PRODUCTION to TURNED_OFF.
    pub turned_off: Vec<EtlProjectVersion>,
}

/// Changes applied for one promotion outcome, atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferUpdate {
    /// Version the outcome belongs to.
    pub version_id: VersionId,
    /// Status change, on success.
    pub transition: Option<StatusTransition>,
    /// New production branch URI.
    pub prod_branch_uri: Option<String>,
    /// New pull request URL.
    pub pull_request_url: Option<String>,
    /// Updated transfer request.
    pub transfer_request: Option<TransferRequest>,
    /// Previous version whose prior-master commit reference is set.
    pub predecessor: Option<VersionKey>,
    /// Commit recorded on the previous version.
    pub master_commit_hash: Option<String>,
}

/// Record store operations used by the lifecycle engine.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Load a version by id.
    async fn get_version(&self, id: VersionId) -> Result<Option<EtlProjectVersion>>;

    /// Load a version by project and label.
    async fn find_version(&self, key: VersionKey) -> Result<Option<EtlProjectVersion>>;

    /// Load every existing version among `keys`.
    async fn find_versions(&self, keys: &[VersionKey]) -> Result<Vec<EtlProjectVersion>>;

    /// The PRODUCTION version of a project other than `exclude`, if any.
    async fn find_active_production(
        &self,
        project_id: ProjectId,
        exclude: VersionId,
    ) -> Result<Option<EtlProjectVersion>>;

    /// Create a PROCESSING check on a version.
    async fn create_check(&self, version_id: VersionId, kind: CheckKind) -> Result<GeneralCheck>;

    /// Store the final result of a check, creating the transfer request if any.
    async fn complete_check(&self, version_id: VersionId, completion: &CheckCompletion)
    -> Result<()>;

    /// Replace the schedule of a version.
    async fn update_schedule(&self, version_id: VersionId, schedule: &str) -> Result<()>;

    /// Change the status if it still equals `transition.from`, writing history.
    ///
    /// Fails with [`StoreError::StatusConflict`] and writes nothing otherwise.
    async fn apply_transition(
        &self,
        version_id: VersionId,
        transition: &StatusTransition,
    ) -> Result<EtlProjectVersion>;

    /// Apply a transition to PRODUCTION and turn off every other PRODUCTION
    /// version of the project, writing history for each change.
    ///
    /// Either every change lands or none does.
    async fn apply_promotion(
        &self,
        version_id: VersionId,
        transition: &StatusTransition,
    ) -> Result<Promotion>;

    /// Append a history record.
    async fn add_history_event(&self, event: &NewHistoryEvent) -> Result<HistoryRecord>;

    /// History of a version, oldest first.
    async fn list_history(&self, version_id: VersionId) -> Result<Vec<HistoryRecord>>;

    /// Versions in PROD_REQUEST whose latest transfer request is pending.
    ///
    /// With `mark_processing` the requests are flipped to PROCESSING in the
    /// same unit, so concurrent listers do not pick them up twice.
    async fn list_pending_transfers(&self, mark_processing: bool) -> Result<Vec<PendingTransfer>>;

    /// Apply one promotion outcome.
    async fn apply_transfer_update(&self, update: &TransferUpdate) -> Result<()>;
}
