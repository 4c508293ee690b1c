// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Production transfer reconciliation.
//!
//! An external promotion job lists the versions waiting for git promotion,
//! pushes them, and reports back one outcome per version. Each outcome is
//! applied as one atomic unit.

use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::lifecycle::{Lifecycle, StatusTransition};
use crate::model::{GitFlowType, VersionKey, VersionStatus};
use crate::store::{PendingTransfer, TransferUpdate};

/// Links created by a successful promotion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionLinks {
    /// Production branch URL (two-repo flow).
    pub git_branch_url: Option<String>,
    /// Pull request URL (one-repo flow).
    pub pull_request_url: Option<String>,
}

/// Reported result of promoting one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Version that was promoted.
    pub key: VersionKey,
    /// Links on success, error message on failure.
    pub result: std::result::Result<PromotionLinks, String>,
}

/// Counts of applied outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Versions moved to PROD_REVIEW.
    pub promoted: usize,
    /// Failures that still have retries left.
    pub retrying: usize,
    /// Failures that used up the retry budget.
    pub failed: usize,
    /// Outcomes that could not be applied.
    pub skipped: usize,
}

/// Applies promotion outcomes to versions in PROD_REQUEST.
#[derive(Clone)]
pub struct TransferReconciler {
    lifecycle: Lifecycle,
}

impl TransferReconciler {
    /// Create a reconciler.
    pub fn new(lifecycle: Lifecycle) -> Self {
        Self { lifecycle }
    }

    /// Versions waiting for promotion.
    ///
    /// With `mark_processing` their transfer requests become PROCESSING, so a
    /// second listing does not return them again.
    pub async fn list_pending(&self, mark_processing: bool) -> Result<Vec<PendingTransfer>> {
        let _guard = self.lifecycle.lock().lock().await;
        Ok(self
            .lifecycle
            .store()
            .list_pending_transfers(mark_processing)
            .await?)
    }

    /// Apply reported outcomes.
    ///
    /// `master_commit` is the master commit the promoted versions replace; it
    /// is recorded on each promoted version's predecessor.
    pub async fn apply_outcomes(
        &self,
        outcomes: Vec<TransferOutcome>,
        master_commit: Option<String>,
    ) -> TransferReport {
        let mut report = TransferReport::default();

        for outcome in outcomes {
            let key = outcome.key;
            match self.apply_outcome(outcome, master_commit.clone()).await {
                Ok(Some(status)) => match status {
                    Applied::Promoted => report.promoted += 1,
                    Applied::Retrying => report.retrying += 1,
                    Applied::Failed => report.failed += 1,
                },
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.skipped += 1;
                    error!(
                        project_id = key.project_id,
                        version = %key.version,
                        error = %e,
                        "Failed to apply transfer outcome"
                    );
                }
            }
        }

        report
    }

    async fn apply_outcome(
        &self,
        outcome: TransferOutcome,
        master_commit: Option<String>,
    ) -> Result<Option<Applied>> {
        let key = outcome.key;
        let _guard = self.lifecycle.lock().lock().await;

        let Some(version) = self.lifecycle.store().find_version(key).await? else {
            warn!(project_id = key.project_id, version = %key.version, "Transfer outcome for unknown version");
            return Ok(None);
        };
        if version.status != VersionStatus::ProdRequest {
            warn!(
                project_id = key.project_id,
                version = %key.version,
                status = %version.status,
                "Transfer outcome for version not in PROD_REQUEST"
            );
            return Ok(None);
        }
        let Some(mut request) = version.latest_transfer_request().cloned() else {
            warn!(project_id = key.project_id, version = %key.version, "Transfer outcome without transfer request");
            return Ok(None);
        };
        if !request.is_active() {
            warn!(
                project_id = key.project_id,
                version = %key.version,
                request_id = request.id,
                result = ?request.result,
                "Transfer outcome for finished transfer request"
            );
            return Ok(None);
        }

        let mut update = TransferUpdate {
            version_id: version.id,
            transition: None,
            prod_branch_uri: None,
            pull_request_url: None,
            transfer_request: None,
            predecessor: None,
            master_commit_hash: None,
        };

        let applied = match outcome.result {
            Ok(links) => {
                let actor = request.user.as_ref().map(|u| u.user_name.clone());
                update.transition = Some(StatusTransition::new(
                    version.status,
                    VersionStatus::ProdReview,
                    actor,
                    Utc::now(),
                )?);
                match version.project.git_flow {
                    GitFlowType::TwoRepos => update.prod_branch_uri = links.git_branch_url,
                    GitFlowType::OneRepo => update.pull_request_url = links.pull_request_url,
                }
                if let Some(previous) = version.version.predecessor() {
                    update.predecessor = Some(VersionKey::new(key.project_id, previous));
                    update.master_commit_hash = master_commit;
                }
                request.register_success();
                Applied::Promoted
            }
            Err(message) => {
                request.register_failure(message);
                if request.error_message.is_some() {
                    Applied::Failed
                } else {
                    Applied::Retrying
                }
            }
        };
        update.transfer_request = Some(request);

        self.lifecycle.store().apply_transfer_update(&update).await?;

        match applied {
            Applied::Promoted => info!(project_id = key.project_id, version = %key.version, "Version promoted to PROD_REVIEW"),
            Applied::Retrying => warn!(project_id = key.project_id, version = %key.version, "Promotion failed, will retry"),
            Applied::Failed => error!(project_id = key.project_id, version = %key.version, "Promotion failed, retries exhausted"),
        }
        Ok(Some(applied))
    }
}

#[derive(Debug, Clone, Copy)]
enum Applied {
    Promoted,
    Retrying,
    Failed,
}
