// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status state machine for project versions.
//!
//! ```text
//! DEVELOPING ──dev SUCCESS──► TESTING ──send to prod──► PROD_REQUEST
//!                                                            │ branch / PR created
//!                                                            ▼
//!            PRODUCTION ◄──prod SUCCESS── PROD_RELEASE ◄──prod FAIL── PROD_REVIEW
//!                 ▲                                                      │
//!                 └─────────────────────prod SUCCESS─────────────────────┘
//!
//! PRODUCTION ──newer version reaches PRODUCTION──► TURNED_OFF
//! ```
//!
//! [`StatusTransition`] validates an edge and knows which timestamps and which
//! history record it produces. [`Lifecycle`] applies transitions through the
//! record store under the [`WriteLock`]. A promotion to PRODUCTION and the
//! turn-off of the replaced version commit together.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::model::{
    Environment, EtlProjectVersion, NewHistoryEvent, StatusTimestamps, VersionId, VersionStatus,
};
use crate::registry::{MonitoringClient, RunOutcome};
use crate::store::RecordStore;

/// Name of the history event written by every status change.
pub const STATUS_CHANGE_EVENT: &str = "Status change";

/// Process-wide lock serializing check, transfer request and status mutations.
///
/// Held for the full read-modify-write sequence against the record store.
pub type WriteLock = Arc<Mutex<()>>;

/// Create a new write lock.
pub fn write_lock() -> WriteLock {
    Arc::new(Mutex::new(()))
}

/// Whether `from -> to` is an edge of the state machine.
pub fn is_allowed(from: VersionStatus, to: VersionStatus) -> bool {
    use VersionStatus::*;
    matches!(
        (from, to),
        (Developing, Testing)
            | (Testing, ProdRequest)
            | (ProdRequest, ProdReview)
            | (ProdReview, ProdRelease)
            | (ProdReview, Production)
            | (ProdRelease, Production)
            | (Production, TurnedOff)
    )
}

/// Status a run outcome moves a version to, if any.
///
/// Dev runs only promote DEVELOPING versions to TESTING. Prod runs move
/// PROD_REVIEW to PROD_RELEASE on failure and PROD_REVIEW or PROD_RELEASE to
/// PRODUCTION on success.
pub fn transition_for_run(
    env: Environment,
    status: VersionStatus,
    outcome: &RunOutcome,
) -> Option<VersionStatus> {
    use VersionStatus::*;
    match (env, status, outcome) {
        (Environment::Dev, Developing, RunOutcome::Success) => Some(Testing),
        (Environment::Prod, ProdReview, RunOutcome::Fail) => Some(ProdRelease),
        (Environment::Prod, ProdReview | ProdRelease, RunOutcome::Success) => Some(Production),
        _ => None,
    }
}

/// A validated status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    /// Expected current status; the store rejects the change if it differs.
    pub from: VersionStatus,
    /// New status.
    pub to: VersionStatus,
    /// Who or what caused the change.
    pub actor: Option<String>,
    /// Effective time of the change.
    pub at: DateTime<Utc>,
}

impl StatusTransition {
    /// Validate an edge of the state machine.
    pub fn new(
        from: VersionStatus,
        to: VersionStatus,
        actor: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Self> {
        if !is_allowed(from, to) {
            return Err(Error::IllegalTransition { from, to });
        }
        Ok(Self { from, to, actor, at })
    }

    /// The change turning off a production version replaced by a newer one.
    pub fn turn_off(actor: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            from: VersionStatus::Production,
            to: VersionStatus::TurnedOff,
            actor,
            at,
        }
    }

    /// Stamp the timestamps reached by this transition.
    ///
    /// The new status is always stamped. Reaching PRODUCTION also fills
    /// TESTING and PROD_RELEASE when they were never reached.
    pub fn apply_timestamps(&self, timestamps: &mut StatusTimestamps) {
        if let Some(slot) = timestamps.slot_mut(self.to) {
            *slot = Some(self.at);
        }
        if self.to == VersionStatus::Production {
            timestamps.testing.get_or_insert(self.at);
            timestamps.prod_release.get_or_insert(self.at);
        }
    }

    /// History record describing this transition.
    pub fn history_event(&self, version_id: VersionId) -> NewHistoryEvent {
        NewHistoryEvent {
            version_id,
            name: STATUS_CHANGE_EVENT.to_string(),
            old_value: Some(self.from.to_string()),
            new_value: Some(self.to.to_string()),
            author: self.actor.clone(),
            created_at: self.at,
            extra_data: None,
        }
    }
}

/// Applies status transitions and their side effects.
#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<dyn RecordStore>,
    lock: WriteLock,
    monitoring: Option<Arc<dyn MonitoringClient>>,
}

impl Lifecycle {
    /// Create a lifecycle bound to a store and write lock.
    pub fn new(store: Arc<dyn RecordStore>, lock: WriteLock) -> Self {
        Self {
            store,
            lock,
            monitoring: None,
        }
    }

    /// Disable monitoring of turned-off versions through this client.
    pub fn with_monitoring(mut self, monitoring: Arc<dyn MonitoringClient>) -> Self {
        self.monitoring = Some(monitoring);
        self
    }

    /// The write lock shared with the other lifecycle writers.
    pub fn lock(&self) -> &WriteLock {
        &self.lock
    }

    /// The record store.
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Move a version to `to`, writing history atomically with the change.
    ///
    /// Reaching PRODUCTION turns off the previously active production version
    /// of the same project in the same store unit.
    pub async fn transition(
        &self,
        version: &EtlProjectVersion,
        to: VersionStatus,
        actor: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<EtlProjectVersion> {
        let transition = StatusTransition::new(version.status, to, actor, at)?;

        let (updated, turned_off) = {
            let _guard = self.lock.lock().await;
            if to == VersionStatus::Production {
                let promotion = self.store.apply_promotion(version.id, &transition).await?;
                (promotion.promoted, promotion.turned_off)
            } else {
                let updated = self.store.apply_transition(version.id, &transition).await?;
                (updated, Vec::new())
            }
        };

        info!(
            project_id = version.project.id,
            version = %version.version,
            from = %transition.from,
            to = %transition.to,
            "Version status changed"
        );

        for previous in &turned_off {
            info!(
                project_id = previous.project.id,
                version = %previous.version,
                replaced_by = %updated.version,
                "Previous production version turned off"
            );
            self.disable_monitoring(previous);
        }

        Ok(updated)
    }

    /// Disable monitoring of a turned-off version in a detached task whose
    /// failure is only logged.
    fn disable_monitoring(&self, turned_off: &EtlProjectVersion) {
        let Some(monitoring) = self.monitoring.clone() else {
            warn!(
                project_id = turned_off.project.id,
                version = %turned_off.version,
                "No monitoring client configured; monitoring left enabled"
            );
            return;
        };

        let key = turned_off.key();
        tokio::spawn(async move {
            if let Err(e) = monitoring.disable_monitoring(key).await {
                error!(
                    project_id = key.project_id,
                    version = %key.version,
                    error = %e,
                    "Failed to disable monitoring"
                );
            }
        });
    }
}
