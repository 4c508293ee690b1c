// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory record store.
//!
//! Keeps every version behind one mutex; operations mutate a copy and commit
//! it only when every step succeeded, which gives the same all-or-nothing
//! behavior as the PostgreSQL store.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{
    CheckCompletion, PendingTransfer, Promotion, RecordStore, Result, StoreError,
    TransferUpdate,
};
use crate::lifecycle::StatusTransition;
use crate::model::{
    CheckKind, CheckResult, EtlProjectVersion, GeneralCheck, HistoryRecord, NewHistoryEvent,
    ProjectId, TransferRequest, TransferResult, VersionId, VersionKey, VersionStatus,
};

#[derive(Default)]
struct State {
    versions: BTreeMap<VersionId, EtlProjectVersion>,
    history: Vec<HistoryRecord>,
    next_id: i64,
    failing: HashSet<VersionId>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn version(&self, id: VersionId) -> Result<&EtlProjectVersion> {
        self.versions.get(&id).ok_or(StoreError::VersionNotFound(id))
    }

    fn push_history(&mut self, event: &NewHistoryEvent) -> HistoryRecord {
        let record = HistoryRecord {
            id: self.next_id(),
            version_id: event.version_id,
            name: event.name.clone(),
            old_value: event.old_value.clone(),
            new_value: event.new_value.clone(),
            author: event.author.clone(),
            created_at: event.created_at,
            extra_data: event.extra_data.clone(),
        };
        self.history.push(record.clone());
        record
    }

    /// Validate and apply a transition to a copy of the version.
    fn transitioned(
        &self,
        version_id: VersionId,
        transition: &StatusTransition,
    ) -> Result<EtlProjectVersion> {
        if self.failing.contains(&version_id) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut version = self.version(version_id)?.clone();
        if version.status != transition.from {
            return Err(StoreError::StatusConflict {
                version_id,
                expected: transition.from,
                actual: version.status,
            });
        }
        version.status = transition.to;
        transition.apply_timestamps(&mut version.timestamps);
        Ok(version)
    }
}

/// Record store kept in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a version as is.
    pub async fn insert_version(&self, version: EtlProjectVersion) {
        let mut state = self.state.lock().await;
        state.next_id = state.next_id.max(version.id);
        for check in &version.checks {
            state.next_id = state.next_id.max(check.id);
        }
        for request in &version.transfer_requests {
            state.next_id = state.next_id.max(request.id);
        }
        state.versions.insert(version.id, version);
    }

    /// Make every status transition of a version fail as if the database were down.
    pub async fn fail_transitions_for(&self, version_id: VersionId) {
        self.state.lock().await.failing.insert(version_id);
    }

    /// Let transitions of a version succeed again.
    pub async fn recover_transitions_for(&self, version_id: VersionId) {
        self.state.lock().await.failing.remove(&version_id);
    }

    /// Snapshot of a version.
    pub async fn version(&self, version_id: VersionId) -> Option<EtlProjectVersion> {
        self.state.lock().await.versions.get(&version_id).cloned()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_version(&self, id: VersionId) -> Result<Option<EtlProjectVersion>> {
        Ok(self.state.lock().await.versions.get(&id).cloned())
    }

    async fn find_version(&self, key: VersionKey) -> Result<Option<EtlProjectVersion>> {
        let state = self.state.lock().await;
        Ok(state.versions.values().find(|v| v.key() == key).cloned())
    }

    async fn find_versions(&self, keys: &[VersionKey]) -> Result<Vec<EtlProjectVersion>> {
        let keys: HashSet<_> = keys.iter().copied().collect();
        let state = self.state.lock().await;
        Ok(state
            .versions
            .values()
            .filter(|v| keys.contains(&v.key()))
            .cloned()
            .collect())
    }

    async fn find_active_production(
        &self,
        project_id: ProjectId,
        exclude: VersionId,
    ) -> Result<Option<EtlProjectVersion>> {
        let state = self.state.lock().await;
        Ok(state
            .versions
            .values()
            .find(|v| {
                v.project.id == project_id
                    && v.id != exclude
                    && v.status == VersionStatus::Production
            })
            .cloned())
    }

    async fn create_check(&self, version_id: VersionId, kind: CheckKind) -> Result<GeneralCheck> {
        let mut state = self.state.lock().await;
        state.version(version_id)?;
        let check = GeneralCheck {
            id: state.next_id(),
            kind,
            result: CheckResult::Processing,
            checks: Vec::new(),
            created_at: Utc::now(),
        };
        if let Some(version) = state.versions.get_mut(&version_id) {
            version.checks.push(check.clone());
        }
        Ok(check)
    }

    async fn complete_check(
        &self,
        version_id: VersionId,
        completion: &CheckCompletion,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut version = state.version(version_id)?.clone();

        let check = version
            .checks
            .iter_mut()
            .find(|c| c.id == completion.check_id)
            .ok_or(StoreError::CheckNotFound {
                version_id,
                check_id: completion.check_id,
            })?;
        check.result = completion.result;
        check.checks = completion.checks.clone();

        if let Some(request) = &completion.transfer_request {
            version.transfer_requests.push(TransferRequest {
                id: state.next_id(),
                result: None,
                retry_counter: TransferRequest::RETRY_BUDGET,
                error_message: None,
                user: Some(request.user.clone()),
                reviewers: request.reviewers.clone(),
                comment: request.comment.clone(),
                created_at: Utc::now(),
            });
        }

        state.versions.insert(version_id, version);
        Ok(())
    }

    async fn update_schedule(&self, version_id: VersionId, schedule: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let version = state
            .versions
            .get_mut(&version_id)
            .ok_or(StoreError::VersionNotFound(version_id))?;
        version.schedule_interval = Some(schedule.to_string());
        Ok(())
    }

    async fn apply_transition(
        &self,
        version_id: VersionId,
        transition: &StatusTransition,
    ) -> Result<EtlProjectVersion> {
        let mut state = self.state.lock().await;
        let version = state.transitioned(version_id, transition)?;
        state.push_history(&transition.history_event(version_id));
        state.versions.insert(version_id, version.clone());
        Ok(version)
    }

    async fn apply_promotion(
        &self,
        version_id: VersionId,
        transition: &StatusTransition,
    ) -> Result<Promotion> {
        let mut state = self.state.lock().await;
        let promoted = state.transitioned(version_id, transition)?;

        let turn_off = StatusTransition::turn_off(transition.actor.clone(), transition.at);
        let replaced: Vec<VersionId> = state
            .versions
            .values()
            .filter(|v| {
                v.project.id == promoted.project.id
                    && v.id != version_id
                    && v.status == VersionStatus::Production
            })
            .map(|v| v.id)
            .collect();
        let turned_off = replaced
            .into_iter()
            .map(|id| state.transitioned(id, &turn_off))
            .collect::<Result<Vec<_>>>()?;

        state.push_history(&transition.history_event(version_id));
        state.versions.insert(version_id, promoted.clone());
        for version in &turned_off {
            state.push_history(&turn_off.history_event(version.id));
            state.versions.insert(version.id, version.clone());
        }

        Ok(Promotion {
            promoted,
            turned_off,
        })
    }

    async fn add_history_event(&self, event: &NewHistoryEvent) -> Result<HistoryRecord> {
        let mut state = self.state.lock().await;
        state.version(event.version_id)?;
        Ok(state.push_history(event))
    }

    async fn list_history(&self, version_id: VersionId) -> Result<Vec<HistoryRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|h| h.version_id == version_id)
            .cloned()
            .collect())
    }

    async fn list_pending_transfers(&self, mark_processing: bool) -> Result<Vec<PendingTransfer>> {
        let mut state = self.state.lock().await;
        let mut pending = Vec::new();

        for version in state.versions.values_mut() {
            if version.status != VersionStatus::ProdRequest {
                continue;
            }
            let Some(request) = version.transfer_requests.iter_mut().max_by_key(|t| t.id) else {
                continue;
            };
            if !request.is_pending() {
                continue;
            }
            if mark_processing {
                request.result = Some(TransferResult::Processing);
            }
            let request = request.clone();
            pending.push(PendingTransfer {
                version: version.clone(),
                request,
            });
        }

        Ok(pending)
    }

    async fn apply_transfer_update(&self, update: &TransferUpdate) -> Result<()> {
        let mut state = self.state.lock().await;

        let mut version = match &update.transition {
            Some(transition) => state.transitioned(update.version_id, transition)?,
            None => state.version(update.version_id)?.clone(),
        };

        if let Some(uri) = &update.prod_branch_uri {
            version.prod_branch_uri = Some(uri.clone());
        }
        if let Some(url) = &update.pull_request_url {
            version.pull_request_url = Some(url.clone());
        }
        if let Some(request) = &update.transfer_request {
            let stored = version
                .transfer_requests
                .iter_mut()
                .find(|t| t.id == request.id)
                .ok_or(StoreError::TransferRequestNotFound {
                    version_id: update.version_id,
                    request_id: request.id,
                })?;
            *stored = request.clone();
        }

        let predecessor_id = update.predecessor.and_then(|key| {
            state
                .versions
                .values()
                .find(|v| v.key() == key)
                .map(|v| v.id)
        });

        if let Some(transition) = &update.transition {
            state.push_history(&transition.history_event(update.version_id));
        }
        if let (Some(id), Some(hash)) = (predecessor_id, &update.master_commit_hash)
            && let Some(previous) = state.versions.get_mut(&id)
        {
            previous.master_commit_hash = Some(hash.clone());
        }
        state.versions.insert(update.version_id, version);
        Ok(())
    }
}
