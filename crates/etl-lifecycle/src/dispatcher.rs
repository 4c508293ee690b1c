// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single consumer applying check and synchronize results to the record store.

use std::sync::Arc;

use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::lifecycle::WriteLock;
use crate::messages::{CheckEventResponse, ResultEvent, SynchronizeEventResponse};
use crate::model::{
    CheckKind, CheckResult, Environment, NewTransferRequest, ProjectOutputType, UserRequestData,
};
use crate::registry::ExecutionRegistry;
use crate::store::{CheckCompletion, RecordStore};

/// Drains the result queue and records outcomes.
pub struct ResultDispatcher {
    store: Arc<dyn RecordStore>,
    registry: Arc<dyn ExecutionRegistry>,
    lock: WriteLock,
    target_reviewers: Vec<String>,
    events: mpsc::UnboundedReceiver<ResultEvent>,
    shutdown: Arc<Notify>,
}

impl ResultDispatcher {
    /// Create a new dispatcher.
    pub fn new(
        store: Arc<dyn RecordStore>,
        registry: Arc<dyn ExecutionRegistry>,
        lock: WriteLock,
        events: mpsc::UnboundedReceiver<ResultEvent>,
    ) -> Self {
        Self {
            store,
            registry,
            lock,
            target_reviewers: Vec::new(),
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Reviewers requested on pull requests of TARGETS projects.
    pub fn with_target_reviewers(mut self, reviewers: Vec<String>) -> Self {
        self.target_reviewers = reviewers;
        self
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the dispatcher loop.
    pub async fn run(mut self) {
        info!("Result dispatcher started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Result dispatcher received shutdown signal");
                    break;
                }

                event = self.events.recv() => {
                    let Some(event) = event else {
                        info!("Result queue closed");
                        break;
                    };
                    if let Err(e) = self.dispatch(event).await {
                        error!(error = %e, "Failed to apply result event");
                    }
                }
            }
        }

        info!("Result dispatcher stopped");
    }

    /// Apply one result event.
    pub async fn dispatch(&self, event: ResultEvent) -> Result<()> {
        match event {
            ResultEvent::Check(response) => self.apply_check(response).await,
            ResultEvent::Synchronize(response) => self.apply_synchronize(response).await,
        }
    }

    async fn apply_check(&self, response: CheckEventResponse) -> Result<()> {
        let request = &response.request;
        let key = request.key();

        let _guard = self.lock.lock().await;

        let version = self
            .store
            .find_version(key)
            .await?
            .ok_or(Error::VersionNotFound(key))?;

        let check = version
            .find_check(request.general_check_id)
            .ok_or(Error::CheckNotFound {
                key,
                check_id: request.general_check_id,
            })?;

        if check.result != CheckResult::Processing {
            warn!(
                project_id = key.project_id,
                version = %key.version,
                check_id = check.id,
                result = %check.result,
                "Check already completed; ignoring duplicate result"
            );
            return Ok(());
        }

        let transfer_request = match (&request.user_data, request.check_kind, response.result) {
            (Some(user), CheckKind::Review, CheckResult::Success) => {
                Some(self.transfer_request(user.clone(), request.project_type))
            }
            _ => None,
        };
        let creates_transfer = transfer_request.is_some();

        self.store
            .complete_check(
                version.id,
                &CheckCompletion {
                    check_id: check.id,
                    result: response.result,
                    checks: response.checks.clone(),
                    transfer_request,
                },
            )
            .await?;

        info!(
            project_id = key.project_id,
            version = %key.version,
            check_id = request.general_check_id,
            result = %response.result,
            transfer_requested = creates_transfer,
            "Check result recorded"
        );
        Ok(())
    }

    fn transfer_request(
        &self,
        user: UserRequestData,
        output_type: ProjectOutputType,
    ) -> NewTransferRequest {
        if output_type != ProjectOutputType::Targets || self.target_reviewers.is_empty() {
            return NewTransferRequest {
                user,
                reviewers: Vec::new(),
                comment: None,
            };
        }

        let mentions = self
            .target_reviewers
            .iter()
            .map(|r| format!("@{r}"))
            .collect::<Vec<_>>()
            .join(", ");
        NewTransferRequest {
            user,
            reviewers: self.target_reviewers.clone(),
            comment: Some(format!(
                "Before merging this pull request, {mentions} must review the code"
            )),
        }
    }

    async fn apply_synchronize(&self, response: SynchronizeEventResponse) -> Result<()> {
        let key = response.request.key();

        let schedule = match (response.schedule_interval, response.error_message) {
            (Some(schedule), None) => schedule,
            (_, error) => {
                error!(
                    project_id = key.project_id,
                    version = %key.version,
                    error = error.as_deref().unwrap_or("no schedule"),
                    "Schedule synchronization failed"
                );
                return Ok(());
            }
        };

        {
            let _guard = self.lock.lock().await;

            let version = self
                .store
                .find_version(key)
                .await?
                .ok_or(Error::VersionNotFound(key))?;

            if version.schedule_interval.as_deref() == Some(schedule.as_str()) {
                debug!(
                    project_id = key.project_id,
                    version = %key.version,
                    "Schedule unchanged"
                );
                return Ok(());
            }

            self.store.update_schedule(version.id, &schedule).await?;
        }

        info!(
            project_id = key.project_id,
            version = %key.version,
            schedule = %schedule,
            "Schedule updated"
        );

        if let Err(e) = self
            .registry
            .update_schedule(Environment::Prod, key, &schedule)
            .await
        {
            error!(
                project_id = key.project_id,
                version = %key.version,
                error = %e,
                "Failed to push schedule to the execution registry"
            );
        }
        Ok(())
    }
}
