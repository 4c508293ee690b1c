// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker running project checks.
//!
//! The checker takes [`CheckEventRequest`]s off its queue one at a time,
//! clones the project at the requested reference, runs the [`CheckRunner`]
//! against the project directory and emits exactly one
//! [`CheckEventResponse`] per request on the result queue, even when the
//! clone or the checks themselves fail.

use std::sync::Arc;

use tokio::sync::{Notify, mpsc};
use tracing::{error, info, warn};

use crate::checks::{CheckOutcome, CheckRunner, aggregate};
use crate::messages::{CheckEventRequest, CheckEventResponse, ResultEvent};
use crate::model::SubCheck;
use crate::snapshot::{RepositorySnapshot, SnapshotSettings};

/// Background worker that runs checks for queued requests.
pub struct ProjectChecker {
    settings: SnapshotSettings,
    runner: Arc<CheckRunner>,
    requests: mpsc::UnboundedReceiver<CheckEventRequest>,
    results: mpsc::UnboundedSender<ResultEvent>,
    shutdown: Arc<Notify>,
}

impl ProjectChecker {
    /// Create a new checker.
    pub fn new(
        settings: SnapshotSettings,
        runner: Arc<CheckRunner>,
        requests: mpsc::UnboundedReceiver<CheckEventRequest>,
        results: mpsc::UnboundedSender<ResultEvent>,
    ) -> Self {
        Self {
            settings,
            runner,
            requests,
            results,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the checker loop.
    ///
    /// The loop exits when the shutdown signal is received or the request
    /// queue is closed.
    pub async fn run(mut self) {
        info!(checks = ?self.runner.check_names(), "Project checker started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Project checker received shutdown signal");
                    self.abandon_queued();
                    break;
                }

                request = self.requests.recv() => {
                    let Some(request) = request else {
                        warn!("Check request queue closed");
                        break;
                    };
                    let response = self.process(request).await;
                    if self.results.send(ResultEvent::Check(response)).is_err() {
                        error!("Result queue closed; dropping check result");
                        break;
                    }
                }
            }
        }

        info!("Project checker stopped");
    }

    /// Close the request queue and fail every request still waiting in it.
    ///
    /// Each queued check already exists as PROCESSING in the record store and
    /// would otherwise never complete.
    fn abandon_queued(&mut self) {
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            warn!(
                project_id = request.etl_project_id,
                version = %request.etl_project_version,
                check_id = request.general_check_id,
                "Project checker stopped before running queued check"
            );
            let checks = vec![SubCheck::failed("Project checker stopped before running the check")];
            let response = CheckEventResponse {
                result: aggregate(&checks),
                checks,
                request,
            };
            if self.results.send(ResultEvent::Check(response)).is_err() {
                error!("Result queue closed; dropping check result");
                return;
            }
        }
    }

    /// Run checks for one request.
    pub async fn process(&self, request: CheckEventRequest) -> CheckEventResponse {
        info!(
            project_id = request.etl_project_id,
            version = %request.etl_project_version,
            check_id = request.general_check_id,
            kind = %request.check_kind,
            "Running project checks"
        );

        let outcome = match self.run_checks(&request).await {
            Ok(outcome) => outcome,
            Err(detail) => {
                error!(
                    project_id = request.etl_project_id,
                    version = %request.etl_project_version,
                    error = %detail,
                    "Project checks could not run"
                );
                let checks = vec![SubCheck::failed(detail)];
                CheckOutcome {
                    result: aggregate(&checks),
                    checks,
                }
            }
        };

        info!(
            project_id = request.etl_project_id,
            version = %request.etl_project_version,
            result = %outcome.result,
            "Project checks finished"
        );

        CheckEventResponse {
            result: outcome.result,
            checks: outcome.checks,
            request,
        }
    }

    async fn run_checks(&self, request: &CheckEventRequest) -> Result<CheckOutcome, String> {
        let snapshot =
            RepositorySnapshot::acquire(&self.settings, &request.git_repo, &request.branch_name)
                .await
                .map_err(|e| e.to_string())?;

        let runner = self.runner.clone();
        let project_name = request.etl_project_name.clone();
        let output_type = request.project_type;

        // The snapshot moves into the blocking task so the clone outlives the scan.
        tokio::task::spawn_blocking(move || {
            let outcome = runner.run(&snapshot.project_dir(&project_name), output_type);
            drop(snapshot);
            outcome
        })
        .await
        .map_err(|e| format!("Checks panicked: {e}"))
    }
}
