// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker reading the schedule a project declares.
//!
//! The schedule lives in `settings.yaml` at the project root under
//! `dag_settings.schedule_interval` and must be a plain five-field cron
//! expression. Any problem abandons the attempt; no partial schedule is
//! ever reported.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tracing::{error, info, warn};

use crate::messages::{ResultEvent, SynchronizeEventRequest, SynchronizeEventResponse};
use crate::snapshot::{RepositorySnapshot, SnapshotSettings};

/// Name of the settings file at the project root.
pub const SETTINGS_FILE: &str = "settings.yaml";

/// Why a schedule could not be read from a project.
#[derive(Debug, Error)]
pub enum ScheduleScanError {
    /// The settings file does not exist.
    #[error("Settings file {0} not found")]
    MissingSettings(PathBuf),

    /// The settings file is not valid YAML.
    #[error("Settings file is not valid YAML: {0}")]
    InvalidSettings(String),

    /// `dag_settings.schedule_interval` is absent or not a string.
    #[error("dag_settings.schedule_interval is not set")]
    MissingSchedule,

    /// The schedule is not a supported cron expression.
    #[error("Schedule {0:?} is not a valid cron expression")]
    InvalidSchedule(String),
}

/// Five space-separated fields: minute, hour, day of month, month, day of
/// week. Each is `*`, a number in range, or `*/` followed by one.
const CRON_PATTERN: &str = concat!(
    r"^(?:\*|[1-5]?[0-9]|\*/[1-5]?[0-9])",
    r" (?:\*|2[0-3]|1?[0-9]|\*/(?:2[0-3]|1?[0-9]))",
    r" (?:\*|3[01]|[12][0-9]|[1-9]|\*/(?:3[01]|[12][0-9]|[1-9]))",
    r" (?:\*|1[0-2]|[1-9]|\*/(?:1[0-2]|[1-9]))",
    r" (?:\*|[0-6]|\*/[0-6])$",
);

static CRON: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| Regex::new(CRON_PATTERN));

/// Whether `schedule` is a five-field cron expression this engine accepts.
pub fn is_valid_cron(schedule: &str) -> bool {
    CRON.as_ref().is_ok_and(|pattern| pattern.is_match(schedule))
}

/// Read and validate the schedule declared in a project directory.
pub fn scan_schedule(project_dir: &Path) -> Result<String, ScheduleScanError> {
    let path = project_dir.join(SETTINGS_FILE);
    let contents = std::fs::read_to_string(&path)
        .map_err(|_| ScheduleScanError::MissingSettings(path.clone()))?;

    let settings: serde_yaml_ng::Value = serde_yaml_ng::from_str(&contents)
        .map_err(|e| ScheduleScanError::InvalidSettings(e.to_string()))?;

    let schedule = settings
        .get("dag_settings")
        .and_then(|s| s.get("schedule_interval"))
        .and_then(|s| s.as_str())
        .ok_or(ScheduleScanError::MissingSchedule)?;

    if !is_valid_cron(schedule) {
        return Err(ScheduleScanError::InvalidSchedule(schedule.to_string()));
    }
    Ok(schedule.to_string())
}

/// Background worker that extracts schedules for queued requests.
pub struct ScheduleSynchronizer {
    settings: SnapshotSettings,
    requests: mpsc::UnboundedReceiver<SynchronizeEventRequest>,
    results: mpsc::UnboundedSender<ResultEvent>,
    shutdown: Arc<Notify>,
}

impl ScheduleSynchronizer {
    /// Create a new synchronizer.
    pub fn new(
        settings: SnapshotSettings,
        requests: mpsc::UnboundedReceiver<SynchronizeEventRequest>,
        results: mpsc::UnboundedSender<ResultEvent>,
    ) -> Self {
        Self {
            settings,
            requests,
            results,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the synchronizer loop.
    pub async fn run(mut self) {
        info!("Schedule synchronizer started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Schedule synchronizer received shutdown signal");
                    break;
                }

                request = self.requests.recv() => {
                    let Some(request) = request else {
                        warn!("Synchronize request queue closed");
                        break;
                    };
                    let response = self.process(request).await;
                    if self.results.send(ResultEvent::Synchronize(response)).is_err() {
                        error!("Result queue closed; dropping synchronize result");
                        break;
                    }
                }
            }
        }

        info!("Schedule synchronizer stopped");
    }

    /// Extract the schedule for one request.
    pub async fn process(&self, request: SynchronizeEventRequest) -> SynchronizeEventResponse {
        match self.read_schedule(&request).await {
            Ok(schedule) => {
                info!(
                    project_id = request.etl_project_id,
                    version = %request.etl_project_version,
                    schedule = %schedule,
                    "Schedule extracted"
                );
                SynchronizeEventResponse::found(request, schedule)
            }
            Err(detail) => {
                warn!(
                    project_id = request.etl_project_id,
                    version = %request.etl_project_version,
                    error = %detail,
                    "Schedule synchronization failed"
                );
                SynchronizeEventResponse::failed(request, detail)
            }
        }
    }

    async fn read_schedule(&self, request: &SynchronizeEventRequest) -> Result<String, String> {
        let snapshot =
            RepositorySnapshot::acquire(&self.settings, &request.git_repo, &request.branch_name)
                .await
                .map_err(|e| e.to_string())?;
        let project_name = request.etl_project_name.clone();

        tokio::task::spawn_blocking(move || {
            let schedule = scan_schedule(&snapshot.project_dir(&project_name));
            drop(snapshot);
            schedule
        })
        .await
        .map_err(|e| format!("Schedule scan panicked: {e}"))?
        .map_err(|e| e.to_string())
    }
}
