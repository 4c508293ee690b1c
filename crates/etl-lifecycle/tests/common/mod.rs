// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for etl-lifecycle integration tests.
//!
//! Provides local git repositories, registry/monitoring/backfill doubles and
//! version fixtures.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::mpsc;

use etl_lifecycle::backfill::{BackfillError, BackfillExecutor, CommandOutput};
use etl_lifecycle::messages::SshBackfillRequest;
use etl_lifecycle::model::{
    Environment, EtlProjectVersion, GitFlowType, ProjectInfo, ProjectOutputType, VersionKey,
    VersionLabel, VersionStatus,
};
use etl_lifecycle::registry::{
    EtlRun, ExecutionRegistry, MonitoringClient, ProjectRun, RegistryError, RunOutcome, RunWindow,
};
use etl_lifecycle::snapshot::{GitProtocol, SnapshotSettings};

/// Skip the test when no `git` binary is available.
#[allow(unused_macros)]
macro_rules! skip_if_no_git {
    () => {
        if !common::git_available() {
            eprintln!("Skipping test: git binary not found");
            return;
        }
    };
}

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

// ============================================================================
// Git repositories
// ============================================================================

/// A local repository with one commit on a feature branch.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    /// Create a repository whose `branch` holds `files` (paths relative to the repo root).
    pub fn with_branch(branch: &str, files: &[(&str, &str)]) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path();

        git(path, &["init", "--quiet"]);
        git(path, &["config", "user.email", "tests@example.com"]);
        git(path, &["config", "user.name", "Tests"]);
        std::fs::write(path.join("README.md"), "test repository\n").unwrap();
        git(path, &["add", "."]);
        git(path, &["commit", "--quiet", "-m", "initial"]);

        git(path, &["checkout", "--quiet", "-b", branch]);
        for (file, contents) in files {
            let full = path.join(file);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(full, contents).unwrap();
        }
        git(path, &["add", "."]);
        git(path, &["commit", "--quiet", "-m", "project"]);

        Self { dir }
    }

    /// Path passed as the repository of a request.
    pub fn repo(&self) -> String {
        self.dir.path().display().to_string()
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .status()
        .expect("Failed to run git");
    assert!(status.success(), "git {:?} failed", args);
}

/// Snapshot settings cloning from the local filesystem.
pub fn file_snapshot_settings() -> SnapshotSettings {
    SnapshotSettings {
        protocol: GitProtocol::File,
        timeout: Duration::from_secs(60),
        ..SnapshotSettings::default()
    }
}

/// Files of a project passing every check.
pub fn valid_project_files(project: &str, schedule: &str) -> Vec<(String, String)> {
    vec![
        (
            format!("{project}/settings.yaml"),
            format!("dag_settings:\n  schedule_interval: \"{schedule}\"\n"),
        ),
        (format!("{project}/requirements.txt"), "fs_etl==0.24.0\n".to_string()),
        (format!("{project}/features.yaml"), "features: []\n".to_string()),
        (format!("{project}/etl/main.py"), "def run():\n    return 1\n".to_string()),
    ]
}

pub fn as_refs(files: &[(String, String)]) -> Vec<(&str, &str)> {
    files.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect()
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn label(n: u32) -> VersionLabel {
    VersionLabel::new(n).expect("label must be positive")
}

pub fn project(id: i64, name: &str, output_type: ProjectOutputType, git_flow: GitFlowType) -> ProjectInfo {
    ProjectInfo {
        id,
        name: name.to_string(),
        output_type,
        git_flow,
    }
}

/// A FEATURES one-repo version with a branch and an author.
pub fn version(id: i64, project_id: i64, number: u32, status: VersionStatus) -> EtlProjectVersion {
    let mut version = EtlProjectVersion::new(
        id,
        project(
            project_id,
            &format!("project_{project_id}"),
            ProjectOutputType::Features,
            GitFlowType::OneRepo,
        ),
        label(number),
        status,
    );
    version.branch_name = Some(format!("feature/p{project_id}-v{number}"));
    version.author_name = Some("author".to_string());
    version.author_email = Some("author@example.com".to_string());
    version
}

pub fn run(id: i64, key: VersionKey, result: RunOutcome) -> ProjectRun {
    ProjectRun {
        etl_project_id: key.project_id,
        etl_project_version: key.version,
        etl_run: EtlRun {
            id,
            result,
            run_ts: Some(Utc::now()),
            dag_id: Some(format!("dag_{}_{}", key.project_id, key.version.number())),
            fs_etl_version: Some("0.24.0".to_string()),
        },
    }
}

// ============================================================================
// Execution registry double
// ============================================================================

#[derive(Default)]
struct RegistryState {
    recent: HashMap<Environment, Vec<ProjectRun>>,
    last_runs: HashMap<(Environment, VersionKey), EtlRun>,
    last_successful: HashMap<VersionKey, EtlRun>,
    failing: Vec<Environment>,
    schedule_updates: Vec<(Environment, VersionKey, String)>,
    list_calls: usize,
}

/// In-memory execution registry.
#[derive(Default)]
pub struct MockRegistry {
    state: Mutex<RegistryState>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_recent(&self, env: Environment, runs: Vec<ProjectRun>) {
        self.state.lock().unwrap().recent.insert(env, runs);
    }

    pub fn set_last_run(&self, env: Environment, key: VersionKey, run: EtlRun) {
        self.state.lock().unwrap().last_runs.insert((env, key), run);
    }

    pub fn set_last_successful(&self, key: VersionKey, run: EtlRun) {
        self.state.lock().unwrap().last_successful.insert(key, run);
    }

    /// Make every call for `env` fail with a 500.
    pub fn fail(&self, env: Environment) {
        self.state.lock().unwrap().failing.push(env);
    }

    pub fn schedule_updates(&self) -> Vec<(Environment, VersionKey, String)> {
        self.state.lock().unwrap().schedule_updates.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    fn check(&self, env: Environment) -> Result<(), RegistryError> {
        if self.state.lock().unwrap().failing.contains(&env) {
            return Err(RegistryError::Status {
                url: format!("mock://{env}"),
                status: 500,
                body: "registry down".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionRegistry for MockRegistry {
    async fn list_recent_runs(
        &self,
        env: Environment,
        _window: RunWindow,
    ) -> Result<Vec<ProjectRun>, RegistryError> {
        self.state.lock().unwrap().list_calls += 1;
        self.check(env)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .recent
            .get(&env)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_last_run(
        &self,
        env: Environment,
        key: VersionKey,
    ) -> Result<Option<EtlRun>, RegistryError> {
        self.check(env)?;
        Ok(self.state.lock().unwrap().last_runs.get(&(env, key)).cloned())
    }

    async fn get_last_successful_run(
        &self,
        env: Environment,
        key: VersionKey,
    ) -> Result<Option<EtlRun>, RegistryError> {
        self.check(env)?;
        Ok(self.state.lock().unwrap().last_successful.get(&key).cloned())
    }

    async fn update_schedule(
        &self,
        env: Environment,
        key: VersionKey,
        cron: &str,
    ) -> Result<(), RegistryError> {
        self.check(env)?;
        self.state
            .lock()
            .unwrap()
            .schedule_updates
            .push((env, key, cron.to_string()));
        Ok(())
    }
}

// ============================================================================
// Monitoring double
// ============================================================================

/// Records every disable call.
#[derive(Default)]
pub struct MockMonitoring {
    disabled: Mutex<Vec<VersionKey>>,
}

impl MockMonitoring {
    pub fn disabled(&self) -> Vec<VersionKey> {
        self.disabled.lock().unwrap().clone()
    }
}

#[async_trait]
impl MonitoringClient for MockMonitoring {
    async fn disable_monitoring(&self, key: VersionKey) -> Result<(), RegistryError> {
        self.disabled.lock().unwrap().push(key);
        Ok(())
    }
}

/// Wait until `condition` holds or the timeout elapses.
pub async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ============================================================================
// Backfill executor double
// ============================================================================

/// Forwards executed requests to a channel.
pub struct MockExecutor {
    executed: mpsc::UnboundedSender<SshBackfillRequest>,
    delay: Duration,
    fail: bool,
}

impl MockExecutor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SshBackfillRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                executed: tx,
                delay: Duration::ZERO,
                fail: false,
            },
            rx,
        )
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

#[async_trait]
impl BackfillExecutor for MockExecutor {
    async fn execute(
        &self,
        request: &SshBackfillRequest,
    ) -> Result<CommandOutput, BackfillError> {
        tokio::time::sleep(self.delay).await;
        let _ = self.executed.send(request.clone());
        if self.fail {
            return Err(BackfillError::InvalidDagId(request.dag_id.clone()));
        }
        Ok(CommandOutput {
            stdout: format!("ran {}", request.command()),
            stderr: String::new(),
            exit_status: 0,
        })
    }
}

pub fn ts(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}
