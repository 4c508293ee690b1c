// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the project checker against local git repositories.

#[macro_use]
mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use etl_lifecycle::checker::ProjectChecker;
use etl_lifecycle::checks::CheckRunner;
use etl_lifecycle::messages::{CheckEventRequest, ResultEvent};
use etl_lifecycle::model::{CheckKind, CheckResult, ProjectOutputType, SubCheckResult};

use common::{TestRepo, as_refs, file_snapshot_settings, label, valid_project_files};

fn request(repo: &TestRepo, project: &str, branch: &str) -> CheckEventRequest {
    CheckEventRequest {
        etl_project_id: 1,
        etl_project_version: label(1),
        etl_project_name: project.to_string(),
        jira_task: Some("ETL-1".to_string()),
        branch_name: format!("refs/remotes/origin/{branch}"),
        general_check_id: 42,
        check_kind: CheckKind::Testing,
        git_repo: repo.repo(),
        project_type: ProjectOutputType::Features,
        user_data: None,
    }
}

fn checker() -> (
    ProjectChecker,
    mpsc::UnboundedSender<CheckEventRequest>,
    mpsc::UnboundedReceiver<ResultEvent>,
) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (result_tx, result_rx) = mpsc::unbounded_channel();
    let checker = ProjectChecker::new(
        file_snapshot_settings(),
        Arc::new(CheckRunner::default()),
        request_rx,
        result_tx,
    );
    (checker, request_tx, result_rx)
}

#[tokio::test]
async fn test_complete_project_passes() {
    skip_if_no_git!();
    let files = valid_project_files("sales", "0 3 * * *");
    let repo = TestRepo::with_branch("feature", &as_refs(&files));
    let (checker, _tx, _rx) = checker();

    let response = checker.process(request(&repo, "sales", "feature")).await;

    assert_eq!(response.result, CheckResult::Success);
    assert!(
        response
            .checks
            .iter()
            .all(|c| c.result == SubCheckResult::Success)
    );
    assert_eq!(response.request.general_check_id, 42);
}

#[tokio::test]
async fn test_missing_manifest_fails_and_names_it() {
    skip_if_no_git!();
    let repo = TestRepo::with_branch(
        "feature",
        &[
            ("sales/settings.yaml", "dag_settings: {}\n"),
            ("sales/requirements.txt", "fs_etl\n"),
        ],
    );
    let (checker, _tx, _rx) = checker();

    let response = checker.process(request(&repo, "sales", "feature")).await;

    assert_eq!(response.result, CheckResult::Failed);
    let failed: Vec<_> = response
        .checks
        .iter()
        .filter(|c| c.result == SubCheckResult::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].description.contains("features.yaml"));
}

#[tokio::test]
async fn test_materialization_call_warns_but_succeeds() {
    skip_if_no_git!();
    let mut files = valid_project_files("sales", "0 3 * * *");
    files.push((
        "sales/etl/load.py".to_string(),
        "def load(df):\n    return df.toPandas()\n".to_string(),
    ));
    let repo = TestRepo::with_branch("feature", &as_refs(&files));
    let (checker, _tx, _rx) = checker();

    let response = checker.process(request(&repo, "sales", "feature")).await;

    assert_eq!(response.result, CheckResult::Success);
    let warning = response
        .checks
        .iter()
        .find(|c| c.result == SubCheckResult::Warning)
        .expect("a warning sub-check");
    assert!(warning.description.contains("etl/load.py"));
    assert!(!warning.description.contains("etl/main.py"));
}

#[tokio::test]
async fn test_missing_project_directory_fails() {
    skip_if_no_git!();
    let files = valid_project_files("sales", "0 3 * * *");
    let repo = TestRepo::with_branch("feature", &as_refs(&files));
    let (checker, _tx, _rx) = checker();

    let response = checker.process(request(&repo, "marketing", "feature")).await;

    assert_eq!(response.result, CheckResult::Failed);
}

#[tokio::test]
async fn test_unknown_branch_yields_single_failed_sub_check() {
    skip_if_no_git!();
    let files = valid_project_files("sales", "0 3 * * *");
    let repo = TestRepo::with_branch("feature", &as_refs(&files));
    let (checker, _tx, _rx) = checker();

    let response = checker.process(request(&repo, "sales", "missing-branch")).await;

    assert_eq!(response.result, CheckResult::Failed);
    assert_eq!(response.checks.len(), 1);
    assert_eq!(response.checks[0].result, SubCheckResult::Failed);
}

#[tokio::test]
async fn test_run_publishes_results_and_stops_when_queue_closes() {
    skip_if_no_git!();
    let files = valid_project_files("sales", "0 3 * * *");
    let repo = TestRepo::with_branch("feature", &as_refs(&files));
    let (checker, tx, mut rx) = checker();
    let handle = tokio::spawn(checker.run());

    tx.send(request(&repo, "sales", "feature")).unwrap();
    let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("result in time")
        .expect("result event");
    match event {
        ResultEvent::Check(response) => assert_eq!(response.result, CheckResult::Success),
        other => panic!("unexpected event {other:?}"),
    }

    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("checker should stop")
        .unwrap();
}
