// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP contract tests for the execution registry and monitoring clients.

use serde_json::json;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use etl_lifecycle::model::{Environment, VersionKey, VersionLabel};
use etl_lifecycle::registry::{
    ExecutionRegistry, HttpExecutionRegistry, HttpMonitoringClient, MonitoringClient,
    RegistryError, RunOutcome, RunWindow,
};

fn key(project_id: i64, version: u32) -> VersionKey {
    VersionKey::new(project_id, VersionLabel::new(version).unwrap())
}

#[tokio::test]
async fn test_list_recent_runs_sends_window() {
    let dev = MockServer::start().await;
    let prod = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/internal/etl/get_last_etl_runs_for_projects"))
        .and(query_param("period", "1"))
        .and(query_param("period_type", "hour"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "etl_project_id": 4,
                "etl_project_version": "2.0",
                "etl_run": {"id": 90, "result": "SUCCESS", "run_ts": "2025-01-10T08:00:00"}
            },
            {
                "etl_project_id": 5,
                "etl_project_version": "1.0",
                "etl_run": {"id": 91, "result": "RUNNING"}
            }
        ])))
        .expect(1)
        .mount(&dev)
        .await;

    let registry = HttpExecutionRegistry::new(dev.uri(), prod.uri());
    let runs = registry
        .list_recent_runs(Environment::Dev, RunWindow::hours(1))
        .await
        .unwrap();

    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].key(), key(4, 2));
    assert_eq!(runs[0].etl_run.result, RunOutcome::Success);
    assert_eq!(runs[1].etl_run.result, RunOutcome::Other("RUNNING".into()));
    assert!(runs[1].etl_run.run_ts.is_none());
}

#[tokio::test]
async fn test_environments_use_their_own_backend() {
    let dev = MockServer::start().await;
    let prod = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/internal/etl/get_last_etl_runs_for_projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&prod)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&dev)
        .await;

    let registry = HttpExecutionRegistry::new(dev.uri(), prod.uri());
    let runs = registry
        .list_recent_runs(Environment::Prod, RunWindow::default())
        .await
        .unwrap();
    assert!(runs.is_empty());
}

#[tokio::test]
async fn test_last_run_queries_version() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/internal/etl/12/last_run"))
        .and(query_param("general_etl_project_version", "3.0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 7,
            "result": "FAIL",
            "run_ts": "2025-01-10T08:00:00+00:00",
            "dag_id": "fs_12_v3"
        })))
        .mount(&server)
        .await;

    let registry = HttpExecutionRegistry::new(server.uri(), server.uri());
    let run = registry
        .get_last_run(Environment::Dev, key(12, 3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.id, 7);
    assert_eq!(run.result, RunOutcome::Fail);
    assert_eq!(run.dag_id.as_deref(), Some("fs_12_v3"));
}

#[tokio::test]
async fn test_last_successful_run_may_be_absent() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/internal/etl/12/last_successful_run"))
        .respond_with(ResponseTemplate::new(200).set_body_string("null"))
        .mount(&server)
        .await;

    let registry = HttpExecutionRegistry::new(server.uri(), server.uri());
    let run = registry
        .get_last_successful_run(Environment::Prod, key(12, 3))
        .await
        .unwrap();
    assert!(run.is_none());
}

#[tokio::test]
async fn test_update_schedule_posts_cron() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/internal/etl/8"))
        .and(body_json(json!({
            "data": {"cron": "1 * * 2 *"},
            "general_etl_project_version": "2.0"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let registry = HttpExecutionRegistry::new(server.uri(), server.uri());
    registry
        .update_schedule(Environment::Prod, key(8, 2), "1 * * 2 *")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_non_success_status_is_an_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/internal/etl/get_last_etl_runs_for_projects"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let registry = HttpExecutionRegistry::new(server.uri(), server.uri());
    let err = registry
        .list_recent_runs(Environment::Dev, RunWindow::hours(1))
        .await
        .unwrap_err();
    match err {
        RegistryError::Status { status, body, .. } => {
            assert_eq!(status, 503);
            assert_eq!(body, "maintenance");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_disable_monitoring_posts_version() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/internal/datamart/monitoring/disable"))
        .and(body_json(json!({
            "general_etl_project_id": 3,
            "general_etl_project_version": "1.0"
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let monitoring = HttpMonitoringClient::new(format!("{}/", server.uri()));
    monitoring.disable_monitoring(key(3, 1)).await.unwrap();
}
