// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Clients for the external execution registry and monitoring service.
//!
//! The execution registry ("backend API") records DAG runs per project
//! version; there is one registry per environment. The monitoring service
//! (metric manager) watches datamarts of production versions.
//!
//! Any non-2xx response is a hard error ([`RegistryError::Status`]).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::model::{Environment, VersionKey, VersionLabel};

/// Errors from registry and monitoring calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// The request could not be sent or the body could not be decoded.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("{url} returned {status}: {body}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The response body did not have the expected shape.
    #[error("Invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Outcome reported for a DAG run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunOutcome {
    /// The run succeeded.
    Success,
    /// The run failed.
    Fail,
    /// Any other state (running, queued, ...).
    Other(String),
}

impl From<String> for RunOutcome {
    fn from(value: String) -> Self {
        match value.as_str() {
            "SUCCESS" => Self::Success,
            "FAIL" => Self::Fail,
            _ => Self::Other(value),
        }
    }
}

impl From<RunOutcome> for String {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Success => "SUCCESS".into(),
            RunOutcome::Fail => "FAIL".into(),
            RunOutcome::Other(value) => value,
        }
    }
}

/// One DAG run of a project version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtlRun {
    /// Run id, unique within an environment.
    pub id: i64,
    /// Outcome.
    pub result: RunOutcome,
    /// When the run happened.
    #[serde(default, deserialize_with = "deserialize_run_ts")]
    pub run_ts: Option<DateTime<Utc>>,
    /// Airflow DAG id.
    #[serde(default)]
    pub dag_id: Option<String>,
    /// Version of the fs_etl library the run used.
    #[serde(default)]
    pub fs_etl_version: Option<String>,
}

/// A run together with the version it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRun {
    /// Project id.
    pub etl_project_id: i64,
    /// Version label.
    pub etl_project_version: VersionLabel,
    /// The run.
    pub etl_run: EtlRun,
}

impl ProjectRun {
    /// Key of the version the run belongs to.
    pub fn key(&self) -> VersionKey {
        VersionKey::new(self.etl_project_id, self.etl_project_version)
    }
}

/// Unit of a run listing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodUnit {
    /// Hours.
    Hour,
    /// Days.
    Day,
}

impl PeriodUnit {
    fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }
}

/// Trailing window for run listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunWindow {
    /// Window length.
    pub period: u32,
    /// Window unit.
    pub unit: PeriodUnit,
}

impl RunWindow {
    /// Window of the last `period` hours.
    pub fn hours(period: u32) -> Self {
        Self {
            period,
            unit: PeriodUnit::Hour,
        }
    }
}

impl Default for RunWindow {
    fn default() -> Self {
        Self::hours(1)
    }
}

/// External registry of DAG runs.
#[async_trait]
pub trait ExecutionRegistry: Send + Sync {
    /// List runs of all projects completed within the window.
    async fn list_recent_runs(&self, env: Environment, window: RunWindow) -> Result<Vec<ProjectRun>>;

    /// Last run of a version.
    async fn get_last_run(&self, env: Environment, key: VersionKey) -> Result<Option<EtlRun>>;

    /// Last successful run of a version.
    async fn get_last_successful_run(
        &self,
        env: Environment,
        key: VersionKey,
    ) -> Result<Option<EtlRun>>;

    /// Replace the cron schedule of a version's DAG.
    async fn update_schedule(&self, env: Environment, key: VersionKey, cron: &str) -> Result<()>;
}

/// External monitoring service.
#[async_trait]
pub trait MonitoringClient: Send + Sync {
    /// Stop monitoring the datamarts of a version.
    async fn disable_monitoring(&self, key: VersionKey) -> Result<()>;
}

/// [`ExecutionRegistry`] over the backend HTTP API.
#[derive(Debug, Clone)]
pub struct HttpExecutionRegistry {
    client: reqwest::Client,
    dev_uri: String,
    prod_uri: String,
}

impl HttpExecutionRegistry {
    /// Create a registry client for the dev and prod backends.
    pub fn new(dev_uri: impl Into<String>, prod_uri: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), dev_uri, prod_uri)
    }

    /// Create a registry client reusing an HTTP client.
    pub fn with_client(
        client: reqwest::Client,
        dev_uri: impl Into<String>,
        prod_uri: impl Into<String>,
    ) -> Self {
        Self {
            client,
            dev_uri: dev_uri.into(),
            prod_uri: prod_uri.into(),
        }
    }

    fn url(&self, env: Environment, path: &str) -> String {
        let base = match env {
            Environment::Dev => &self.dev_uri,
            Environment::Prod => &self.prod_uri,
        };
        format!("{}{}", base.trim_end_matches('/'), path)
    }

    async fn get_optional_run(&self, url: String, key: VersionKey) -> Result<Option<EtlRun>> {
        let response = self
            .client
            .get(&url)
            .query(&[("general_etl_project_version", key.version.to_string())])
            .send()
            .await?;
        let text = ensure_success(&url, response).await?.text().await?;
        if text.trim().is_empty() || text.trim() == "null" {
            return Ok(None);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl ExecutionRegistry for HttpExecutionRegistry {
    async fn list_recent_runs(&self, env: Environment, window: RunWindow) -> Result<Vec<ProjectRun>> {
        let url = self.url(env, "/internal/etl/get_last_etl_runs_for_projects");
        let response = self
            .client
            .get(&url)
            .query(&[
                ("period", window.period.to_string()),
                ("period_type", window.unit.as_str().to_string()),
            ])
            .send()
            .await?;
        let runs: Vec<ProjectRun> = ensure_success(&url, response).await?.json().await?;
        debug!(env = %env, count = runs.len(), "Listed recent runs");
        Ok(runs)
    }

    async fn get_last_run(&self, env: Environment, key: VersionKey) -> Result<Option<EtlRun>> {
        let url = self.url(env, &format!("/internal/etl/{}/last_run", key.project_id));
        self.get_optional_run(url, key).await
    }

    async fn get_last_successful_run(
        &self,
        env: Environment,
        key: VersionKey,
    ) -> Result<Option<EtlRun>> {
        let url = self.url(
            env,
            &format!("/internal/etl/{}/last_successful_run", key.project_id),
        );
        self.get_optional_run(url, key).await
    }

    async fn update_schedule(&self, env: Environment, key: VersionKey, cron: &str) -> Result<()> {
        let url = self.url(env, &format!("/internal/etl/{}", key.project_id));
        let body = json!({
            "data": { "cron": cron },
            "general_etl_project_version": key.version.to_string(),
        });
        let response = self.client.post(&url).json(&body).send().await?;
        ensure_success(&url, response).await?;
        Ok(())
    }
}

/// [`MonitoringClient`] over the metric manager HTTP API.
#[derive(Debug, Clone)]
pub struct HttpMonitoringClient {
    client: reqwest::Client,
    base_uri: String,
}

impl HttpMonitoringClient {
    /// Create a monitoring client.
    pub fn new(base_uri: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_uri: base_uri.into(),
        }
    }
}

#[async_trait]
impl MonitoringClient for HttpMonitoringClient {
    async fn disable_monitoring(&self, key: VersionKey) -> Result<()> {
        let url = format!(
            "{}/internal/datamart/monitoring/disable",
            self.base_uri.trim_end_matches('/')
        );
        let body = json!({
            "general_etl_project_id": key.project_id,
            "general_etl_project_version": key.version.to_string(),
        });
        let response = self.client.post(&url).json(&body).send().await?;
        ensure_success(&url, response).await?;
        Ok(())
    }
}

async fn ensure_success(url: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RegistryError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

/// Accepts RFC 3339 timestamps as well as naive ones, which are taken as UTC.
fn deserialize_run_ts<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| Some(naive.and_utc()))
        .map_err(serde::de::Error::custom)
}
