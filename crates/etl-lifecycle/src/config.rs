// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for etl-lifecycle.

use std::str::FromStr;
use std::time::Duration;

use crate::backfill::SshSettings;
use crate::snapshot::{GitProtocol, SnapshotSettings};
use crate::submit::RepositoryTargets;

/// Lifecycle engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL for the lifecycle record store
    pub database_url: String,
    /// Base URI of the dev execution registry
    pub backend_uri_dev: String,
    /// Base URI of the prod execution registry
    pub backend_uri_prod: String,
    /// Base URI of the metric manager (monitoring disable calls are skipped when unset)
    pub metric_manager_uri: Option<String>,
    /// Protocol used to clone project repositories
    pub git_protocol: GitProtocol,
    /// Username for HTTP(S) clones
    pub git_username: Option<String>,
    /// Password or token for HTTP(S) clones
    pub git_password: Option<String>,
    /// Repository used by two-repo projects (without scheme)
    pub git_repo_dev: Option<String>,
    /// Repository used by one-repo projects (without scheme)
    pub git_repo_prod: Option<String>,
    /// Timeout for a single clone or checkout
    pub git_clone_timeout: Duration,
    /// Interval between status reconciliation cycles
    pub status_update_interval: Duration,
    /// Airflow host used for backfills
    pub ssh: SshSettings,
    /// Number of concurrent backfill workers
    pub backfill_workers: usize,
    /// Reviewers requested on pull requests of TARGETS projects
    pub pr_target_reviewers: Vec<String>,
    /// Minimal fs_etl version able to run a retro calculation
    pub retro_min_fs_etl_version: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required("ETL_LIFECYCLE_DATABASE_URL")?;
        let backend_uri_dev = required("ETL_BACKEND_URI_DEV")?;
        let backend_uri_prod = required("ETL_BACKEND_URI_PROD")?;
        let metric_manager_uri = optional("ETL_METRIC_MANAGER_URI");

        let protocol_name = std::env::var("ETL_GIT_CONN_PROTOCOL").unwrap_or_else(|_| "http".into());
        let git_protocol =
            GitProtocol::from_name(&protocol_name).ok_or_else(|| ConfigError::InvalidValue {
                var: "ETL_GIT_CONN_PROTOCOL",
                value: protocol_name.clone(),
            })?;

        let git_clone_timeout = Duration::from_secs(parsed("ETL_GIT_CLONE_TIMEOUT_SECS", 300)?);
        let status_update_interval =
            Duration::from_secs(parsed::<u64>("ETL_STATUS_UPDATE_INTERVAL_MINUTES", 2)? * 60);

        let ssh = SshSettings {
            host: std::env::var("ETL_AIRFLOW_SSH_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parsed("ETL_AIRFLOW_SSH_PORT", 22)?,
            username: std::env::var("ETL_AIRFLOW_SSH_USERNAME").unwrap_or_else(|_| "default".into()),
            password: std::env::var("ETL_AIRFLOW_SSH_PASSWORD").unwrap_or_else(|_| "default".into()),
            connect_timeout: Duration::from_secs(parsed("ETL_AIRFLOW_SSH_CONNECT_TIMEOUT_SECS", 30)?),
            io_timeout: Duration::from_secs(parsed("ETL_AIRFLOW_SSH_TIMEOUT_SECS", 7200)?),
        };

        let backfill_workers = parsed("ETL_BACKFILL_WORKERS", 5usize)?;
        if backfill_workers == 0 {
            return Err(ConfigError::InvalidValue {
                var: "ETL_BACKFILL_WORKERS",
                value: "0".into(),
            });
        }

        let pr_target_reviewers = std::env::var("ETL_PR_TARGET_REVIEWERS")
            .map(|v| split_list(&v))
            .unwrap_or_default();

        let retro_min_fs_etl_version = std::env::var("ETL_RETRO_MIN_FS_ETL_VERSION")
            .unwrap_or_else(|_| "0.23.24".into());

        Ok(Self {
            database_url,
            backend_uri_dev,
            backend_uri_prod,
            metric_manager_uri,
            git_protocol,
            git_username: optional("ETL_GIT_USERNAME"),
            git_password: optional("ETL_GIT_PASSWORD"),
            git_repo_dev: optional("ETL_GIT_REPO_DEV"),
            git_repo_prod: optional("ETL_GIT_REPO_PROD"),
            git_clone_timeout,
            status_update_interval,
            ssh,
            backfill_workers,
            pr_target_reviewers,
            retro_min_fs_etl_version,
        })
    }

    /// Settings used by checker and synchronizer clones.
    pub fn snapshot_settings(&self) -> SnapshotSettings {
        SnapshotSettings {
            protocol: self.git_protocol,
            username: self.git_username.clone(),
            password: self.git_password.clone(),
            timeout: self.git_clone_timeout,
            ..SnapshotSettings::default()
        }
    }

    /// Repositories selected by git flow type.
    pub fn repositories(&self) -> RepositoryTargets {
        RepositoryTargets {
            dev: self.git_repo_dev.clone(),
            prod: self.git_repo_prod.clone(),
        }
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::MissingEnvVar(var))
}

fn optional(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}

/// Split a comma-separated list, dropping empty entries.
pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable holds a value that cannot be used.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Rejected value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("alice, bob,,carol "), vec!["alice", "bob", "carol"]);
        assert!(split_list("").is_empty());
        assert!(split_list(" , ").is_empty());
    }
}
