// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ephemeral clones of project repositories.
//!
//! A [`RepositorySnapshot`] owns a fresh temporary directory holding a clone of
//! the repository checked out at the requested reference. The directory is
//! removed when the snapshot is dropped. `git` runs as a child process with a
//! timeout; credentials are embedded in the clone URL and never logged.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Snapshot acquisition errors.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// HTTP(S) clone requested without both username and password.
    #[error("Username and password must be set for {0} repositories")]
    Authentication(GitProtocol),

    /// Clone or checkout failed.
    #[error("Failed to clone repository: {0}")]
    Clone(String),
}

/// Protocol used to reach the repository host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitProtocol {
    /// Plain HTTP with credentials.
    Http,
    /// HTTPS with credentials.
    Https,
    /// SSH with the process' own keys.
    Ssh,
    /// Local path, used for mirrors on the same host.
    File,
}

impl GitProtocol {
    /// Parse a protocol name (`http`, `https`, `ssh` or `file`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "ssh" => Some(Self::Ssh),
            "file" => Some(Self::File),
            _ => None,
        }
    }

    fn scheme(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Ssh => "ssh",
            Self::File => "file",
        }
    }
}

impl fmt::Display for GitProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// How repositories are cloned.
#[derive(Clone)]
pub struct SnapshotSettings {
    /// Protocol.
    pub protocol: GitProtocol,
    /// Username for HTTP(S).
    pub username: Option<String>,
    /// Password or token for HTTP(S).
    pub password: Option<String>,
    /// Timeout for clone and for checkout, each.
    pub timeout: Duration,
    /// Path or name of the git executable.
    pub git_binary: String,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            protocol: GitProtocol::Http,
            username: None,
            password: None,
            timeout: Duration::from_secs(300),
            git_binary: "git".to_string(),
        }
    }
}

impl fmt::Debug for SnapshotSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotSettings")
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("timeout", &self.timeout)
            .field("git_binary", &self.git_binary)
            .finish()
    }
}

impl SnapshotSettings {
    /// Build the clone URL for a repository given without scheme.
    pub fn clone_url(&self, repo: &str) -> Result<String, SnapshotError> {
        match self.protocol {
            GitProtocol::Http | GitProtocol::Https => {
                let (Some(username), Some(password)) = (&self.username, &self.password) else {
                    return Err(SnapshotError::Authentication(self.protocol));
                };
                Ok(format!(
                    "{}://{}:{}@{}",
                    self.protocol.scheme(),
                    urlencoding::encode(username),
                    urlencoding::encode(password),
                    repo
                ))
            }
            GitProtocol::Ssh => Ok(format!("ssh://{repo}")),
            GitProtocol::File => Ok(format!("file://{repo}")),
        }
    }

    /// Remove the password from text produced by git.
    fn redact(&self, text: &str) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => text
                .replace(urlencoding::encode(password).as_ref(), "***")
                .replace(password.as_str(), "***"),
            _ => text.to_string(),
        }
    }
}

/// A repository cloned into its own temporary directory.
#[derive(Debug)]
pub struct RepositorySnapshot {
    dir: TempDir,
}

impl RepositorySnapshot {
    /// Clone `repo` and check out `reference`.
    pub async fn acquire(
        settings: &SnapshotSettings,
        repo: &str,
        reference: &str,
    ) -> Result<Self, SnapshotError> {
        let url = settings.clone_url(repo)?;
        let dir = tempfile::Builder::new()
            .prefix("etl-snapshot-")
            .tempdir()
            .map_err(|e| SnapshotError::Clone(format!("cannot create workspace: {e}")))?;

        debug!(repo = %repo, reference = %reference, path = %dir.path().display(), "Cloning repository");

        let mut clone = Command::new(&settings.git_binary);
        clone
            .arg("clone")
            .arg("--quiet")
            .arg("--no-checkout")
            .arg(&url)
            .arg(dir.path());
        run_git(settings, clone, "clone").await?;

        let mut checkout = Command::new(&settings.git_binary);
        checkout
            .arg("-C")
            .arg(dir.path())
            .arg("checkout")
            .arg("--quiet")
            .arg(reference);
        run_git(settings, checkout, "checkout").await?;

        Ok(Self { dir })
    }

    /// Root of the working tree.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Directory of a project inside the working tree.
    pub fn project_dir(&self, project_name: &str) -> PathBuf {
        self.dir.path().join(project_name)
    }
}

async fn run_git(
    settings: &SnapshotSettings,
    mut command: Command,
    step: &str,
) -> Result<(), SnapshotError> {
    command
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|e| SnapshotError::Clone(format!("cannot run git {step}: {e}")))?;

    let output = tokio::time::timeout(settings.timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            SnapshotError::Clone(format!(
                "git {step} timed out after {}s",
                settings.timeout.as_secs()
            ))
        })?
        .map_err(|e| SnapshotError::Clone(format!("git {step} failed: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SnapshotError::Clone(format!(
            "git {step} exited with {}: {}",
            output.status,
            settings.redact(stderr.trim())
        )));
    }
    Ok(())
}
