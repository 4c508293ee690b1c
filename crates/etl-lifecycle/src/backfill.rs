// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote backfill execution.
//!
//! Backfill requests are drained by a fixed pool of workers sharing one
//! queue. Each request runs `airflow dags backfill` on the Airflow host over
//! SSH; the outcome is only logged.

use std::fmt;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ssh2::Session;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::messages::SshBackfillRequest;

/// Errors raised while running a backfill.
#[derive(Debug, Error)]
pub enum BackfillError {
    /// TCP connection to the Airflow host failed.
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        /// `host:port` that was dialed.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// SSH handshake, authentication or channel operation failed.
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    /// Reading command output failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Dag id contains characters that cannot be passed to a shell.
    #[error("Invalid dag id: {0}")]
    InvalidDagId(String),

    /// Blocking task panicked or was cancelled.
    #[error("Backfill task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Airflow host used for backfills.
#[derive(Clone)]
pub struct SshSettings {
    /// Host name or address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Limit on establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Limit on every blocking SSH operation, including each read of
    /// command output.
    pub io_timeout: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 22,
            username: "default".to_string(),
            password: "default".to_string(),
            connect_timeout: Duration::from_secs(30),
            io_timeout: Duration::from_secs(2 * 60 * 60),
        }
    }
}

impl fmt::Debug for SshSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("connect_timeout", &self.connect_timeout)
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}

/// Output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit status reported by the remote side.
    pub exit_status: i32,
}

/// Runs one backfill request on the Airflow host.
#[async_trait]
pub trait BackfillExecutor: Send + Sync {
    /// Execute the request and return the command output.
    async fn execute(
        &self,
        request: &SshBackfillRequest,
    ) -> std::result::Result<CommandOutput, BackfillError>;
}

/// Executor running backfills through an SSH session with password auth.
#[derive(Debug, Clone)]
pub struct SshBackfillExecutor {
    settings: SshSettings,
}

impl SshBackfillExecutor {
    /// Create an executor for the given host.
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BackfillExecutor for SshBackfillExecutor {
    async fn execute(
        &self,
        request: &SshBackfillRequest,
    ) -> std::result::Result<CommandOutput, BackfillError> {
        if !request.has_valid_dag_id() {
            return Err(BackfillError::InvalidDagId(request.dag_id.clone()));
        }
        let settings = self.settings.clone();
        let command = request.command();
        tokio::task::spawn_blocking(move || run_remote(&settings, &command)).await?
    }
}

fn run_remote(
    settings: &SshSettings,
    command: &str,
) -> std::result::Result<CommandOutput, BackfillError> {
    let addr = format!("{}:{}", settings.host, settings.port);
    let tcp = connect(&addr, settings.connect_timeout).map_err(|source| BackfillError::Connect {
        addr: addr.clone(),
        source,
    })?;

    let mut session = Session::new()?;
    // Milliseconds; zero would mean no limit.
    let io_timeout = u32::try_from(settings.io_timeout.as_millis())
        .unwrap_or(u32::MAX)
        .max(1);
    session.set_timeout(io_timeout);
    session.set_tcp_stream(tcp);
    session.handshake()?;
    session.userauth_password(&settings.username, &settings.password)?;

    let mut channel = session.channel_session()?;
    channel.exec(command)?;

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout)?;
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr)?;

    channel.wait_close()?;
    let exit_status = channel.exit_status()?;

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_status,
    })
}

/// Dial every resolved address of `addr` in turn until one answers.
fn connect(addr: &str, timeout: Duration) -> std::io::Result<TcpStream> {
    let mut last_error = None;
    for candidate in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "address resolved to nothing")
    }))
}

/// Configuration for the backfill pool.
#[derive(Debug, Clone)]
pub struct BackfillDispatcherConfig {
    /// Number of concurrent workers.
    pub workers: usize,
}

impl Default for BackfillDispatcherConfig {
    fn default() -> Self {
        Self { workers: 5 }
    }
}

/// Fixed-size pool of workers draining the backfill queue.
pub struct RemoteBackfillDispatcher {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl RemoteBackfillDispatcher {
    /// Spawn the worker pool.
    pub fn start(
        executor: Arc<dyn BackfillExecutor>,
        requests: mpsc::UnboundedReceiver<SshBackfillRequest>,
        config: BackfillDispatcherConfig,
    ) -> Self {
        let requests = Arc::new(Mutex::new(requests));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = (0..config.workers.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    executor.clone(),
                    requests.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        info!(workers = config.workers.max(1), "Backfill pool started");

        Self {
            handles,
            shutdown_tx,
        }
    }

    /// Number of running workers.
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Signal every worker and wait for them to stop.
    ///
    /// A backfill already running is allowed to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Backfill worker task panicked: {}", e);
            }
        }
        info!("Backfill pool stopped");
    }
}

async fn run_worker(
    worker: usize,
    executor: Arc<dyn BackfillExecutor>,
    requests: Arc<Mutex<mpsc::UnboundedReceiver<SshBackfillRequest>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let request = tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }

            request = async { requests.lock().await.recv().await } => request,
        };

        let Some(request) = request else {
            warn!(worker, "Backfill queue closed");
            break;
        };

        info!(
            worker,
            dag_id = %request.dag_id,
            start = %request.start_date,
            end = %request.end_date,
            "Running backfill"
        );

        match executor.execute(&request).await {
            Ok(output) => {
                info!(
                    worker,
                    dag_id = %request.dag_id,
                    exit_status = output.exit_status,
                    stdout = %output.stdout,
                    stderr = %output.stderr,
                    "Backfill finished"
                );
            }
            Err(e) => {
                error!(worker, dag_id = %request.dag_id, error = %e, "Backfill failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_settings_debug_hides_password() {
        let settings = SshSettings {
            password: "hunter2".to_string(),
            ..Default::default()
        };
        let debug = format!("{:?}", settings);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("0.0.0.0"));
    }

    #[test]
    fn test_default_pool_size() {
        assert_eq!(BackfillDispatcherConfig::default().workers, 5);
    }
}
