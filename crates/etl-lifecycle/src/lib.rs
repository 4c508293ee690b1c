// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ETL Lifecycle - Project Version Lifecycle Orchestration
//!
//! This crate drives ETL project versions from development to production.
//! It validates project sources, synchronizes DAG schedules, follows DAG run
//! outcomes reported by the execution registries, and starts backfills on
//! the Airflow host.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Outer service (API)                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                │ Submitter                          │ TransferReconciler
//!                ▼                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      etl-lifecycle (This Crate)                          │
//! │  ┌─────────────┐  ┌──────────────┐  ┌─────────────┐  ┌──────────────┐   │
//! │  │  Project    │  │  Schedule    │  │   Status    │  │   Backfill   │   │
//! │  │  Checker    │  │ Synchronizer │  │ Reconciler  │  │     Pool     │   │
//! │  └──────┬──────┘  └──────┬───────┘  └──────┬──────┘  └──────┬───────┘   │
//! │         │ results        │ results         │                │           │
//! │         ▼                ▼                 │                │           │
//! │  ┌────────────────────────────┐            │                │           │
//! │  │     Result Dispatcher      │            │                │           │
//! │  └─────────────┬──────────────┘            │                │           │
//! └────────────────┼───────────────────────────┼────────────────┼───────────┘
//!                  │                           │                │ SSH
//!                  ▼                           ▼                ▼
//! ┌──────────────────────────┐  ┌───────────────────────┐  ┌───────────────┐
//! │ PostgreSQL record store  │  │ Execution registries  │  │ Airflow host  │
//! │ (versions, checks, ...)  │  │ (dev, prod)           │  │               │
//! └──────────────────────────┘  └───────────────────────┘  └───────────────┘
//! ```
//!
//! Checker and synchronizer clone the project repository into a temporary
//! snapshot for every request. Every check, transfer request and status
//! change is written under one write lock.
//!
//! # Version Status State Machine
//!
//! ```text
//!   ┌────────────┐  dev run SUCCESS   ┌─────────┐  production requested
//!   │ DEVELOPING │───────────────────▶│ TESTING │──────────────────────┐
//!   └────────────┘                    └─────────┘                      │
//!                                                                      ▼
//!                                 git promotion succeeded      ┌──────────────┐
//!                          ┌───────────────────────────────────│ PROD_REQUEST │
//!                          ▼                                   └──────────────┘
//!                   ┌─────────────┐  prod run FAIL   ┌──────────────┐
//!                   │ PROD_REVIEW │─────────────────▶│ PROD_RELEASE │
//!                   └──────┬──────┘                  └──────┬───────┘
//!                          │ prod run SUCCESS               │ prod run SUCCESS
//!                          ▼                                │
//!                   ┌────────────┐◀─────────────────────────┘
//!                   │ PRODUCTION │
//!                   └─────┬──────┘
//!                         │ newer version reached PRODUCTION
//!                         ▼
//!                   ┌────────────┐
//!                   │ TURNED_OFF │
//!                   └────────────┘
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `ETL_LIFECYCLE_DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `ETL_BACKEND_URI_DEV` | Yes | - | Dev execution registry |
//! | `ETL_BACKEND_URI_PROD` | Yes | - | Prod execution registry |
//! | `ETL_METRIC_MANAGER_URI` | No | - | Monitoring service |
//! | `ETL_GIT_CONN_PROTOCOL` | No | `http` | `http`, `https`, `ssh` or `file` |
//! | `ETL_GIT_USERNAME` / `ETL_GIT_PASSWORD` | No | - | HTTP(S) credentials |
//! | `ETL_GIT_REPO_DEV` / `ETL_GIT_REPO_PROD` | No | - | Repositories of two-repo / one-repo projects |
//! | `ETL_GIT_CLONE_TIMEOUT_SECS` | No | `300` | Clone and checkout timeout |
//! | `ETL_STATUS_UPDATE_INTERVAL_MINUTES` | No | `2` | Status reconciliation interval |
//! | `ETL_AIRFLOW_SSH_HOST` | No | `0.0.0.0` | Backfill host |
//! | `ETL_AIRFLOW_SSH_PORT` | No | `22` | Backfill host SSH port |
//! | `ETL_AIRFLOW_SSH_USERNAME` / `ETL_AIRFLOW_SSH_PASSWORD` | No | `default` | Backfill host login |
//! | `ETL_AIRFLOW_SSH_CONNECT_TIMEOUT_SECS` | No | `30` | Backfill host connect timeout |
//! | `ETL_AIRFLOW_SSH_TIMEOUT_SECS` | No | `7200` | Limit on each blocking SSH operation |
//! | `ETL_BACKFILL_WORKERS` | No | `5` | Backfill pool size |
//! | `ETL_PR_TARGET_REVIEWERS` | No | - | Comma-separated TARGETS reviewers |
//! | `ETL_RETRO_MIN_FS_ETL_VERSION` | No | `0.23.24` | Minimal fs_etl version for retro calculations |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`model`]: Versions, checks, transfer requests and history records
//! - [`lifecycle`]: Status state machine and the write lock
//! - [`store`]: Record store trait with PostgreSQL and in-memory backends
//! - [`registry`]: Execution registry and monitoring clients
//! - [`snapshot`]: Temporary repository checkouts
//! - [`checks`]: Static project checks
//! - [`checker`]: Project checker worker
//! - [`synchronizer`]: Schedule synchronizer worker
//! - [`dispatcher`]: Result dispatcher worker
//! - [`reconciler`]: External status reconciler
//! - [`backfill`]: Remote backfill pool
//! - [`submit`]: Submission API
//! - [`transfer`]: Production transfer reconciliation
//! - [`runtime`]: Embeddable runtime wiring every worker

#![deny(missing_docs)]

/// Database migrations for the lifecycle record store.
pub mod migrations;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for lifecycle operations.
pub mod error;

/// Domain records and status enumerations.
pub mod model;

/// Status state machine, transitions and the write lock.
pub mod lifecycle;

/// Queue messages exchanged between workers.
pub mod messages;

/// Record store trait and backends.
pub mod store;

/// Execution registry and monitoring HTTP clients.
pub mod registry;

/// Temporary repository checkouts.
pub mod snapshot;

/// Static checks run on a project directory.
pub mod checks;

/// Background worker running project checks.
pub mod checker;

/// Background worker reading DAG schedules from project settings.
pub mod synchronizer;

/// Background worker applying check and synchronize results.
pub mod dispatcher;

/// Background worker reconciling statuses with DAG run outcomes.
pub mod reconciler;

/// Remote backfill execution over SSH.
pub mod backfill;

/// Submission API used by the outer service.
pub mod submit;

/// Production transfer reconciliation.
pub mod transfer;

/// Embeddable runtime.
pub mod runtime;

pub use error::{Error, Result};
pub use runtime::LifecycleRuntime;
