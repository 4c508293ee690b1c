// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL record store.
//!
//! Every multi-step operation runs in one transaction. Status transitions
//! lock the version row (`FOR UPDATE`) before comparing the current status,
//! and pending transfer listing locks the transfer request rows it returns.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use super::{
    CheckCompletion, PendingTransfer, Promotion, RecordStore, Result, StoreError,
    TransferUpdate,
};
use crate::lifecycle::StatusTransition;
use crate::model::{
    CheckKind, CheckResult, EtlProjectVersion, GeneralCheck, HistoryRecord, NewHistoryEvent, ProjectId,
    ProjectInfo, StatusTimestamps, SubCheck, TransferRequest, UserRequestData, VersionId,
    VersionKey, VersionLabel, VersionStatus,
};

const VERSION_SELECT: &str = r#"
    SELECT v.id, v.etl_project_id, p.name AS project_name, p.project_type, p.git_flow_type,
           v.version, v.status, v.jira_task, v.branch_name, v.git_dev_branch_uri,
           v.git_prod_branch_uri, v.pull_request_url, v.schedule_interval,
           v.author_name, v.author_email, v.master_commit_hash,
           v.moved_to_testing_at, v.moved_to_prod_request_at, v.moved_to_prod_review_at,
           v.moved_to_prod_release_at, v.moved_to_production_at, v.turned_off_at
    FROM etl_project_versions v
    JOIN etl_projects p ON p.id = v.etl_project_id
"#;

#[derive(Debug, sqlx::FromRow)]
struct VersionRow {
    id: i64,
    etl_project_id: i64,
    project_name: String,
    project_type: String,
    git_flow_type: String,
    version: i32,
    status: String,
    jira_task: Option<String>,
    branch_name: Option<String>,
    git_dev_branch_uri: Option<String>,
    git_prod_branch_uri: Option<String>,
    pull_request_url: Option<String>,
    schedule_interval: Option<String>,
    author_name: Option<String>,
    author_email: Option<String>,
    master_commit_hash: Option<String>,
    moved_to_testing_at: Option<DateTime<Utc>>,
    moved_to_prod_request_at: Option<DateTime<Utc>>,
    moved_to_prod_review_at: Option<DateTime<Utc>>,
    moved_to_prod_release_at: Option<DateTime<Utc>>,
    moved_to_production_at: Option<DateTime<Utc>>,
    turned_off_at: Option<DateTime<Utc>>,
}

impl VersionRow {
    fn into_version(self) -> Result<EtlProjectVersion> {
        let label = u32::try_from(self.version)
            .ok()
            .and_then(VersionLabel::new)
            .ok_or_else(|| {
                StoreError::InvalidData(format!(
                    "version {} has label {}",
                    self.id, self.version
                ))
            })?;

        let project = ProjectInfo {
            id: self.etl_project_id,
            name: self.project_name,
            output_type: self.project_type.parse()?,
            git_flow: self.git_flow_type.parse()?,
        };

        let mut version =
            EtlProjectVersion::new(self.id, project, label, self.status.parse()?);
        version.jira_task = self.jira_task;
        version.branch_name = self.branch_name;
        version.dev_branch_uri = self.git_dev_branch_uri;
        version.prod_branch_uri = self.git_prod_branch_uri;
        version.pull_request_url = self.pull_request_url;
        version.schedule_interval = self.schedule_interval;
        version.author_name = self.author_name;
        version.author_email = self.author_email;
        version.master_commit_hash = self.master_commit_hash;
        version.timestamps = StatusTimestamps {
            testing: self.moved_to_testing_at,
            prod_request: self.moved_to_prod_request_at,
            prod_review: self.moved_to_prod_review_at,
            prod_release: self.moved_to_prod_release_at,
            production: self.moved_to_production_at,
            turned_off: self.turned_off_at,
        };
        Ok(version)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CheckRow {
    id: i64,
    etl_project_version_id: i64,
    check_type: String,
    result: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct SimpleCheckRow {
    general_check_id: i64,
    description: String,
    result: String,
}

#[derive(Debug, sqlx::FromRow)]
struct TransferRow {
    id: i64,
    etl_project_version_id: i64,
    result: Option<String>,
    retry_counter: i32,
    error_msg: Option<String>,
    user_name: Option<String>,
    author_email: Option<String>,
    author_name: Option<String>,
    pr_reviewer_usernames: Vec<String>,
    pr_comment: Option<String>,
    created_at: DateTime<Utc>,
}

impl TransferRow {
    fn into_request(self) -> Result<TransferRequest> {
        let user = self.user_name.map(|user_name| UserRequestData {
            user_name,
            author_email: self.author_email.unwrap_or_default(),
            author_name: self.author_name.unwrap_or_default(),
        });
        Ok(TransferRequest {
            id: self.id,
            result: self.result.as_deref().map(str::parse).transpose()?,
            retry_counter: self.retry_counter,
            error_message: self.error_msg,
            user,
            reviewers: self.pr_reviewer_usernames,
            comment: self.pr_comment,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    id: i64,
    etl_project_version_id: i64,
    name: String,
    old_value: Option<String>,
    new_value: Option<String>,
    author: Option<String>,
    extra_data: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl From<HistoryRow> for HistoryRecord {
    fn from(row: HistoryRow) -> Self {
        Self {
            id: row.id,
            version_id: row.etl_project_version_id,
            name: row.name,
            old_value: row.old_value,
            new_value: row.new_value,
            author: row.author,
            created_at: row.created_at,
            extra_data: row.extra_data,
        }
    }
}

/// Value of the `version` column for a label.
fn label_column(label: VersionLabel) -> Result<i32> {
    i32::try_from(label.number())
        .map_err(|_| StoreError::InvalidData(format!("version label {label} exceeds the column range")))
}

/// Record store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store over a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Load checks, transfer requests and users for the given version rows.
async fn hydrate(conn: &mut PgConnection, rows: Vec<VersionRow>) -> Result<Vec<EtlProjectVersion>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();

    let check_rows = sqlx::query_as::<_, CheckRow>(
        r#"
        SELECT id, etl_project_version_id, check_type, result, created_at
        FROM general_checks
        WHERE etl_project_version_id = ANY($1)
        ORDER BY id
        "#,
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await?;

    let check_ids: Vec<i64> = check_rows.iter().map(|c| c.id).collect();
    let simple_rows = sqlx::query_as::<_, SimpleCheckRow>(
        r#"
        SELECT general_check_id, description, result
        FROM simple_checks
        WHERE general_check_id = ANY($1)
        ORDER BY general_check_id, position
        "#,
    )
    .bind(&check_ids)
    .fetch_all(&mut *conn)
    .await?;

    let transfer_rows = sqlx::query_as::<_, TransferRow>(
        r#"
        SELECT id, etl_project_version_id, result, retry_counter, error_msg, user_name,
               author_email, author_name, pr_reviewer_usernames, pr_comment, created_at
        FROM transfer_requests
        WHERE etl_project_version_id = ANY($1)
        ORDER BY id
        "#,
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await?;

    let user_rows = sqlx::query_as::<_, (i64, i64)>(
        r#"
        SELECT etl_project_version_id, user_id
        FROM version_users
        WHERE etl_project_version_id = ANY($1)
        ORDER BY user_id
        "#,
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await?;

    let mut sub_checks: HashMap<i64, Vec<SubCheck>> = HashMap::new();
    for row in simple_rows {
        sub_checks
            .entry(row.general_check_id)
            .or_default()
            .push(SubCheck {
                description: row.description,
                result: row.result.parse()?,
            });
    }

    let mut checks: HashMap<i64, Vec<GeneralCheck>> = HashMap::new();
    for row in check_rows {
        let kind: CheckKind = row.check_type.parse()?;
        checks
            .entry(row.etl_project_version_id)
            .or_default()
            .push(GeneralCheck {
                id: row.id,
                kind,
                result: row.result.parse()?,
                checks: sub_checks.remove(&row.id).unwrap_or_default(),
                created_at: row.created_at,
            });
    }

    let mut transfers: HashMap<i64, Vec<TransferRequest>> = HashMap::new();
    for row in transfer_rows {
        let version_id = row.etl_project_version_id;
        transfers
            .entry(version_id)
            .or_default()
            .push(row.into_request()?);
    }

    let mut users: HashMap<i64, Vec<i64>> = HashMap::new();
    for (version_id, user_id) in user_rows {
        users.entry(version_id).or_default().push(user_id);
    }

    rows.into_iter()
        .map(|row| {
            let mut version = row.into_version()?;
            version.checks = checks.remove(&version.id).unwrap_or_default();
            version.transfer_requests = transfers.remove(&version.id).unwrap_or_default();
            version.user_ids = users.remove(&version.id).unwrap_or_default();
            Ok(version)
        })
        .collect()
}

async fn fetch_version(
    conn: &mut PgConnection,
    id: VersionId,
    for_update: bool,
) -> Result<Option<EtlProjectVersion>> {
    let sql = format!(
        "{VERSION_SELECT} WHERE v.id = $1 {}",
        if for_update { "FOR UPDATE OF v" } else { "" }
    );
    let row = sqlx::query_as::<_, VersionRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    let versions = hydrate(conn, row.into_iter().collect()).await?;
    Ok(versions.into_iter().next())
}

async fn insert_history(conn: &mut PgConnection, event: &NewHistoryEvent) -> Result<HistoryRecord> {
    let row = sqlx::query_as::<_, HistoryRow>(
        r#"
        INSERT INTO history_events
            (etl_project_version_id, name, old_value, new_value, author, extra_data, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id, etl_project_version_id, name, old_value, new_value, author, extra_data, created_at
        "#,
    )
    .bind(event.version_id)
    .bind(&event.name)
    .bind(&event.old_value)
    .bind(&event.new_value)
    .bind(&event.author)
    .bind(&event.extra_data)
    .bind(event.created_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.into())
}

/// Compare-and-set the status of a locked version and write history.
async fn transition_locked(
    conn: &mut PgConnection,
    version_id: VersionId,
    transition: &StatusTransition,
) -> Result<EtlProjectVersion> {
    let mut version = fetch_version(conn, version_id, true)
        .await?
        .ok_or(StoreError::VersionNotFound(version_id))?;

    if version.status != transition.from {
        return Err(StoreError::StatusConflict {
            version_id,
            expected: transition.from,
            actual: version.status,
        });
    }

    version.status = transition.to;
    transition.apply_timestamps(&mut version.timestamps);
    let ts = &version.timestamps;

    sqlx::query(
        r#"
        UPDATE etl_project_versions
        SET status = $2,
            moved_to_testing_at = $3,
            moved_to_prod_request_at = $4,
            moved_to_prod_review_at = $5,
            moved_to_prod_release_at = $6,
            moved_to_production_at = $7,
            turned_off_at = $8
        WHERE id = $1
        "#,
    )
    .bind(version_id)
    .bind(transition.to.as_str())
    .bind(ts.testing)
    .bind(ts.prod_request)
    .bind(ts.prod_review)
    .bind(ts.prod_release)
    .bind(ts.production)
    .bind(ts.turned_off)
    .execute(&mut *conn)
    .await?;

    insert_history(conn, &transition.history_event(version_id)).await?;
    Ok(version)
}

#[async_trait]
impl RecordStore for PostgresStore {
    async fn get_version(&self, id: VersionId) -> Result<Option<EtlProjectVersion>> {
        let mut conn = self.pool.acquire().await?;
        fetch_version(&mut conn, id, false).await
    }

    async fn find_version(&self, key: VersionKey) -> Result<Option<EtlProjectVersion>> {
        Ok(self.find_versions(&[key]).await?.into_iter().next())
    }

    async fn find_versions(&self, keys: &[VersionKey]) -> Result<Vec<EtlProjectVersion>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let project_ids: Vec<i64> = keys.iter().map(|k| k.project_id).collect();
        let labels = keys
            .iter()
            .map(|k| label_column(k.version))
            .collect::<Result<Vec<i32>>>()?;

        let mut conn = self.pool.acquire().await?;
        let sql = format!(
            "{VERSION_SELECT} WHERE (v.etl_project_id, v.version) IN \
             (SELECT * FROM UNNEST($1::bigint[], $2::int[])) ORDER BY v.id"
        );
        let rows = sqlx::query_as::<_, VersionRow>(&sql)
            .bind(&project_ids)
            .bind(&labels)
            .fetch_all(&mut *conn)
            .await?;
        hydrate(&mut conn, rows).await
    }

    async fn find_active_production(
        &self,
        project_id: ProjectId,
        exclude: VersionId,
    ) -> Result<Option<EtlProjectVersion>> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!(
            "{VERSION_SELECT} WHERE v.etl_project_id = $1 AND v.id <> $2 AND v.status = $3 \
             ORDER BY v.version DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, VersionRow>(&sql)
            .bind(project_id)
            .bind(exclude)
            .bind(VersionStatus::Production.as_str())
            .fetch_optional(&mut *conn)
            .await?;
        Ok(hydrate(&mut conn, row.into_iter().collect())
            .await?
            .into_iter()
            .next())
    }

    async fn create_check(&self, version_id: VersionId, kind: CheckKind) -> Result<GeneralCheck> {
        let row = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
            r#"
            INSERT INTO general_checks (etl_project_version_id, check_type, result)
            SELECT $1, $2, 'PROCESSING'
            WHERE EXISTS (SELECT 1 FROM etl_project_versions WHERE id = $1)
            RETURNING id, created_at
            "#,
        )
        .bind(version_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::VersionNotFound(version_id))?;

        Ok(GeneralCheck {
            id: row.0,
            kind,
            result: CheckResult::Processing,
            checks: Vec::new(),
            created_at: row.1,
        })
    }

    async fn complete_check(
        &self,
        version_id: VersionId,
        completion: &CheckCompletion,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE general_checks SET result = $3
            WHERE id = $1 AND etl_project_version_id = $2
            "#,
        )
        .bind(completion.check_id)
        .bind(version_id)
        .bind(completion.result.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::CheckNotFound {
                version_id,
                check_id: completion.check_id,
            });
        }

        sqlx::query("DELETE FROM simple_checks WHERE general_check_id = $1")
            .bind(completion.check_id)
            .execute(&mut *tx)
            .await?;

        for (position, check) in completion.checks.iter().enumerate() {
            let position = i32::try_from(position).map_err(|_| {
                StoreError::InvalidData(format!(
                    "check {} has too many sub-checks",
                    completion.check_id
                ))
            })?;
            sqlx::query(
                r#"
                INSERT INTO simple_checks (general_check_id, position, description, result)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(completion.check_id)
            .bind(position)
            .bind(&check.description)
            .bind(check.result.as_str())
            .execute(&mut *tx)
            .await?;
        }

        if let Some(request) = &completion.transfer_request {
            sqlx::query(
                r#"
                INSERT INTO transfer_requests
                    (etl_project_version_id, retry_counter, user_name, author_email,
                     author_name, pr_reviewer_usernames, pr_comment)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(version_id)
            .bind(TransferRequest::RETRY_BUDGET)
            .bind(&request.user.user_name)
            .bind(&request.user.author_email)
            .bind(&request.user.author_name)
            .bind(&request.reviewers)
            .bind(&request.comment)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_schedule(&self, version_id: VersionId, schedule: &str) -> Result<()> {
        let result = sqlx::query("UPDATE etl_project_versions SET schedule_interval = $2 WHERE id = $1")
            .bind(version_id)
            .bind(schedule)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::VersionNotFound(version_id));
        }
        Ok(())
    }

    async fn apply_transition(
        &self,
        version_id: VersionId,
        transition: &StatusTransition,
    ) -> Result<EtlProjectVersion> {
        let mut tx = self.pool.begin().await?;
        let version = transition_locked(&mut tx, version_id, transition).await?;
        tx.commit().await?;
        Ok(version)
    }

    async fn apply_promotion(
        &self,
        version_id: VersionId,
        transition: &StatusTransition,
    ) -> Result<Promotion> {
        let mut tx = self.pool.begin().await?;
        let promoted = transition_locked(&mut tx, version_id, transition).await?;

        let replaced = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id FROM etl_project_versions
            WHERE etl_project_id = $1 AND id <> $2 AND status = $3
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(promoted.project.id)
        .bind(version_id)
        .bind(VersionStatus::Production.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let turn_off = StatusTransition::turn_off(transition.actor.clone(), transition.at);
        let mut turned_off = Vec::with_capacity(replaced.len());
        for id in replaced {
            turned_off.push(transition_locked(&mut tx, id, &turn_off).await?);
        }

        tx.commit().await?;
        Ok(Promotion {
            promoted,
            turned_off,
        })
    }

    async fn add_history_event(&self, event: &NewHistoryEvent) -> Result<HistoryRecord> {
        let mut conn = self.pool.acquire().await?;
        insert_history(&mut conn, event).await
    }

    async fn list_history(&self, version_id: VersionId) -> Result<Vec<HistoryRecord>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT id, etl_project_version_id, name, old_value, new_value, author, extra_data, created_at
            FROM history_events
            WHERE etl_project_version_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(version_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(HistoryRecord::from).collect())
    }

    async fn list_pending_transfers(&self, mark_processing: bool) -> Result<Vec<PendingTransfer>> {
        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT tr.id, tr.etl_project_version_id
            FROM transfer_requests tr
            JOIN etl_project_versions v ON v.id = tr.etl_project_version_id
            WHERE v.status = $1
              AND tr.id = (
                  SELECT MAX(id) FROM transfer_requests
                  WHERE etl_project_version_id = v.id
              )
              AND (tr.result IS NULL OR tr.result = 'RETRYING')
              AND tr.error_msg IS NULL
            ORDER BY tr.id
            FOR UPDATE OF tr
            "#,
        )
        .bind(VersionStatus::ProdRequest.as_str())
        .fetch_all(&mut *tx)
        .await?;

        if locked.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let request_ids: Vec<i64> = locked.iter().map(|(id, _)| *id).collect();
        let version_ids: Vec<i64> = locked.iter().map(|(_, v)| *v).collect();

        if mark_processing {
            sqlx::query("UPDATE transfer_requests SET result = 'PROCESSING' WHERE id = ANY($1)")
                .bind(&request_ids)
                .execute(&mut *tx)
                .await?;
        }

        let sql = format!("{VERSION_SELECT} WHERE v.id = ANY($1) ORDER BY v.id");
        let rows = sqlx::query_as::<_, VersionRow>(&sql)
            .bind(&version_ids)
            .fetch_all(&mut *tx)
            .await?;
        let versions = hydrate(&mut tx, rows).await?;

        tx.commit().await?;

        Ok(versions
            .into_iter()
            .filter_map(|version| {
                let request = version
                    .transfer_requests
                    .iter()
                    .find(|t| request_ids.contains(&t.id))?
                    .clone();
                Some(PendingTransfer { version, request })
            })
            .collect())
    }

    async fn apply_transfer_update(&self, update: &TransferUpdate) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        match &update.transition {
            Some(transition) => {
                transition_locked(&mut tx, update.version_id, transition).await?;
            }
            None => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT id FROM etl_project_versions WHERE id = $1 FOR UPDATE",
                )
                .bind(update.version_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(StoreError::VersionNotFound(update.version_id))?;
            }
        }

        if update.prod_branch_uri.is_some() || update.pull_request_url.is_some() {
            sqlx::query(
                r#"
                UPDATE etl_project_versions
                SET git_prod_branch_uri = COALESCE($2, git_prod_branch_uri),
                    pull_request_url = COALESCE($3, pull_request_url)
                WHERE id = $1
                "#,
            )
            .bind(update.version_id)
            .bind(&update.prod_branch_uri)
            .bind(&update.pull_request_url)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(request) = &update.transfer_request {
            let result = sqlx::query(
                r#"
                UPDATE transfer_requests
                SET result = $3, retry_counter = $4, error_msg = $5
                WHERE id = $1 AND etl_project_version_id = $2
                "#,
            )
            .bind(request.id)
            .bind(update.version_id)
            .bind(request.result.map(|r| r.as_str()))
            .bind(request.retry_counter)
            .bind(&request.error_message)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::TransferRequestNotFound {
                    version_id: update.version_id,
                    request_id: request.id,
                });
            }
        }

        if let (Some(key), Some(hash)) = (update.predecessor, &update.master_commit_hash) {
            sqlx::query(
                r#"
                UPDATE etl_project_versions SET master_commit_hash = $3
                WHERE etl_project_id = $1 AND version = $2
                "#,
            )
            .bind(key.project_id)
            .bind(label_column(key.version)?)
            .bind(hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
