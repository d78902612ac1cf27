//! SQLite backend implementation
//!
//! Persistent storage for jobs, job steps and connection records using
//! SQLite with WAL mode for concurrency. Step ordering relies on the
//! `display_id` token assigned here at insert time: it is derived from the
//! autoincrement rowid, zero-padded so that lexicographic order equals
//! insertion order.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row};
use std::str::FromStr;

use crate::store::{Attachment, ConnectionRepository, JobStore, StoreError};
use crate::{Connection, Job, JobStep, StepKind, StepStatus};

/// SQLite-backed record store for jobs, steps and connections.
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open or create a SQLite database at the specified path.
    ///
    /// Automatically runs migrations to set up the schema.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let db_url = if path.starts_with("sqlite://") {
            path.to_string()
        } else {
            format!("sqlite://{}", path)
        };

        if !sqlx::Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            sqlx::Sqlite::create_database(&db_url)
                .await
                .context("failed to create database")?;
        }

        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(|e| StoreError::Backend(e.into()))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;

        Ok(Self { pool })
    }

    /// The underlying pool, shared with health checks.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_job(row: &SqliteRow) -> Result<Job, StoreError> {
    Ok(Job {
        id: Some(row.try_get("id")?),
        datasource: row.try_get("datasource")?,
        doc_id: row.try_get("doc_id")?,
        doc_display_id: row.try_get("doc_display_id")?,
        uri: row.try_get("uri")?,
        file: row.try_get("file")?,
        load_directory: row.try_get("load_directory")?,
        upload: None,
        stored_upload_filename: row.try_get("upload_filename")?,
        modified_since: row.try_get::<Option<DateTime<Utc>>, _>("modified_since")?,
        connection_id: row.try_get("connection_id")?,
        sync_deletions: row.try_get("sync_deletions")?,
    })
}

fn row_to_job_step(row: &SqliteRow) -> Result<JobStep, StoreError> {
    Ok(JobStep {
        id: Some(row.try_get("id")?),
        display_id: row.try_get("display_id")?,
        job_id: row.try_get("job_id")?,
        kind: StepKind::from_code(row.try_get("kind")?)?,
        datasource: row.try_get("datasource")?,
        status: StepStatus::from_code(row.try_get("status")?)?,
        doc_id: row.try_get("doc_id")?,
        doc_display_id: row.try_get("doc_display_id")?,
        executing_node: row.try_get("executing_node")?,
        error_details: row.try_get("error_details")?,
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn store_job(&self, job: &mut Job) -> Result<(), StoreError> {
        if job.id.is_some() {
            return Err(StoreError::Backend(anyhow!(
                "cannot store an already persisted job"
            )));
        }

        let upload = job.upload.as_deref();
        let result = sqlx::query(
            "INSERT INTO jobs (datasource, doc_id, doc_display_id, uri, file, load_directory,
                               upload_filename, upload_content_type, upload_content,
                               modified_since, connection_id, sync_deletions)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.datasource)
        .bind(&job.doc_id)
        .bind(&job.doc_display_id)
        .bind(&job.uri)
        .bind(&job.file)
        .bind(job.load_directory)
        .bind(upload.map(|u| u.filename.clone()))
        .bind(upload.and_then(|u| u.content_type.clone()))
        .bind(upload.map(|u| u.content.clone()))
        .bind(job.modified_since)
        .bind(job.connection_id)
        .bind(job.sync_deletions)
        .execute(&self.pool)
        .await?;

        job.id = Some(result.last_insert_rowid());
        Ok(())
    }

    async fn store_job_step(
        &self,
        step: &mut JobStep,
        job: Option<&mut Job>,
    ) -> Result<(), StoreError> {
        match job {
            Some(job) => {
                if job.id.is_none() {
                    self.store_job(job).await?;
                }
                step.job_id = job.id;
            }
            None => {
                if step.job_id.is_none() {
                    return Err(StoreError::Backend(anyhow!(
                        "cannot store a job step without a parent job reference"
                    )));
                }
            }
        }

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO job_steps (job_id, kind, datasource, status, doc_id, doc_display_id,
                                    executing_node, error_details)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(step.job_id)
        .bind(step.kind.code())
        .bind(&step.datasource)
        .bind(step.status.code())
        .bind(&step.doc_id)
        .bind(&step.doc_display_id)
        .bind(&step.executing_node)
        .bind(&step.error_details)
        .execute(&mut *tx)
        .await?;

        let step_id = result.last_insert_rowid();
        let display_id = format!("{:012}", step_id);
        sqlx::query("UPDATE job_steps SET display_id = ? WHERE id = ?")
            .bind(&display_id)
            .bind(step_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        step.id = Some(step_id);
        step.display_id = Some(display_id);
        Ok(())
    }

    async fn get_job(&self, job_id: i64) -> Result<Job, StoreError> {
        let row = sqlx::query(
            "SELECT id, datasource, doc_id, doc_display_id, uri, file, load_directory,
                    upload_filename, modified_since, connection_id, sync_deletions
             FROM jobs WHERE id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(StoreError::JobNotFound(job_id)),
        }
    }

    async fn get_job_step(&self, step_id: i64) -> Result<JobStep, StoreError> {
        let row = sqlx::query(
            "SELECT id, display_id, job_id, kind, datasource, status, doc_id, doc_display_id,
                    executing_node, error_details
             FROM job_steps WHERE id = ?",
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_job_step(&row),
            None => Err(StoreError::StepNotFound(step_id)),
        }
    }

    async fn has_job_steps(&self, job_id: i64) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT id FROM job_steps WHERE job_id = ? LIMIT 1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_pending_job_steps(
        &self,
        job_id: i64,
        limit: usize,
        after_display_id: Option<&str>,
    ) -> Result<Vec<JobStep>, StoreError> {
        let rows = if let Some(after) = after_display_id {
            sqlx::query(
                "SELECT id, display_id, job_id, kind, datasource, status, doc_id, doc_display_id,
                        executing_node, error_details
                 FROM job_steps
                 WHERE job_id = ? AND status = ? AND display_id > ?
                 ORDER BY display_id ASC
                 LIMIT ?",
            )
            .bind(job_id)
            .bind(StepStatus::Pending.code())
            .bind(after)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, display_id, job_id, kind, datasource, status, doc_id, doc_display_id,
                        executing_node, error_details
                 FROM job_steps
                 WHERE job_id = ? AND status = ?
                 ORDER BY display_id ASC
                 LIMIT ?",
            )
            .bind(job_id)
            .bind(StepStatus::Pending.code())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter().map(row_to_job_step).collect()
    }

    async fn set_job_step_status(
        &self,
        step_id: i64,
        status: StepStatus,
        executing_node: Option<&str>,
        error_details: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut sql = String::from("UPDATE job_steps SET status = ?");
        if executing_node.is_some() {
            sql.push_str(", executing_node = ?");
        }
        if error_details.is_some() {
            sql.push_str(", error_details = ?");
        } else if status != StepStatus::Error {
            // Clean stale error details unless they were explicitly passed.
            sql.push_str(", error_details = NULL");
        }
        sql.push_str(" WHERE id = ?");

        let mut query = sqlx::query(&sql).bind(status.code());
        if let Some(node) = executing_node {
            query = query.bind(node);
        }
        if let Some(details) = error_details {
            query = query.bind(details);
        }
        let result = query.bind(step_id).execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StepNotFound(step_id));
        }
        Ok(())
    }

    async fn claim_job_step(&self, step: &mut JobStep, node: &str) -> Result<(), StoreError> {
        let step_id = step
            .id
            .ok_or_else(|| StoreError::Backend(anyhow!("cannot claim an unpersisted job step")))?;

        // Make sure the step still is available for execution.
        let reloaded = self.get_job_step(step_id).await?;
        step.status = reloaded.status;
        step.executing_node = reloaded.executing_node;

        if step.status != StepStatus::Pending {
            return Err(StoreError::ClaimConflict {
                step_id,
                status: step.status,
            });
        }

        // Mark the step as IN_PROGRESS, guarded on it still being PENDING so
        // a racing node cannot claim it twice.
        let result = sqlx::query(
            "UPDATE job_steps SET status = ?, executing_node = ?, error_details = NULL
             WHERE id = ? AND status = ?",
        )
        .bind(StepStatus::InProgress.code())
        .bind(node)
        .bind(step_id)
        .bind(StepStatus::Pending.code())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::ClaimTransport {
            step_id,
            source: e.into(),
        })?;

        if result.rows_affected() == 0 {
            let reloaded = self.get_job_step(step_id).await?;
            step.status = reloaded.status;
            step.executing_node = reloaded.executing_node;
            return Err(StoreError::ClaimConflict {
                step_id,
                status: step.status,
            });
        }

        step.status = StepStatus::InProgress;
        step.executing_node = Some(node.to_string());
        Ok(())
    }

    async fn get_job_attachment(&self, job_id: i64) -> Result<Option<Attachment>, StoreError> {
        let row = sqlx::query(
            "SELECT upload_filename, upload_content_type, upload_content FROM jobs WHERE id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::JobNotFound(job_id))?;

        let content: Option<Vec<u8>> = row.try_get("upload_content")?;
        Ok(content.map(|content| Attachment {
            filename: row.try_get("upload_filename").ok().flatten(),
            content_type: row.try_get("upload_content_type").ok().flatten(),
            content,
        }))
    }
}

#[async_trait]
impl ConnectionRepository for SqliteJobStore {
    async fn get_connection(&self, connection_id: i64) -> Result<Connection, StoreError> {
        let row = sqlx::query("SELECT id, datasource, name, properties FROM connections WHERE id = ?")
            .bind(connection_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::ConnectionNotFound(connection_id))?;

        let raw_properties: String = row.try_get("properties")?;
        let properties = serde_json::from_str(&raw_properties)
            .with_context(|| format!("invalid connection {} properties", connection_id))?;

        Ok(Connection {
            id: row.try_get("id")?,
            datasource: row.try_get("datasource")?,
            name: row.try_get("name")?,
            properties,
        })
    }
}
