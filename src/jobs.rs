use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::provider::SearchQuery;

/// Parameters of one import run as accepted by the trigger surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub location: String,
    #[serde(alias = "radiusMeters")]
    pub radius: u32,
    #[serde(default)]
    pub category: Option<String>,
    pub max_results: usize,
    #[serde(default)]
    pub dry_run: bool,
}

impl ImportRequest {
    pub fn validate(&self) -> AppResult<()> {
        if self.location.trim().is_empty() {
            return Err(AppError::Validation("location is required".into()));
        }
        if self.radius == 0 {
            return Err(AppError::Validation("radius must be positive".into()));
        }
        if self.max_results == 0 {
            return Err(AppError::Validation("maxResults must be positive".into()));
        }
        Ok(())
    }

    pub fn search_query(&self, cap: usize) -> SearchQuery {
        SearchQuery {
            location: self.location.trim().to_string(),
            radius_meters: self.radius,
            category: self
                .category
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
            max_results: self.max_results.min(cap),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(FromSqlError::Other(
                format!("unknown job status: {other}").into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub total_found: u32,
    pub new_places: u32,
    pub updated_places: u32,
    pub skipped_places: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: i64,
    pub provider: Option<String>,
    pub request: ImportRequest,
    pub status: JobStatus,
    #[serde(flatten)]
    pub counts: JobCounts,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

#[derive(Clone)]
pub struct ImportJobStore {
    db: Arc<Mutex<Connection>>,
}

impl ImportJobStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn create(&self, request: &ImportRequest, provider: &str) -> AppResult<i64> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO import_jobs (
                location, radius_meters, category, max_results, dry_run, status, provider, started_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6, ?7)",
            params![
                request.location,
                request.radius,
                request.category,
                request.max_results as i64,
                request.dry_run,
                provider,
                Utc::now()
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(job_id = id, "import job created");
        Ok(id)
    }

    pub fn append_error(&self, job_id: i64, message: &str) -> AppResult<()> {
        let conn = self.db.lock();
        ensure_running(&conn, job_id)?;
        conn.execute(
            "INSERT INTO import_job_errors (job_id, message, recorded_at) VALUES (?1, ?2, ?3)",
            params![job_id, message, Utc::now()],
        )?;
        Ok(())
    }

    /// Moves a running job to its terminal status. Terminal jobs are frozen.
    pub fn finalize(&self, job_id: i64, status: JobStatus, counts: JobCounts) -> AppResult<()> {
        if !status.is_terminal() {
            return Err(AppError::Validation(format!(
                "job {job_id} cannot be finalized as {status}"
            )));
        }
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE import_jobs SET
                status = ?1,
                total_found = ?2,
                new_places = ?3,
                updated_places = ?4,
                skipped_places = ?5,
                finished_at = ?6
            WHERE id = ?7 AND status = 'running'",
            params![
                status,
                counts.total_found,
                counts.new_places,
                counts.updated_places,
                counts.skipped_places,
                Utc::now(),
                job_id
            ],
        )?;
        if changed == 0 {
            ensure_running(&conn, job_id)?;
        }
        Ok(())
    }

    pub fn get(&self, job_id: i64) -> AppResult<ImportJob> {
        let conn = self.db.lock();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE id = ?1"),
                [job_id],
                job_from_row,
            )
            .optional()?
            .ok_or_else(|| AppError::NotFound(format!("import job {job_id}")))?;
        with_errors(&conn, job)
    }

    /// Most recent jobs first.
    pub fn list_recent(&self, limit: usize) -> AppResult<Vec<ImportJob>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM import_jobs ORDER BY id DESC LIMIT ?1"
        ))?;
        let jobs = stmt
            .query_map([limit as i64], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        jobs.into_iter().map(|job| with_errors(&conn, job)).collect()
    }
}

const JOB_COLUMNS: &str = "id, provider, location, radius_meters, category, max_results, dry_run,
    status, total_found, new_places, updated_places, skipped_places, started_at, finished_at";

fn ensure_running(conn: &Connection, job_id: i64) -> AppResult<()> {
    let status: Option<JobStatus> = conn
        .query_row(
            "SELECT status FROM import_jobs WHERE id = ?1",
            [job_id],
            |row| row.get(0),
        )
        .optional()?;
    match status {
        None => Err(AppError::NotFound(format!("import job {job_id}"))),
        Some(JobStatus::Running) => Ok(()),
        Some(status) => Err(AppError::Validation(format!(
            "import job {job_id} is already {status}"
        ))),
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<ImportJob> {
    let started_at: DateTime<Utc> = row.get(12)?;
    let finished_at: Option<DateTime<Utc>> = row.get(13)?;
    let max_results: i64 = row.get(5)?;
    Ok(ImportJob {
        id: row.get(0)?,
        provider: row.get(1)?,
        request: ImportRequest {
            location: row.get(2)?,
            radius: row.get(3)?,
            category: row.get(4)?,
            max_results: max_results.max(0) as usize,
            dry_run: row.get(6)?,
        },
        status: row.get(7)?,
        counts: JobCounts {
            total_found: row.get(8)?,
            new_places: row.get(9)?,
            updated_places: row.get(10)?,
            skipped_places: row.get(11)?,
        },
        errors: Vec::new(),
        started_at,
        finished_at,
        duration_ms: finished_at.map(|end| (end - started_at).num_milliseconds()),
    })
}

fn with_errors(conn: &Connection, mut job: ImportJob) -> AppResult<ImportJob> {
    let mut stmt =
        conn.prepare("SELECT message FROM import_job_errors WHERE job_id = ?1 ORDER BY id ASC")?;
    job.errors = stmt
        .query_map([job.id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(job)
}
