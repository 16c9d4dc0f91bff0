use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::encoder::{ResolutionRung, VariantDescriptor};
use crate::sqlite::configure_connection;

const JOBS_SCHEMA: &str = include_str!("../../sql/jobs.sql");

pub const DEFAULT_QUEUE_NAME: &str = "video-processing";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to open jobs database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on jobs database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("queue path not configured")]
    MissingStore,
    #[error("invalid job state: {0}")]
    InvalidState(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job {id} is not active (state: {state})")]
    NotActive { id: String, state: JobState },
    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(QueueError::InvalidState(other.to_string())),
        }
    }
}

/// What a submitted job carries: where the upload landed, which video
/// record it belongs to, who uploaded it, and the ladder to produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub source_path: PathBuf,
    pub video_id: String,
    pub uploader_id: String,
    pub ladder: Vec<ResolutionRung>,
}

/// Result of a completed job: every produced rendition plus the master
/// manifest location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub variants: Vec<VariantDescriptor>,
    pub manifest_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub progress: u8,
    pub result: Option<JobOutcome>,
    pub last_error: Option<String>,
    pub available_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let payload: String = row.get("payload")?;
        let payload = serde_json::from_str(&payload).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })?;
        let result: Option<String> = row.get("result")?;
        let result = match result {
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?),
            None => None,
        };
        Ok(Self {
            id: row.get("id")?,
            queue: row.get("queue")?,
            payload,
            state: row
                .get::<_, String>("state")?
                .parse()
                .unwrap_or(JobState::Waiting),
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            progress: row.get::<_, i64>("progress")?.clamp(0, 100) as u8,
            result,
            last_error: row.get("last_error")?,
            available_at: parse_timestamp(row.get("available_at")?)?,
            created_at: parse_timestamp(row.get("created_at")?)?,
            started_at: parse_timestamp(row.get("started_at")?)?,
            finished_at: parse_timestamp(row.get("finished_at")?)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub max_attempts: u32,
    /// Initial delivery delay; used by explicit resubmission paths.
    pub delay: Option<StdDuration>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub limit: Option<usize>,
}

/// Result of a lease sweep: how many jobs went back to waiting, plus the
/// jobs that ran out of attempts and were failed instead.
#[derive(Debug, Default)]
pub struct ReclaimReport {
    pub requeued: usize,
    pub failed: Vec<Job>,
}

#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub counts: HashMap<JobState, i64>,
    pub completed_last_hour: i64,
    pub failed_last_hour: i64,
}

#[derive(Debug, Clone)]
pub struct JobQueueBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
    queue_name: String,
    lease: StdDuration,
    backoff_base: StdDuration,
}

impl Default for JobQueueBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            lease: StdDuration::from_secs(600),
            backoff_base: StdDuration::from_millis(5000),
        }
    }
}

impl JobQueueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn lease(mut self, lease: StdDuration) -> Self {
        self.lease = lease;
        self
    }

    pub fn backoff_base(mut self, base: StdDuration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn build(self) -> QueueResult<JobQueue> {
        let path = self.path.ok_or(QueueError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(JobQueue {
            path,
            flags,
            queue_name: self.queue_name,
            lease: self.lease,
            backoff_base: self.backoff_base,
        })
    }
}

/// Durable at-least-once FIFO work queue for transcode jobs.
///
/// A claimed job carries a lease; if the worker dies before ack/nack the
/// lease expires and the job becomes deliverable again. Retried deliveries
/// re-run the whole pipeline, which each attempt makes safe by overwriting
/// its own output directory.
#[derive(Debug, Clone)]
pub struct JobQueue {
    path: PathBuf,
    flags: OpenFlags,
    queue_name: String,
    lease: StdDuration,
    backoff_base: StdDuration,
}

impl JobQueue {
    pub fn builder() -> JobQueueBuilder {
        JobQueueBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> QueueResult<Self> {
        JobQueueBuilder::new().path(path).build()
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn open(&self) -> QueueResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            QueueError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| QueueError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> QueueResult<()> {
        let conn = self.open()?;
        conn.execute_batch(JOBS_SCHEMA)?;
        Ok(())
    }

    /// Inserts a waiting job and returns its id. Submission never touches
    /// the job again except through an explicit resubmission.
    pub fn enqueue(&self, payload: &JobPayload, options: &EnqueueOptions) -> QueueResult<String> {
        let conn = self.open()?;
        let id = Uuid::new_v4().to_string();
        let raw = serde_json::to_string(payload)?;
        let available_at = match options.delay {
            Some(delay) => Utc::now() + to_chrono(delay),
            None => Utc::now(),
        };
        conn.execute(
            "INSERT INTO jobs (id, queue, payload, state, max_attempts, available_at)
             VALUES (?1, ?2, ?3, 'waiting', ?4, ?5)",
            params![
                &id,
                &self.queue_name,
                &raw,
                options.max_attempts,
                available_at.naive_utc()
            ],
        )?;
        Ok(id)
    }

    /// Claims the oldest due waiting job: marks it active, increments its
    /// attempts counter, resets progress to zero and stamps a lease.
    /// Returns `None` when nothing is due; callers poll.
    pub fn claim(&self) -> QueueResult<Option<Job>> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let now = Utc::now().naive_utc();

        let candidate: Option<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs
                 WHERE queue = ?1 AND state = 'waiting' AND available_at <= ?2
                 ORDER BY available_at ASC, rowid ASC LIMIT 1",
            )?;
            let mut rows = stmt.query(params![&self.queue_name, now])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        let Some(id) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        let lease_expires = now + to_chrono(self.lease);
        tx.execute(
            "UPDATE jobs SET state = 'active', attempts = attempts + 1, progress = 0,
                             started_at = ?2, lease_expires_at = ?3
             WHERE id = ?1",
            params![&id, now, lease_expires],
        )?;
        let job = {
            let mut stmt = tx.prepare("SELECT * FROM jobs WHERE id = ?1")?;
            stmt.query_row([&id], Job::from_row)?
        };
        tx.commit()?;
        Ok(Some(job))
    }

    /// Returns expired-lease active jobs to the waiting state, or fails
    /// them permanently when their attempts are already exhausted. This is
    /// what makes delivery at-least-once across worker crashes. The
    /// terminally-failed jobs come back in the report so the caller can run
    /// its own failure bookkeeping for them.
    pub fn reclaim_expired(&self) -> QueueResult<ReclaimReport> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let now = Utc::now().naive_utc();

        let exhausted: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs
                 WHERE state = 'active' AND lease_expires_at < ?1 AND attempts >= max_attempts",
            )?;
            let mut rows = stmt.query([now])?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next()? {
                ids.push(row.get(0)?);
            }
            ids
        };
        for id in &exhausted {
            tx.execute(
                "UPDATE jobs SET state = 'failed', finished_at = ?2, lease_expires_at = NULL,
                                 last_error = COALESCE(last_error, 'worker lease expired')
                 WHERE id = ?1",
                params![id, now],
            )?;
        }
        let requeued = tx.execute(
            "UPDATE jobs SET state = 'waiting', lease_expires_at = NULL, available_at = ?1
             WHERE state = 'active' AND lease_expires_at < ?1",
            [now],
        )?;

        let mut failed = Vec::with_capacity(exhausted.len());
        {
            let mut stmt = tx.prepare("SELECT * FROM jobs WHERE id = ?1")?;
            for id in &exhausted {
                failed.push(stmt.query_row([id], Job::from_row)?);
            }
        }
        tx.commit()?;
        Ok(ReclaimReport { requeued, failed })
    }

    /// Acknowledges a successful job with its outcome.
    pub fn ack(&self, id: &str, outcome: &JobOutcome) -> QueueResult<()> {
        let conn = self.open()?;
        let raw = serde_json::to_string(outcome)?;
        let affected = conn.execute(
            "UPDATE jobs SET state = 'completed', result = ?2, progress = 100,
                             finished_at = ?3, lease_expires_at = NULL, last_error = NULL
             WHERE id = ?1 AND state = 'active'",
            params![id, &raw, Utc::now().naive_utc()],
        )?;
        if affected == 0 {
            return Err(self.not_active(&conn, id));
        }
        Ok(())
    }

    /// Reports a failed attempt. Retryable failures are re-enqueued with
    /// exponential backoff (`base * 2^(attempts-1)`) until attempts are
    /// exhausted; non-retryable failures (validation) and exhausted jobs go
    /// straight to the failed state. Returns the state the job ended in so
    /// the worker can detect terminal failure.
    pub fn nack(&self, id: &str, error: &str, retryable: bool) -> QueueResult<JobState> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let now = Utc::now().naive_utc();

        let row: Option<(String, u32, u32)> = {
            let mut stmt =
                tx.prepare("SELECT state, attempts, max_attempts FROM jobs WHERE id = ?1")?;
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(row) => Some((row.get(0)?, row.get(1)?, row.get(2)?)),
                None => None,
            }
        };
        let Some((state, attempts, max_attempts)) = row else {
            tx.commit()?;
            return Err(QueueError::NotFound(id.to_string()));
        };
        if state != JobState::Active.as_str() {
            tx.commit()?;
            return Err(QueueError::NotActive {
                id: id.to_string(),
                state: state.parse().unwrap_or(JobState::Waiting),
            });
        }

        let next = if retryable && attempts < max_attempts {
            let delay = compute_backoff(self.backoff_base, attempts);
            let available_at = now + to_chrono(delay);
            tx.execute(
                "UPDATE jobs SET state = 'waiting', last_error = ?2, available_at = ?3,
                                 lease_expires_at = NULL
                 WHERE id = ?1",
                params![id, error, available_at],
            )?;
            JobState::Waiting
        } else {
            tx.execute(
                "UPDATE jobs SET state = 'failed', last_error = ?2, finished_at = ?3,
                                 lease_expires_at = NULL
                 WHERE id = ?1",
                params![id, error, now],
            )?;
            JobState::Failed
        };
        tx.commit()?;
        Ok(next)
    }

    /// Worker-side progress write; a stale job (reclaimed or finished
    /// elsewhere) is silently skipped.
    pub fn set_progress(&self, id: &str, percent: u8) -> QueueResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE jobs SET progress = ?2 WHERE id = ?1 AND state = 'active'",
            params![id, percent.min(100)],
        )?;
        Ok(())
    }

    /// Point read of one job; a single-row SELECT, so the caller always
    /// sees a consistent pre- or post-mutation snapshot.
    pub fn get_job(&self, id: &str) -> QueueResult<Job> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Job::from_row(row)?),
            None => Err(QueueError::NotFound(id.to_string())),
        }
    }

    pub fn list(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM jobs WHERE queue = ?");
        let mut params: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(self.queue_name.clone())];
        if let Some(state) = filter.state {
            query.push_str(" AND state = ?");
            params.push(rusqlite::types::Value::Text(state.as_str().to_string()));
        }
        query.push_str(" ORDER BY created_at ASC, rowid ASC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(rusqlite::types::Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(
            params.iter().map(|value| value as &dyn rusqlite::ToSql),
        ))?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(Job::from_row(row)?);
        }
        Ok(jobs)
    }

    pub fn metrics(&self) -> QueueResult<QueueMetrics> {
        let conn = self.open()?;
        let mut metrics = QueueMetrics::default();
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY state")?;
        let mut rows = stmt.query([&self.queue_name])?;
        while let Some(row) = rows.next()? {
            let state: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            if let Ok(state) = state.parse() {
                metrics.counts.insert(state, count);
            }
        }
        let cutoff = (Utc::now() - Duration::hours(1)).naive_utc();
        metrics.completed_last_hour = conn
            .query_row(
                "SELECT COUNT(*) FROM jobs WHERE state = 'completed' AND finished_at >= ?1",
                [cutoff],
                |row| row.get(0),
            )
            .unwrap_or(0);
        metrics.failed_last_hour = conn
            .query_row(
                "SELECT COUNT(*) FROM jobs WHERE state = 'failed' AND finished_at >= ?1",
                [cutoff],
                |row| row.get(0),
            )
            .unwrap_or(0);
        Ok(metrics)
    }

    /// Bounded history retention: keeps the most recent completed/failed
    /// jobs up to the given counts and evicts the rest, oldest first.
    /// Observability-only; never affects waiting or active jobs.
    pub fn trim_history(&self, keep_completed: usize, keep_failed: usize) -> QueueResult<usize> {
        let conn = self.open()?;
        let mut removed = 0;
        for (state, keep) in [("completed", keep_completed), ("failed", keep_failed)] {
            removed += conn.execute(
                "DELETE FROM jobs WHERE state = ?1 AND id NOT IN (
                     SELECT id FROM jobs WHERE state = ?1
                     ORDER BY finished_at DESC, rowid DESC LIMIT ?2
                 )",
                params![state, keep as i64],
            )?;
        }
        Ok(removed)
    }

    /// Writes a gzip-compressed SQL dump of the jobs table, for operator
    /// backups and postmortems.
    pub fn export_backup(&self, output: impl AsRef<Path>) -> QueueResult<()> {
        let output = output.as_ref();
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.open()?;
        let mut dump = String::new();
        dump.push_str(JOBS_SCHEMA);
        dump.push_str("\nBEGIN;\n");

        let columns = "id, queue, payload, state, attempts, max_attempts, progress, result, \
                       last_error, available_at, lease_expires_at, created_at, started_at, finished_at";
        let mut stmt = conn.prepare(&format!("SELECT {columns} FROM jobs ORDER BY rowid"))?;
        let column_count = stmt.column_count();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for index in 0..column_count {
                values.push(format_sql_value(row.get_ref(index)?));
            }
            dump.push_str(&format!(
                "INSERT INTO jobs ({columns}) VALUES ({});\n",
                values.join(", ")
            ));
        }
        dump.push_str("COMMIT;\n");

        let file = File::create(output)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(dump.as_bytes())?;
        encoder.finish()?;
        Ok(())
    }

    fn not_active(&self, conn: &Connection, id: &str) -> QueueError {
        let state: Option<String> = conn
            .query_row("SELECT state FROM jobs WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .ok();
        match state {
            Some(state) => QueueError::NotActive {
                id: id.to_string(),
                state: state.parse().unwrap_or(JobState::Waiting),
            },
            None => QueueError::NotFound(id.to_string()),
        }
    }
}

/// `base * 2^(attempts-1)` for the attempt that just failed (1-based).
pub fn compute_backoff(base: StdDuration, attempts: u32) -> StdDuration {
    let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
    base.saturating_mul(factor)
}

fn to_chrono(duration: StdDuration) -> Duration {
    Duration::milliseconds(duration.as_millis() as i64)
}

fn format_sql_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(value) => value.to_string(),
        ValueRef::Real(value) => value.to_string(),
        ValueRef::Text(text) => sql_quote(&String::from_utf8_lossy(text)),
        ValueRef::Blob(blob) => format!("X'{}'", hex::encode(blob)),
    }
}

fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    Ok(value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc)))
}
