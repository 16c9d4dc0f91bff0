use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encoder::VariantDescriptor;
use crate::sqlite::configure_connection;

const VIDEOS_SCHEMA: &str = include_str!("../../sql/videos.sql");

#[derive(Debug, Error)]
pub enum VideoStoreError {
    #[error("failed to open videos database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on videos database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("videos path not configured")]
    MissingStore,
    #[error("invalid video status: {0}")]
    InvalidStatus(String),
    #[error("video not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type VideoStoreResult<T> = Result<T, VideoStoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Processing,
    Published,
    Failed,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Processing => "processing",
            VideoStatus::Published => "published",
            VideoStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for VideoStatus {
    type Err = VideoStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            other => Err(VideoStoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// The domain record the pipeline reports into. Invariant: `published`
/// implies the manifest and every referenced variant exist at their
/// declared locations; only `persist_success` makes that transition.
#[derive(Debug, Clone)]
pub struct VideoRecord {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub status: VideoStatus,
    pub manifest_url: Option<String>,
    pub variants: HashMap<String, VariantDescriptor>,
    pub duration: Option<f64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl VideoRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let variants: Option<String> = row.get("variants")?;
        let variants = match variants {
            Some(raw) => serde_json::from_str(&raw).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?,
            None => HashMap::new(),
        };
        Ok(Self {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            title: row.get("title")?,
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(VideoStatus::Processing),
            manifest_url: row.get("manifest_url")?,
            variants,
            duration: row.get("duration")?,
            created_at: parse_timestamp(row.get("created_at")?)?,
            updated_at: parse_timestamp(row.get("updated_at")?)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteVideoStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteVideoStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteVideoStoreBuilder {
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

    pub fn build(self) -> VideoStoreResult<SqliteVideoStore> {
        let path = self.path.ok_or(VideoStoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteVideoStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteVideoStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteVideoStore {
    pub fn builder() -> SqliteVideoStoreBuilder {
        SqliteVideoStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> VideoStoreResult<Self> {
        SqliteVideoStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> VideoStoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            VideoStoreError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| VideoStoreError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> VideoStoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(VIDEOS_SCHEMA)?;
        Ok(())
    }

    /// Registers a freshly uploaded video in the `processing` state. Called
    /// by the upload collaborator before the job is submitted.
    pub fn create_processing(
        &self,
        id: &str,
        owner_id: &str,
        title: &str,
    ) -> VideoStoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO videos (id, owner_id, title, status) VALUES (?1, ?2, ?3, 'processing')",
            params![id, owner_id, title],
        )?;
        Ok(())
    }

    /// The single point where a video becomes externally playable: stores
    /// the manifest reference, the label -> variant map and the duration,
    /// and flips the status to `published`.
    pub fn persist_success(
        &self,
        id: &str,
        manifest_url: &str,
        variants: &[VariantDescriptor],
        duration: f64,
    ) -> VideoStoreResult<()> {
        let map: HashMap<&str, &VariantDescriptor> = variants
            .iter()
            .map(|variant| (variant.label.as_str(), variant))
            .collect();
        let raw = serde_json::to_string(&map)?;
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE videos SET status = 'published', manifest_url = ?2, variants = ?3,
                               duration = ?4, updated_at = ?5
             WHERE id = ?1",
            params![id, manifest_url, &raw, duration, Utc::now().naive_utc()],
        )?;
        if affected == 0 {
            return Err(VideoStoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Marks the video failed. Partially produced artifacts are left on
    /// disk for manual or periodic cleanup.
    pub fn persist_failure(&self, id: &str) -> VideoStoreResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE videos SET status = 'failed', updated_at = ?2 WHERE id = ?1",
            params![id, Utc::now().naive_utc()],
        )?;
        if affected == 0 {
            return Err(VideoStoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> VideoStoreResult<VideoRecord> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM videos WHERE id = ?1")?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(VideoRecord::from_row(row)?),
            None => Err(VideoStoreError::NotFound(id.to_string())),
        }
    }
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    Ok(value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc)))
}
