//! Job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Opaque job identifier, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses the textual form produced by `Display`.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Processing status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Converting,
    Transcribing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Converting or transcribing.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Converting | JobStatus::Transcribing)
    }

    /// Completed or failed; no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "Pending"),
            JobStatus::Converting => write!(f, "Converting"),
            JobStatus::Transcribing => write!(f, "Transcribing"),
            JobStatus::Completed => write!(f, "Completed"),
            JobStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// One unit of audio-to-text work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub created_at: DateTime<Utc>,
    /// Input audio; may be a temporary recording or an imported file.
    pub source_path: PathBuf,
    /// Where the audio is committed on success.
    pub output_path: PathBuf,
    pub status: JobStatus,
    /// In [0.0, 1.0].
    pub progress: f64,
    /// Partial text while transcribing, the transcript once completed, the
    /// diagnostic once failed.
    pub text: String,
    /// Best-effort audio length, 0 when unknown.
    pub duration_seconds: f64,
}

impl Job {
    /// Creates a pending job whose output lands in `storage_dir`.
    pub fn new(source_path: impl Into<PathBuf>, duration_seconds: f64, storage_dir: &Path) -> Self {
        let source_path = source_path.into();
        let id = JobId::new();
        let created_at = Utc::now();
        let output_path = output_path_for(storage_dir, &id, created_at, &source_path);
        Self {
            id,
            created_at,
            source_path,
            output_path,
            status: JobStatus::Pending,
            progress: 0.0,
            text: String::new(),
            duration_seconds: if duration_seconds.is_finite() && duration_seconds > 0.0 {
                duration_seconds
            } else {
                0.0
            },
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Deterministic artifact location: `<dir>/<yyyymmdd-hhmmss>-<id>.<ext>`.
pub fn output_path_for(
    storage_dir: &Path,
    id: &JobId,
    created_at: DateTime<Utc>,
    source_path: &Path,
) -> PathBuf {
    let extension = source_path
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .unwrap_or("wav")
        .to_ascii_lowercase();
    storage_dir.join(format!(
        "{}-{}.{}",
        created_at.format("%Y%m%d-%H%M%S"),
        id,
        extension
    ))
}
