//! Job record store with persistent JSON storage.
//!
//! The store is the single source of truth for job state. Every mutation is
//! published on a broadcast channel so that observers (UI lists, progress
//! bars) can follow along without polling.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use anyhow::Context;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::job::{Job, JobId, JobStatus};

/// Message stored on jobs that were active when the process last stopped.
pub const INTERRUPTED_MESSAGE: &str = "Transcription was interrupted before it could finish";

/// A change to the job list.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Created(Job),
    Updated(Job),
    Deleted(JobId),
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Created(job) | JobEvent::Updated(job) => job.id,
            JobEvent::Deleted(id) => *id,
        }
    }
}

/// Observable, optionally persistent collection of jobs in creation order.
pub struct JobStore {
    jobs: RwLock<Vec<Job>>,
    records_path: Option<PathBuf>,
    /// Serializes snapshot writes so the newest snapshot always lands last.
    persist_lock: Mutex<()>,
    events: broadcast::Sender<JobEvent>,
}

impl JobStore {
    /// Creates a store that keeps records in memory only.
    pub fn in_memory(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            jobs: RwLock::new(Vec::new()),
            records_path: None,
            persist_lock: Mutex::new(()),
            events,
        }
    }

    /// Opens the records file, loading any jobs saved by a previous run.
    pub fn open(records_path: impl Into<PathBuf>, event_capacity: usize) -> Result<Self> {
        let records_path = records_path.into();
        let jobs = load_records(&records_path)?;
        tracing::info!(
            "Loaded {} job records from {}",
            jobs.len(),
            records_path.display()
        );

        let (events, _) = broadcast::channel(event_capacity.max(1));
        Ok(Self {
            jobs: RwLock::new(jobs),
            records_path: Some(records_path),
            persist_lock: Mutex::new(()),
            events,
        })
    }

    /// Creates a new subscriber for job events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Adds a job at the end of the list.
    pub fn create(&self, job: Job) -> Job {
        {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            jobs.push(job.clone());
            self.publish(JobEvent::Created(job.clone()));
        }
        tracing::debug!("Created job {} for {}", job.id, job.source_path.display());
        self.persist();
        job
    }

    pub fn get(&self, id: &JobId) -> Option<Job> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let job = jobs.iter().find(|j| j.id == *id).cloned();
        if job.is_none() {
            tracing::debug!("Job {} not found", id);
        }
        job
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<Job> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Pending jobs in creation order.
    pub fn list_pending(&self) -> Vec<Job> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect()
    }

    /// Oldest pending job, if any.
    pub fn next_pending(&self) -> Option<Job> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|j| j.status == JobStatus::Pending)
            .cloned()
    }

    /// Applies a state update and returns the resulting job.
    ///
    /// Unknown ids and finished jobs are left untouched (`None`): a cancelled
    /// computation may still deliver updates after its job was removed.
    /// While a job is active its progress never moves backwards.
    pub fn update_status_and_progress(
        &self,
        id: &JobId,
        text: &str,
        progress: f64,
        status: JobStatus,
    ) -> Option<Job> {
        let (updated, status_changed) = {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            let Some(job) = jobs.iter_mut().find(|j| j.id == *id) else {
                tracing::warn!("Ignoring update for unknown job {}", id);
                return None;
            };
            if job.status.is_terminal() {
                tracing::warn!("Ignoring update for finished job {} ({})", id, job.status);
                return None;
            }

            let mut progress = if progress.is_finite() {
                progress.clamp(0.0, 1.0)
            } else {
                job.progress
            };
            if job.status.is_active() {
                progress = progress.max(job.progress);
            }

            let status_changed = job.status != status;
            job.status = status;
            job.progress = progress;
            job.text = text.to_string();
            let updated = job.clone();
            // Published under the lock so events follow mutation order.
            self.publish(JobEvent::Updated(updated.clone()));
            (updated, status_changed)
        };

        if status_changed {
            tracing::debug!("Job {} is now {}", id, updated.status);
            self.persist();
        }
        Some(updated)
    }

    /// Removes a job. Returns the removed record.
    pub fn delete(&self, id: &JobId) -> Option<Job> {
        let removed = {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            let index = jobs.iter().position(|j| j.id == *id);
            let removed = index.map(|i| jobs.remove(i));
            if removed.is_some() {
                self.publish(JobEvent::Deleted(*id));
            }
            removed
        };
        match removed {
            Some(job) => {
                tracing::debug!("Deleted job {}", id);
                self.persist();
                Some(job)
            }
            None => {
                tracing::warn!("Cannot delete unknown job {}", id);
                None
            }
        }
    }

    /// Fails jobs that were converting or transcribing when the previous
    /// process stopped, removing any audio they committed before the stop.
    /// Returns how many were recovered.
    pub fn recover_interrupted(&self) -> usize {
        let interrupted: Vec<Job> = self
            .list()
            .into_iter()
            .filter(|j| j.status.is_active())
            .collect();
        for job in &interrupted {
            tracing::warn!("Job {} was interrupted by a restart", job.id);
            if job.output_path != job.source_path && job.output_path.exists() {
                if let Err(e) = fs::remove_file(&job.output_path) {
                    tracing::warn!("Failed to remove {}: {}", job.output_path.display(), e);
                }
            }
            self.update_status_and_progress(
                &job.id,
                INTERRUPTED_MESSAGE,
                job.progress,
                JobStatus::Failed,
            );
        }
        interrupted.len()
    }

    /// Removes pending jobs whose source file no longer exists.
    pub fn purge_missing_sources(&self) -> Vec<JobId> {
        let missing: Vec<JobId> = self
            .list_pending()
            .into_iter()
            .filter(|j| !j.source_path.exists())
            .map(|j| j.id)
            .collect();
        for id in &missing {
            tracing::info!("Removing pending job {} whose source is gone", id);
            self.delete(id);
        }
        missing
    }

    fn publish(&self, event: JobEvent) {
        // No active receivers is fine
        let _ = self.events.send(event);
    }

    fn persist(&self) {
        let Some(path) = &self.records_path else {
            return;
        };
        let _guard = self.persist_lock.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = self.list();
        if let Err(e) = save_records(path, &snapshot) {
            tracing::warn!("Failed to persist job records: {:#}", e);
        }
    }
}

fn load_records(path: &Path) -> anyhow::Result<Vec<Job>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut jobs: Vec<Job> =
        serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))?;
    // Stable: jobs created within the same instant keep their saved order.
    jobs.sort_by_key(|j| j.created_at);
    Ok(jobs)
}

fn save_records(path: &Path, jobs: &[Job]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(jobs).context("serializing job records")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
