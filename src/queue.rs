//! Sequential transcription queue.
//!
//! One orchestration task processes jobs strictly in creation order:
//! `pending -> converting -> transcribing -> completed | failed`. Conversion
//! and inference run on the blocking pool; they never touch the store
//! directly but post progress through a channel that the orchestration task
//! drains and applies. Cancelled jobs are dropped from the store without a
//! terminal record.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::audio::{AudioBuffer, AudioConverter};
use crate::cancel::{CancelOutcome, CancelSignal, CancellationRegistry};
use crate::config::{QueueConfig, SettingsProvider};
use crate::error::{QueueError, Result};
use crate::job::{Job, JobId, JobStatus};
use crate::store::{JobEvent, JobStore};
use crate::transcription::{self, InferenceEngine, PartialTranscript};

/// Share of overall progress given to audio conversion.
pub const CONVERSION_SHARE: f64 = 0.1;

/// Highest progress reported before a job is actually completed.
pub const MAX_IN_FLIGHT_PROGRESS: f64 = 0.99;

/// Busy indicator for observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingState {
    pub is_processing: bool,
    pub current_job_id: Option<JobId>,
}

/// Overall progress for a conversion `fraction`; stays below
/// [`CONVERSION_SHARE`] until the job moves on to transcription.
pub fn conversion_progress(fraction: f64) -> f64 {
    if !fraction.is_finite() {
        return 0.0;
    }
    fraction.clamp(0.0, 1.0) * CONVERSION_SHARE * MAX_IN_FLIGHT_PROGRESS
}

/// Overall progress for a partial transcript ending at `timestamp` seconds.
pub fn transcription_progress(timestamp: f64, duration: f64) -> f64 {
    if !(duration > 0.0) || !timestamp.is_finite() {
        return CONVERSION_SHARE;
    }
    let fraction = (timestamp / duration).clamp(0.0, 1.0);
    (CONVERSION_SHARE + (1.0 - CONVERSION_SHARE) * fraction).min(MAX_IN_FLIGHT_PROGRESS)
}

struct Inner {
    store: Arc<JobStore>,
    registry: CancellationRegistry,
    converter: Arc<dyn AudioConverter>,
    engine: Arc<dyn InferenceEngine>,
    settings: Arc<dyn SettingsProvider>,
    storage_dir: PathBuf,
    wake: Notify,
    shutdown: AtomicBool,
    state: watch::Sender<ProcessingState>,
}

/// Handle to the running queue. Dropping it stops the worker after the
/// active job unwinds.
pub struct TranscriptionQueue {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TranscriptionQueue {
    /// Starts the orchestration task on the current tokio runtime.
    ///
    /// Jobs left active by a previous process are failed, and pending jobs
    /// whose source file is gone are removed, before the first job is picked.
    pub fn start(
        config: &QueueConfig,
        store: Arc<JobStore>,
        converter: Arc<dyn AudioConverter>,
        engine: Arc<dyn InferenceEngine>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Self {
        let (state, _) = watch::channel(ProcessingState::default());
        let inner = Arc::new(Inner {
            store,
            registry: CancellationRegistry::new(),
            converter,
            engine,
            settings,
            storage_dir: config.storage_dir.clone(),
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
            state,
        });

        let recovered = inner.store.recover_interrupted();
        let purged = inner.store.purge_missing_sources();
        tracing::info!(
            "Transcription queue starting ({} interrupted, {} purged, {} pending)",
            recovered,
            purged.len(),
            inner.store.list_pending().len()
        );

        let worker = tokio::spawn(run_loop(Arc::clone(&inner)));
        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Adds a pending job for a finished recording or an imported file.
    pub fn enqueue(&self, source_path: impl Into<PathBuf>, duration_seconds: f64) -> Job {
        let job = Job::new(source_path, duration_seconds, &self.inner.storage_dir);
        let job = self.inner.store.create(job);
        tracing::info!(
            "Enqueued job {} ({:.1}s) from {}",
            job.id,
            job.duration_seconds,
            job.source_path.display()
        );
        self.inner.wake.notify_one();
        job
    }

    /// Probes the file's duration and enqueues it.
    pub async fn import(&self, source_path: impl Into<PathBuf>) -> Job {
        let source_path = source_path.into();
        let probe_path = source_path.clone();
        let duration = tokio::task::spawn_blocking(move || {
            crate::audio::probe_duration_seconds(&probe_path)
        })
        .await
        .ok()
        .flatten()
        .unwrap_or(0.0);
        self.enqueue(source_path, duration)
    }

    /// Stops a job. A job that has not started is removed right away; the
    /// active job is interrupted at its next poll point and then removed.
    /// Returns false when there was nothing to cancel.
    pub fn request_cancel(&self, id: &JobId) -> bool {
        match self.inner.registry.request_cancel(id) {
            CancelOutcome::Active => true,
            CancelOutcome::NotStarted => {
                let cancelled = match self.inner.store.get(id) {
                    Some(job) if job.status == JobStatus::Pending => {
                        self.inner.store.delete(id);
                        tracing::info!("Removed pending job {} on request", id);
                        true
                    }
                    _ => false,
                };
                self.inner.registry.clear(id);
                cancelled
            }
        }
    }

    /// Deletes a job record and its committed audio, cancelling it first if
    /// it is being processed.
    pub fn delete_job(&self, id: &JobId) -> Option<Job> {
        if self.inner.registry.active_job() == Some(*id) {
            self.inner.registry.request_cancel(id);
        }
        let removed = self.inner.store.delete(id)?;
        if removed.output_path.exists() {
            if let Err(e) = std::fs::remove_file(&removed.output_path) {
                tracing::warn!(
                    "Failed to remove {}: {}",
                    removed.output_path.display(),
                    e
                );
            }
        }
        Some(removed)
    }

    pub fn is_processing(&self) -> bool {
        self.inner.state.borrow().is_processing
    }

    pub fn current_job_id(&self) -> Option<JobId> {
        self.inner.state.borrow().current_job_id
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProcessingState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.store.subscribe()
    }

    /// All jobs, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        self.inner.store.list()
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    /// Cancels the active job and waits for the worker to stop.
    pub async fn shutdown(&self) {
        self.inner.stop();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!("Queue worker ended abnormally: {}", e);
            }
        }
        tracing::info!("Transcription queue shut down");
    }
}

impl Drop for TranscriptionQueue {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

async fn run_loop(inner: Arc<Inner>) {
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        match inner.store.next_pending() {
            Some(job) => {
                inner.set_state(true, None);
                inner.process(job).await;
            }
            None => {
                inner.set_state(false, None);
                tracing::debug!("Queue idle");
                inner.wake.notified().await;
            }
        }
    }
    inner.set_state(false, None);
    tracing::debug!("Queue worker stopped");
}

impl Inner {
    fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(id) = self.registry.cancel_active() {
            tracing::info!("Cancelling job {} for shutdown", id);
        }
        self.wake.notify_one();
    }

    fn set_state(&self, is_processing: bool, current_job_id: Option<JobId>) {
        let next = ProcessingState {
            is_processing,
            current_job_id,
        };
        self.state.send_if_modified(|state| {
            let changed = *state != next;
            *state = next;
            changed
        });
    }

    /// Runs one job to a terminal state, or drops it when cancelled.
    async fn process(&self, job: Job) {
        let id = job.id;
        let signal = match self.registry.begin_attempt(&id) {
            Ok(signal) => signal,
            Err(_) => {
                self.drop_cancelled(&job);
                self.registry.end_attempt(&id);
                return;
            }
        };
        self.set_state(true, Some(id));
        tracing::info!("Processing job {}", id);

        match self.run_attempt(&job, &signal).await {
            Ok(text) => self.complete(&job, &text),
            Err(QueueError::Cancelled) => self.drop_cancelled(&job),
            Err(e) => self.fail(&job, &e),
        }

        self.registry.end_attempt(&id);
        self.set_state(true, None);
    }

    async fn run_attempt(&self, job: &Job, signal: &CancelSignal) -> Result<String> {
        let id = job.id;
        if !job.source_path.exists() {
            return Err(QueueError::SourceMissing(job.source_path.display().to_string()));
        }

        self.store
            .update_status_and_progress(&id, "", 0.0, JobStatus::Converting)
            .ok_or(QueueError::Cancelled)?;
        let audio = self.convert(job, signal).await?;
        self.checkpoint(&id, signal)?;

        self.store
            .update_status_and_progress(&id, "", CONVERSION_SHARE, JobStatus::Transcribing)
            .ok_or(QueueError::Cancelled)?;
        let text = self.infer(job, audio, signal).await?;
        self.checkpoint(&id, signal)?;

        self.commit_output(job).await?;
        Ok(text)
    }

    fn checkpoint(&self, id: &JobId, signal: &CancelSignal) -> Result<()> {
        signal.check()?;
        if self.registry.is_cancelled(id) {
            return Err(QueueError::Cancelled);
        }
        Ok(())
    }

    /// Applies a progress update unless the job was cancelled meanwhile.
    fn apply_progress(&self, id: &JobId, text: &str, progress: f64, status: JobStatus) {
        if self.registry.is_cancelled(id) {
            return;
        }
        self.store.update_status_and_progress(id, text, progress, status);
    }

    async fn convert(&self, job: &Job, signal: &CancelSignal) -> Result<AudioBuffer> {
        let (tx, mut rx) = mpsc::unbounded_channel::<f64>();
        let converter = Arc::clone(&self.converter);
        let source = job.source_path.clone();
        let worker_signal = signal.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            converter.convert(&source, &worker_signal, &mut |fraction| {
                let _ = tx.send(fraction);
            })
        });

        let joined = loop {
            tokio::select! {
                biased;
                Some(fraction) = rx.recv() => {
                    self.apply_progress(
                        &job.id,
                        "",
                        conversion_progress(fraction),
                        JobStatus::Converting,
                    );
                }
                joined = &mut task => break joined,
            }
        };
        joined.map_err(|e| QueueError::ProcessingFailed(format!("audio conversion aborted: {}", e)))?
    }

    async fn infer(&self, job: &Job, audio: AudioBuffer, signal: &CancelSignal) -> Result<String> {
        let duration = if job.duration_seconds > 0.0 {
            job.duration_seconds
        } else {
            audio.duration_seconds()
        };
        // Settings are read fresh for every job.
        let params = self.settings.transcription_params();
        tracing::debug!("Transcribing job {} with {:?}", job.id, params);

        let (tx, mut rx) = mpsc::unbounded_channel::<PartialTranscript>();
        let engine = Arc::clone(&self.engine);
        let worker_signal = signal.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            transcription::transcribe(
                engine.as_ref(),
                &audio,
                &params,
                move |partial| {
                    let _ = tx.send(partial);
                },
                &worker_signal,
            )
        });

        let joined = loop {
            tokio::select! {
                biased;
                Some(partial) = rx.recv() => {
                    let progress = transcription_progress(partial.latest_timestamp, duration);
                    self.apply_progress(&job.id, &partial.text, progress, JobStatus::Transcribing);
                }
                joined = &mut task => break joined,
            }
        };
        joined.map_err(|e| QueueError::ProcessingFailed(format!("inference aborted: {}", e)))?
    }

    /// Copies the source audio to the job's durable location.
    async fn commit_output(&self, job: &Job) -> Result<()> {
        if job.output_path == job.source_path {
            return Ok(());
        }
        if let Some(parent) = job.output_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                QueueError::ProcessingFailed(format!(
                    "could not create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        tokio::fs::copy(&job.source_path, &job.output_path)
            .await
            .map_err(|e| {
                QueueError::ProcessingFailed(format!(
                    "could not store audio at {}: {}",
                    job.output_path.display(),
                    e
                ))
            })?;
        Ok(())
    }

    fn complete(&self, job: &Job, text: &str) {
        if self.registry.is_cancelled(&job.id) {
            self.drop_cancelled(job);
            return;
        }
        match self
            .store
            .update_status_and_progress(&job.id, text, 1.0, JobStatus::Completed)
        {
            Some(_) => tracing::info!("Job {} completed", job.id),
            None => {
                // Deleted while finishing; keep "output exists iff completed".
                remove_output(job);
            }
        }
    }

    fn fail(&self, job: &Job, error: &QueueError) {
        tracing::error!("Job {} failed: {}", job.id, error);
        // A failed commit may have left a partial copy behind.
        remove_output(job);
        let progress = self
            .store
            .get(&job.id)
            .map(|j| j.progress)
            .unwrap_or(job.progress);
        self.store
            .update_status_and_progress(&job.id, &error.to_string(), progress, JobStatus::Failed);
    }

    fn drop_cancelled(&self, job: &Job) {
        tracing::info!("Dropping cancelled job {}", job.id);
        remove_output(job);
        if self.store.get(&job.id).is_some() {
            self.store.delete(&job.id);
        }
    }
}

fn remove_output(job: &Job) {
    if job.output_path.exists() && job.output_path != job.source_path {
        if let Err(e) = std::fs::remove_file(&job.output_path) {
            tracing::warn!("Failed to remove {}: {}", job.output_path.display(), e);
        }
    }
}
