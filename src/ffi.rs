//! FFI (Foreign Function Interface) bindings for Swift interoperability.
//!
//! The host creates one queue handle at startup with `whisper_queue_create`
//! and releases it with `whisper_queue_destroy` at shutdown. Strings returned
//! by this module must be released with `whisper_queue_free_string`.

use crate::audio::FileConverter;
use crate::config::{EngineConfig, ModelSize, QueueConfig, SharedSettings};
use crate::job::JobId;
use crate::queue::TranscriptionQueue;
use crate::store::JobStore;
use crate::transcription::load_engine;
use libc::c_char;
use std::ffi::{CStr, CString};
use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;

/// Result codes for FFI functions.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhisperResultCode {
    /// Operation succeeded.
    Success = 0,
    /// Generic error.
    Error = -1,
    /// Invalid parameter.
    InvalidParameter = -2,
    /// No job with that id, or nothing to cancel.
    NotFound = -3,
}

/// C-compatible queue configuration.
#[repr(C)]
pub struct CQueueConfig {
    /// Directory for job records and committed audio; null for the platform default.
    pub data_dir: *const c_char,
    /// Path to the model file; null for the default location of `model_size`.
    pub model_path: *const c_char,
    /// Model size enum value.
    pub model_size: i32,
    /// Enable GPU acceleration.
    pub use_gpu: bool,
}

/// Opaque queue handle owned by the host.
pub struct QueueHandle {
    runtime: tokio::runtime::Runtime,
    queue: TranscriptionQueue,
    settings: Arc<SharedSettings>,
}

impl QueueHandle {
    fn create(data_dir: Option<PathBuf>, engine_config: EngineConfig) -> crate::Result<Self> {
        let config = match data_dir {
            Some(dir) => QueueConfig::in_dir(dir),
            None => QueueConfig::default_location()?,
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("whisper-queue")
            .enable_all()
            .build()?;

        let store = Arc::new(JobStore::open(config.records_path.clone(), config.event_capacity)?);
        let engine = load_engine(&engine_config);
        let settings = Arc::new(SharedSettings::default());
        let converter = Arc::new(FileConverter::new(std::env::temp_dir().join("whisper-queue")));

        let queue = {
            let _guard = runtime.enter();
            TranscriptionQueue::start(&config, store, converter, engine, settings.clone())
        };
        Ok(Self {
            runtime,
            queue,
            settings,
        })
    }
}

// ============================================================================
// FFI Functions
// ============================================================================

/// Creates the queue and starts processing persisted pending jobs.
///
/// Returns null on failure.
///
/// # Safety
/// `config` must be null or point to a valid `CQueueConfig` whose strings are
/// null or valid null-terminated UTF-8.
#[no_mangle]
pub unsafe extern "C" fn whisper_queue_create(config: *const CQueueConfig) -> *mut QueueHandle {
    let (data_dir, engine_config) = if config.is_null() {
        (None, EngineConfig::default())
    } else {
        let c_config = &*config;
        let data_dir = match opt_str(c_config.data_dir) {
            Ok(dir) => dir.map(PathBuf::from),
            Err(()) => return ptr::null_mut(),
        };
        let model_path = match opt_str(c_config.model_path) {
            Ok(path) => path.unwrap_or_default(),
            Err(()) => return ptr::null_mut(),
        };
        let engine_config = EngineConfig {
            model_path,
            model_size: ModelSize::from_index(c_config.model_size),
            use_gpu: c_config.use_gpu,
            ..Default::default()
        };
        (data_dir, engine_config)
    };

    match QueueHandle::create(data_dir, engine_config) {
        Ok(handle) => Box::into_raw(Box::new(handle)),
        Err(e) => {
            tracing::error!(
                "Failed to create transcription queue (code {}): {}",
                e.error_code(),
                e
            );
            ptr::null_mut()
        }
    }
}

/// Stops the queue, interrupting the active job, and frees the handle.
///
/// # Safety
/// `handle` must be null or a pointer returned by `whisper_queue_create`
/// that has not been destroyed yet.
#[no_mangle]
pub unsafe extern "C" fn whisper_queue_destroy(handle: *mut QueueHandle) {
    if handle.is_null() {
        return;
    }
    let handle = Box::from_raw(handle);
    handle.runtime.block_on(handle.queue.shutdown());
}

/// Enqueues a finished recording. Returns the new job id.
///
/// # Safety
/// `handle` must be valid; `path` must be a valid null-terminated UTF-8 string.
#[no_mangle]
pub unsafe extern "C" fn whisper_queue_enqueue(
    handle: *mut QueueHandle,
    path: *const c_char,
    duration_seconds: f64,
) -> *mut c_char {
    let (Some(handle), Ok(Some(path))) = (handle.as_ref(), opt_str(path)) else {
        return ptr::null_mut();
    };
    let job = handle.queue.enqueue(path, duration_seconds);
    string_to_c_char(&job.id.to_string())
}

/// Enqueues an imported file, probing its duration first. Returns the new job id.
///
/// # Safety
/// `handle` must be valid; `path` must be a valid null-terminated UTF-8 string.
#[no_mangle]
pub unsafe extern "C" fn whisper_queue_import(
    handle: *mut QueueHandle,
    path: *const c_char,
) -> *mut c_char {
    let (Some(handle), Ok(Some(path))) = (handle.as_ref(), opt_str(path)) else {
        return ptr::null_mut();
    };
    let job = handle.runtime.block_on(handle.queue.import(path));
    string_to_c_char(&job.id.to_string())
}

/// Requests cancellation of a job.
///
/// # Safety
/// `handle` must be valid; `job_id` must be a valid null-terminated UTF-8 string.
#[no_mangle]
pub unsafe extern "C" fn whisper_queue_cancel(
    handle: *mut QueueHandle,
    job_id: *const c_char,
) -> WhisperResultCode {
    let (handle, id) = match (handle.as_ref(), parse_job_id(job_id)) {
        (Some(handle), Some(id)) => (handle, id),
        _ => return WhisperResultCode::InvalidParameter,
    };
    if handle.queue.request_cancel(&id) {
        WhisperResultCode::Success
    } else {
        WhisperResultCode::NotFound
    }
}

/// Deletes a job record and its stored audio.
///
/// # Safety
/// `handle` must be valid; `job_id` must be a valid null-terminated UTF-8 string.
#[no_mangle]
pub unsafe extern "C" fn whisper_queue_delete(
    handle: *mut QueueHandle,
    job_id: *const c_char,
) -> WhisperResultCode {
    let (handle, id) = match (handle.as_ref(), parse_job_id(job_id)) {
        (Some(handle), Some(id)) => (handle, id),
        _ => return WhisperResultCode::InvalidParameter,
    };
    match handle.queue.delete_job(&id) {
        Some(_) => WhisperResultCode::Success,
        None => WhisperResultCode::NotFound,
    }
}

/// Returns whether a job is being processed.
///
/// # Safety
/// `handle` must be null or valid.
#[no_mangle]
pub unsafe extern "C" fn whisper_queue_is_processing(handle: *const QueueHandle) -> bool {
    handle
        .as_ref()
        .map(|h| h.queue.is_processing())
        .unwrap_or(false)
}

/// Returns the id of the active job, or null when none is active.
///
/// # Safety
/// `handle` must be null or valid.
#[no_mangle]
pub unsafe extern "C" fn whisper_queue_current_job(handle: *const QueueHandle) -> *mut c_char {
    match handle.as_ref().and_then(|h| h.queue.current_job_id()) {
        Some(id) => string_to_c_char(&id.to_string()),
        None => ptr::null_mut(),
    }
}

/// Returns all jobs, oldest first, as a JSON array.
///
/// # Safety
/// `handle` must be null or valid.
#[no_mangle]
pub unsafe extern "C" fn whisper_queue_jobs_json(handle: *const QueueHandle) -> *mut c_char {
    let Some(handle) = handle.as_ref() else {
        return ptr::null_mut();
    };
    match serde_json::to_string(&handle.queue.jobs()) {
        Ok(json) => string_to_c_char(&json),
        Err(e) => {
            tracing::error!("Failed to serialize jobs: {}", e);
            ptr::null_mut()
        }
    }
}

/// Replaces the transcription settings used from the next job on.
///
/// # Safety
/// `handle` must be valid; `json` must be a valid null-terminated UTF-8 string.
#[no_mangle]
pub unsafe extern "C" fn whisper_queue_set_settings_json(
    handle: *mut QueueHandle,
    json: *const c_char,
) -> WhisperResultCode {
    let (Some(handle), Ok(Some(json))) = (handle.as_ref(), opt_str(json)) else {
        return WhisperResultCode::InvalidParameter;
    };
    match handle.settings.replace_from_json(&json) {
        Ok(()) => WhisperResultCode::Success,
        Err(e) => {
            tracing::warn!("Rejected settings: {}", e);
            WhisperResultCode::InvalidParameter
        }
    }
}

/// Frees a string returned by this library.
///
/// # Safety
/// `s` must be null or a pointer returned by a `whisper_queue_*` function.
#[no_mangle]
pub unsafe extern "C" fn whisper_queue_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

/// Installs the stderr log subscriber.
#[no_mangle]
pub extern "C" fn whisper_queue_init_logging() {
    crate::logging::init();
}

/// Returns the library version.
#[no_mangle]
pub extern "C" fn whisper_queue_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Reads an optional C string; `Err` on invalid UTF-8.
unsafe fn opt_str(s: *const c_char) -> Result<Option<String>, ()> {
    if s.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(s)
        .to_str()
        .map(|s| Some(s.to_string()))
        .map_err(|_| ())
}

unsafe fn parse_job_id(s: *const c_char) -> Option<JobId> {
    opt_str(s).ok().flatten().and_then(|s| JobId::parse(&s))
}

/// Converts a Rust string to a C string pointer.
fn string_to_c_char(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    unsafe fn take_string(s: *mut c_char) -> String {
        assert!(!s.is_null());
        let owned = CStr::from_ptr(s).to_str().unwrap().to_string();
        whisper_queue_free_string(s);
        owned
    }

    #[test]
    fn test_null_arguments_are_rejected() {
        unsafe {
            assert!(whisper_queue_enqueue(ptr::null_mut(), ptr::null(), 1.0).is_null());
            assert_eq!(
                whisper_queue_cancel(ptr::null_mut(), ptr::null()),
                WhisperResultCode::InvalidParameter
            );
            assert!(!whisper_queue_is_processing(ptr::null()));
            assert!(whisper_queue_current_job(ptr::null()).is_null());
            whisper_queue_destroy(ptr::null_mut());
            whisper_queue_free_string(ptr::null_mut());
        }
    }

    #[test]
    fn test_version_is_nul_terminated() {
        let version = unsafe { CStr::from_ptr(whisper_queue_version()) };
        assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_handle_lifecycle() {
        let dir = TempDir::new().unwrap();
        let data_dir = CString::new(dir.path().to_str().unwrap()).unwrap();
        let model = CString::new("/nonexistent/ggml-base.bin").unwrap();
        let config = CQueueConfig {
            data_dir: data_dir.as_ptr(),
            model_path: model.as_ptr(),
            model_size: 1,
            use_gpu: false,
        };

        unsafe {
            let handle = whisper_queue_create(&config);
            assert!(!handle.is_null());

            let settings = CString::new(r#"{"language":"en"}"#).unwrap();
            assert_eq!(
                whisper_queue_set_settings_json(handle, settings.as_ptr()),
                WhisperResultCode::Success
            );
            let bad = CString::new("[1,2]").unwrap();
            assert_eq!(
                whisper_queue_set_settings_json(handle, bad.as_ptr()),
                WhisperResultCode::InvalidParameter
            );

            let source = CString::new(dir.path().join("missing.wav").to_str().unwrap()).unwrap();
            let id = take_string(whisper_queue_enqueue(handle, source.as_ptr(), 2.0));
            assert!(JobId::parse(&id).is_some());

            let deadline = Instant::now() + Duration::from_secs(10);
            let jobs = loop {
                let json = take_string(whisper_queue_jobs_json(handle));
                let jobs: serde_json::Value = serde_json::from_str(&json).unwrap();
                if jobs[0]["status"] == "failed" || Instant::now() > deadline {
                    break jobs;
                }
                std::thread::sleep(Duration::from_millis(10));
            };
            assert_eq!(jobs[0]["id"], id.as_str());
            assert_eq!(jobs[0]["status"], "failed");

            let c_id = CString::new(id).unwrap();
            assert_eq!(whisper_queue_cancel(handle, c_id.as_ptr()), WhisperResultCode::NotFound);
            assert_eq!(whisper_queue_delete(handle, c_id.as_ptr()), WhisperResultCode::Success);
            assert_eq!(whisper_queue_delete(handle, c_id.as_ptr()), WhisperResultCode::NotFound);

            whisper_queue_destroy(handle);
        }
        assert!(dir.path().join("jobs.json").exists());
    }
}
