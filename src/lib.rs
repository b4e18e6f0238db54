//! # Whisper Queue
//!
//! Sequential transcription queue with Swift FFI bindings.
//! Finished recordings and imported files become persistent jobs that are
//! converted to 16 kHz mono audio and transcribed one at a time, with
//! progress updates and cancellation at any stage.

pub mod audio;
pub mod cancel;
pub mod config;
pub mod error;
pub mod ffi;
pub mod job;
pub mod logging;
pub mod process;
pub mod queue;
pub mod store;
pub mod transcription;

pub use audio::{AudioBuffer, AudioConverter, FileConverter};
pub use cancel::{CancelSignal, CancellationRegistry};
pub use config::{EngineConfig, QueueConfig, SettingsProvider, SharedSettings, TranscriptionParams};
pub use error::{QueueError, Result};
pub use job::{Job, JobId, JobStatus};
pub use queue::{ProcessingState, TranscriptionQueue};
pub use store::{JobEvent, JobStore};
pub use transcription::{InferenceEngine, Segment, NO_SPEECH_SENTINEL};
