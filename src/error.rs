//! Error types for the transcription queue.

use thiserror::Error;

/// Result type alias for QueueError.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can end a job's processing attempt.
///
/// Every variant except [`QueueError::Cancelled`] is recorded on the job as a
/// `failed` status carrying the rendered message. `Cancelled` drops the job.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The input file disappeared before processing started.
    #[error("Source file not found: {0}")]
    SourceMissing(String),

    /// The input could not be read or decoded.
    #[error("Could not decode audio: {0}")]
    DecodeError(String),

    /// The inference engine could not be initialized (e.g. no model).
    #[error("Transcription engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Any other failure inside inference or finalization.
    #[error("Transcription failed: {0}")]
    ProcessingFailed(String),

    /// The user asked for the job to stop.
    #[error("Cancelled")]
    Cancelled,

    /// File I/O error.
    #[error("File I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Job records could not be read or written.
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl QueueError {
    /// Returns true for user-initiated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueueError::Cancelled)
    }

    /// Returns an error code for FFI communication.
    pub fn error_code(&self) -> i32 {
        match self {
            QueueError::SourceMissing(_) => -1,
            QueueError::DecodeError(_) => -2,
            QueueError::EngineUnavailable(_) => -3,
            QueueError::ProcessingFailed(_) => -4,
            QueueError::Cancelled => -5,
            QueueError::IoError(_) => -6,
            QueueError::Persistence(_) => -7,
        }
    }
}

impl From<anyhow::Error> for QueueError {
    fn from(err: anyhow::Error) -> Self {
        QueueError::Persistence(format!("{:#}", err))
    }
}
