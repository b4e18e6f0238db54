//! Configuration types for the queue, the engine and per-job transcription.

use crate::error::{QueueError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Directory name used under the platform data directory.
pub const APP_DIR_NAME: &str = "WhisperQueue";

/// Whisper model size variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(C)]
pub enum ModelSize {
    /// Tiny model (~75MB) - Fastest, least accurate
    Tiny,
    /// Base model (~142MB) - Fast, good for simple tasks
    #[default]
    Base,
    /// Small model (~466MB) - Balanced speed/accuracy
    Small,
    /// Medium model (~1.5GB) - Good accuracy
    Medium,
    /// Large-v3 model - Most accurate
    LargeV3,
    /// Large-v3-turbo - Optimized for speed
    LargeV3Turbo,
}

impl ModelSize {
    /// Returns the model filename.
    pub fn filename(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "ggml-tiny.bin",
            ModelSize::Base => "ggml-base.bin",
            ModelSize::Small => "ggml-small.bin",
            ModelSize::Medium => "ggml-medium.bin",
            ModelSize::LargeV3 => "ggml-large-v3.bin",
            ModelSize::LargeV3Turbo => "ggml-large-v3-turbo.bin",
        }
    }

    /// Maps the integer used across the C boundary.
    pub fn from_index(index: i32) -> Self {
        match index {
            0 => ModelSize::Tiny,
            2 => ModelSize::Small,
            3 => ModelSize::Medium,
            4 => ModelSize::LargeV3,
            5 => ModelSize::LargeV3Turbo,
            _ => ModelSize::Base,
        }
    }
}

/// Decoding strategy for the inference engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum SamplingStrategy {
    #[default]
    Greedy,
    BeamSearch,
}

/// Language configuration for transcription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LanguageConfig {
    /// Source language code (e.g., "en", "fr", "auto").
    #[serde(rename = "language")]
    pub source: String,
    /// Whether to translate to English.
    pub translate_to_english: bool,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            source: "auto".to_string(),
            translate_to_english: false,
        }
    }
}

impl LanguageConfig {
    /// Returns the language code, or `None` for auto-detection.
    pub fn code(&self) -> Option<&str> {
        let source = self.source.trim();
        if source.is_empty() || source.eq_ignore_ascii_case("auto") {
            None
        } else {
            Some(source)
        }
    }
}

/// Per-job inference options, read fresh from the settings provider each time
/// a job reaches the transcription stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TranscriptionParams {
    pub thread_count: u32,
    pub strategy: SamplingStrategy,
    /// Only meaningful for beam search.
    pub beam_size: u32,
    #[serde(flatten)]
    pub language: LanguageConfig,
    pub temperature: f32,
    pub initial_prompt: String,
    pub suppress_blank_audio: bool,
    pub single_segment: bool,
    pub emit_timestamps: bool,
}

impl Default for TranscriptionParams {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4)
            .min(8);
        Self {
            thread_count: threads,
            strategy: SamplingStrategy::Greedy,
            beam_size: 5,
            language: LanguageConfig::default(),
            temperature: 0.0,
            initial_prompt: String::new(),
            suppress_blank_audio: true,
            single_segment: false,
            emit_timestamps: false,
        }
    }
}

impl TranscriptionParams {
    /// Rejects option combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 {
            return Err(QueueError::ProcessingFailed(
                "thread count must be greater than zero".to_string(),
            ));
        }
        if self.strategy == SamplingStrategy::BeamSearch && self.beam_size == 0 {
            return Err(QueueError::ProcessingFailed(
                "beam search requires a beam size greater than zero".to_string(),
            ));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(QueueError::ProcessingFailed(format!(
                "invalid temperature {}",
                self.temperature
            )));
        }
        Ok(())
    }

    /// Sets the source language.
    pub fn language(mut self, lang: impl Into<String>) -> Self {
        self.language.source = lang.into();
        self
    }

    /// Enables translation to English.
    pub fn translate(mut self) -> Self {
        self.language.translate_to_english = true;
        self
    }

    /// Sets the number of threads.
    pub fn threads(mut self, n: u32) -> Self {
        self.thread_count = n;
        self
    }

    /// Switches to beam search with the given width.
    pub fn beam_search(mut self, beam_size: u32) -> Self {
        self.strategy = SamplingStrategy::BeamSearch;
        self.beam_size = beam_size;
        self
    }

    /// Annotates the final text with segment timestamps.
    pub fn with_timestamps(mut self) -> Self {
        self.emit_timestamps = true;
        self
    }
}

/// Source of the transcription settings.
pub trait SettingsProvider: Send + Sync {
    fn transcription_params(&self) -> TranscriptionParams;
}

impl SettingsProvider for TranscriptionParams {
    fn transcription_params(&self) -> TranscriptionParams {
        self.clone()
    }
}

/// Settings that the host can replace while the queue is running.
#[derive(Debug, Default)]
pub struct SharedSettings {
    params: RwLock<TranscriptionParams>,
}

impl SharedSettings {
    pub fn new(params: TranscriptionParams) -> Self {
        Self {
            params: RwLock::new(params),
        }
    }

    /// Replaces the settings; takes effect for the next job that starts
    /// transcribing.
    pub fn replace(&self, params: TranscriptionParams) {
        let mut guard = self.params.write().unwrap_or_else(|e| e.into_inner());
        *guard = params;
    }

    /// Replaces the settings from a JSON document. Missing fields take their
    /// default values.
    pub fn replace_from_json(&self, json: &str) -> Result<()> {
        let params: TranscriptionParams = serde_json::from_str(json)
            .map_err(|e| QueueError::Persistence(format!("invalid settings: {}", e)))?;
        self.replace(params);
        Ok(())
    }
}

impl SettingsProvider for SharedSettings {
    fn transcription_params(&self) -> TranscriptionParams {
        self.params
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Engine bootstrap configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the model file; empty means the default location for `model_size`.
    pub model_path: String,
    pub model_size: ModelSize,
    /// Enable GPU acceleration (Metal on macOS).
    pub use_gpu: bool,
    pub flash_attention: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            model_size: ModelSize::Base,
            use_gpu: true,
            flash_attention: false,
        }
    }
}

impl EngineConfig {
    /// Creates a new config with the specified model path.
    pub fn with_model_path(model_path: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Default::default()
        }
    }

    /// Returns the model file to load.
    pub fn resolve_model_path(&self) -> Result<PathBuf> {
        if !self.model_path.is_empty() {
            return Ok(PathBuf::from(&self.model_path));
        }
        let data_dir = dirs::data_dir().ok_or_else(|| {
            QueueError::EngineUnavailable("no platform data directory".to_string())
        })?;
        Ok(data_dir
            .join(APP_DIR_NAME)
            .join("Models")
            .join(self.model_size.filename()))
    }
}

/// Where the queue keeps its durable state.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Directory receiving committed audio artifacts.
    pub storage_dir: PathBuf,
    /// JSON file holding the job records.
    pub records_path: PathBuf,
    /// Buffer size of the job event channel.
    pub event_capacity: usize,
}

impl QueueConfig {
    /// Lays the queue state out under `root`.
    pub fn in_dir(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            storage_dir: root.join("Recordings"),
            records_path: root.join("jobs.json"),
            event_capacity: 256,
        }
    }

    /// The platform data directory, e.g. `~/Library/Application Support/WhisperQueue`.
    pub fn default_location() -> Result<Self> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| QueueError::Persistence("no platform data directory".to_string()))?;
        Ok(Self::in_dir(data_dir.join(APP_DIR_NAME)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_json_uses_flat_camel_case() {
        let params = TranscriptionParams::default().language("fr").translate();
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["language"], "fr");
        assert_eq!(json["translateToEnglish"], true);
        assert_eq!(json["strategy"], "greedy");
        assert!(json.get("threadCount").is_some());
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let settings = SharedSettings::default();
        settings
            .replace_from_json(r#"{"strategy":"beamSearch","beamSize":3,"emitTimestamps":true}"#)
            .unwrap();
        let params = settings.transcription_params();
        assert_eq!(params.strategy, SamplingStrategy::BeamSearch);
        assert_eq!(params.beam_size, 3);
        assert!(params.emit_timestamps);
        assert_eq!(params.language.code(), None);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_options() {
        assert!(TranscriptionParams::default().threads(0).validate().is_err());
        assert!(TranscriptionParams::default().beam_search(0).validate().is_err());
        let mut params = TranscriptionParams::default();
        params.temperature = f32::NAN;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_explicit_model_path_wins() {
        let config = EngineConfig::with_model_path("/models/ggml-small.bin");
        assert_eq!(
            config.resolve_model_path().unwrap(),
            PathBuf::from("/models/ggml-small.bin")
        );
        assert_eq!(ModelSize::from_index(5), ModelSize::LargeV3Turbo);
        assert_eq!(ModelSize::from_index(42), ModelSize::Base);
    }

    #[test]
    fn test_queue_layout() {
        let config = QueueConfig::in_dir("/data/app");
        assert_eq!(config.storage_dir, PathBuf::from("/data/app/Recordings"));
        assert_eq!(config.records_path, PathBuf::from("/data/app/jobs.json"));
    }
}
