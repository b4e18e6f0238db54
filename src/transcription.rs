//! Inference adapter around the native Whisper engine.
//!
//! The engine itself is a blocking call that cannot be preempted. It is
//! steered through two hooks: a segment callback that streams decoded text
//! out while the call is running, and an abort callback that polls the job's
//! [`CancelSignal`] and makes the engine unwind at its next poll point.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::audio::AudioBuffer;
use crate::cancel::CancelSignal;
use crate::config::{EngineConfig, TranscriptionParams};
use crate::error::{QueueError, Result};

/// Text stored on completed jobs when nothing but silence or filler remained.
pub const NO_SPEECH_SENTINEL: &str = "[No speech detected]";

/// Whisper refuses inputs shorter than one second.
const MIN_AUDIO_SECONDS: f64 = 1.0;

/// Non-speech markers the engine emits in place of words.
const FILLER_MARKERS: &[&str] = &[
    "[BLANK_AUDIO]",
    "[ Silence ]",
    "[silence]",
    "[Silence]",
    "(silence)",
    "[MUSIC]",
    "[Music]",
    "(music)",
    "[NOISE]",
    "[INAUDIBLE]",
    "(inaudible)",
    "[no speech]",
];

/// A single transcription segment with timing information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Start time in milliseconds.
    pub start_ms: i64,
    /// End time in milliseconds.
    pub end_ms: i64,
    /// Transcribed text for this segment.
    pub text: String,
}

impl Segment {
    /// Creates a new segment.
    pub fn new(start_ms: i64, end_ms: i64, text: impl Into<String>) -> Self {
        Self {
            start_ms,
            end_ms,
            text: text.into(),
        }
    }

    /// Returns the duration in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

/// Cumulative text decoded so far.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialTranscript {
    pub text: String,
    /// End of the latest decoded segment, in seconds.
    pub latest_timestamp: f64,
}

/// Receives segments while the engine is still running. Invoked on the
/// engine's thread.
pub type SegmentSink = Box<dyn FnMut(Segment) + Send + 'static>;

/// Opaque speech-to-text capability.
pub trait InferenceEngine: Send + Sync {
    /// Runs inference over 16 kHz mono samples and returns every decoded
    /// segment. Implementations poll `abort` and return early once it is set.
    fn run(
        &self,
        samples: &[f32],
        params: &TranscriptionParams,
        on_segment: SegmentSink,
        abort: &CancelSignal,
    ) -> Result<Vec<Segment>>;
}

/// Transcribes `audio`, streaming cumulative partial text to `on_partial`.
///
/// Returns `Cancelled` whenever `abort` was raised during the run, whatever
/// the engine itself returned.
pub fn transcribe(
    engine: &dyn InferenceEngine,
    audio: &AudioBuffer,
    params: &TranscriptionParams,
    mut on_partial: impl FnMut(PartialTranscript) + Send + 'static,
    abort: &CancelSignal,
) -> Result<String> {
    params.validate()?;
    abort.check()?;

    let mut audio = audio.clone();
    audio.pad_to(MIN_AUDIO_SECONDS);

    let mut cumulative = String::new();
    let sink: SegmentSink = Box::new(move |segment: Segment| {
        cumulative.push(' ');
        cumulative.push_str(&segment.text);
        on_partial(PartialTranscript {
            text: strip_filler(&cumulative),
            latest_timestamp: segment.end_ms.max(0) as f64 / 1000.0,
        });
    });

    let start_time = Instant::now();
    let result = engine.run(audio.samples(), params, sink, abort);
    if abort.is_set() {
        tracing::debug!("Inference unwound after cancellation");
        return Err(QueueError::Cancelled);
    }
    let segments = result?;
    let text = render_transcript(&segments, params.emit_timestamps);

    let elapsed_ms = start_time.elapsed().as_millis() as u64;
    let audio_ms = (audio.duration_seconds() * 1000.0) as u64;
    tracing::info!(
        "Transcription complete: {} segments, {} chars in {}ms (RTF: {:.2})",
        segments.len(),
        text.len(),
        elapsed_ms,
        if audio_ms == 0 { 0.0 } else { elapsed_ms as f64 / audio_ms as f64 }
    );
    Ok(text)
}

/// Removes filler markers and collapses whitespace.
pub fn strip_filler(text: &str) -> String {
    let mut cleaned = text.to_string();
    for marker in FILLER_MARKERS {
        if cleaned.contains(marker) {
            cleaned = cleaned.replace(marker, " ");
        }
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Joins segments into the final transcript.
pub fn render_transcript(segments: &[Segment], emit_timestamps: bool) -> String {
    let parts: Vec<String> = segments
        .iter()
        .filter_map(|segment| {
            let text = strip_filler(&segment.text);
            if text.is_empty() {
                return None;
            }
            Some(if emit_timestamps {
                format!(
                    "[{} --> {}] {}",
                    format_timestamp(segment.start_ms),
                    format_timestamp(segment.end_ms),
                    text
                )
            } else {
                text
            })
        })
        .collect();

    if parts.is_empty() {
        return NO_SPEECH_SENTINEL.to_string();
    }
    parts.join(if emit_timestamps { "\n" } else { " " })
}

/// `HH:MM:SS.mmm`
fn format_timestamp(ms: i64) -> String {
    let ms = ms.max(0);
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        ms / 3_600_000,
        (ms / 60_000) % 60,
        (ms / 1000) % 60,
        ms % 1000
    )
}

/// Stand-in used when no engine could be initialized; every run fails.
#[derive(Debug, Clone)]
pub struct UnavailableEngine {
    reason: String,
}

impl UnavailableEngine {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl InferenceEngine for UnavailableEngine {
    fn run(
        &self,
        _samples: &[f32],
        _params: &TranscriptionParams,
        _on_segment: SegmentSink,
        _abort: &CancelSignal,
    ) -> Result<Vec<Segment>> {
        Err(QueueError::EngineUnavailable(self.reason.clone()))
    }
}

/// Loads the engine described by `config`. Load failures are deferred: the
/// returned engine fails every job with `EngineUnavailable`.
pub fn load_engine(config: &EngineConfig) -> Arc<dyn InferenceEngine> {
    #[cfg(feature = "whisper")]
    {
        match whisper::WhisperEngine::load(config) {
            Ok(engine) => Arc::new(engine),
            Err(e) => {
                tracing::error!("Whisper engine unavailable: {}", e);
                Arc::new(UnavailableEngine::new(e.to_string()))
            }
        }
    }
    #[cfg(not(feature = "whisper"))]
    {
        let _ = config;
        tracing::warn!("Built without the `whisper` feature; transcription is unavailable");
        Arc::new(UnavailableEngine::new(
            "built without the `whisper` feature",
        ))
    }
}

#[cfg(feature = "whisper")]
pub use whisper::WhisperEngine;

#[cfg(feature = "whisper")]
mod whisper {
    use super::*;
    use whisper_rs::{
        FullParams, SamplingStrategy, SegmentCallbackData, WhisperContext,
        WhisperContextParameters,
    };

    /// Whisper timestamps are in centiseconds (1/100 of a second).
    fn centis_to_ms(t: i64) -> i64 {
        t * 10
    }

    /// whisper.cpp behind `whisper-rs`.
    pub struct WhisperEngine {
        ctx: WhisperContext,
    }

    impl WhisperEngine {
        /// Loads the model.
        pub fn load(config: &EngineConfig) -> Result<Self> {
            let model_path = config.resolve_model_path()?;
            if !model_path.exists() {
                return Err(QueueError::EngineUnavailable(format!(
                    "model not found: {}",
                    model_path.display()
                )));
            }
            let model_path = model_path.to_string_lossy().into_owned();

            tracing::info!("Loading Whisper model from: {}", model_path);

            let mut ctx_params = WhisperContextParameters::default();
            ctx_params.use_gpu(config.use_gpu);
            ctx_params.flash_attn(config.flash_attention);

            let ctx = WhisperContext::new_with_params(&model_path, ctx_params).map_err(|e| {
                QueueError::EngineUnavailable(format!("failed to load model: {}", e))
            })?;

            tracing::info!("Whisper model loaded successfully");
            Ok(Self { ctx })
        }
    }

    fn processing(what: &str, e: impl std::fmt::Display) -> QueueError {
        QueueError::ProcessingFailed(format!("{}: {}", what, e))
    }

    impl InferenceEngine for WhisperEngine {
        fn run(
            &self,
            samples: &[f32],
            params: &TranscriptionParams,
            mut on_segment: SegmentSink,
            abort: &CancelSignal,
        ) -> Result<Vec<Segment>> {
            let strategy = match params.strategy {
                crate::config::SamplingStrategy::Greedy => SamplingStrategy::Greedy { best_of: 1 },
                crate::config::SamplingStrategy::BeamSearch => SamplingStrategy::BeamSearch {
                    beam_size: params.beam_size as i32,
                    patience: -1.0,
                },
            };
            let mut full_params = FullParams::new(strategy);

            full_params.set_language(Some(params.language.code().unwrap_or("auto")));
            full_params.set_translate(params.language.translate_to_english);
            full_params.set_n_threads(params.thread_count as i32);
            full_params.set_temperature(params.temperature);
            if !params.initial_prompt.is_empty() {
                full_params.set_initial_prompt(&params.initial_prompt);
            }
            full_params.set_single_segment(params.single_segment);
            full_params.set_suppress_blank(params.suppress_blank_audio);
            full_params.set_suppress_non_speech_tokens(true);
            full_params.set_print_special(false);
            full_params.set_print_progress(false);
            full_params.set_print_realtime(false);
            full_params.set_print_timestamps(false);

            full_params.set_segment_callback_safe(move |data: SegmentCallbackData| {
                on_segment(Segment::new(
                    centis_to_ms(data.start_timestamp),
                    centis_to_ms(data.end_timestamp),
                    data.text,
                ));
            });
            let abort_flag = abort.clone();
            full_params.set_abort_callback_safe(move || abort_flag.is_set());

            let mut state = self
                .ctx
                .create_state()
                .map_err(|e| processing("failed to create state", e))?;

            let outcome = state.full(full_params, samples);
            abort.check()?;
            outcome.map_err(|e| processing("inference failed", e))?;

            let num_segments = state
                .full_n_segments()
                .map_err(|e| processing("failed to get segments", e))?;

            let mut segments = Vec::with_capacity(num_segments.max(0) as usize);
            for i in 0..num_segments {
                let text = state
                    .full_get_segment_text(i)
                    .map_err(|e| processing("failed to get segment text", e))?;
                let t0 = state
                    .full_get_segment_t0(i)
                    .map_err(|e| processing("failed to get start time", e))?;
                let t1 = state
                    .full_get_segment_t1(i)
                    .map_err(|e| processing("failed to get end time", e))?;
                segments.push(Segment::new(centis_to_ms(t0), centis_to_ms(t1), text));
            }
            Ok(segments)
        }
    }
}
