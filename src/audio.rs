//! Audio decoding and conversion to the engine's sample format.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::cancel::CancelSignal;
use crate::error::{QueueError, Result};

/// Audio sample rate expected by Whisper (16kHz).
pub const WHISPER_SAMPLE_RATE: u32 = 16000;

/// Samples decoded between two progress reports.
const PROGRESS_INTERVAL: usize = WHISPER_SAMPLE_RATE as usize;

/// Audio buffer holding mono f32 samples.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioBuffer {
    /// Creates a buffer from existing samples.
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Returns the samples as a slice.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Returns the sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Returns the duration in seconds.
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Returns the number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Resamples the audio to the target sample rate using linear interpolation.
    pub fn resample(&self, target_rate: u32) -> AudioBuffer {
        if self.sample_rate == target_rate || self.samples.is_empty() || self.sample_rate == 0 {
            return AudioBuffer::from_samples(self.samples.clone(), target_rate);
        }

        let ratio = target_rate as f64 / self.sample_rate as f64;
        let new_len = (self.samples.len() as f64 * ratio) as usize;
        let last = self.samples.len() - 1;
        let mut resampled = Vec::with_capacity(new_len);

        for i in 0..new_len {
            let src_idx = i as f64 / ratio;
            let idx_floor = (src_idx.floor() as usize).min(last);
            let idx_ceil = (idx_floor + 1).min(last);
            let frac = src_idx - idx_floor as f64;

            let sample = self.samples[idx_floor] as f64 * (1.0 - frac)
                + self.samples[idx_ceil] as f64 * frac;
            resampled.push(sample as f32);
        }

        AudioBuffer::from_samples(resampled, target_rate)
    }

    /// Pads with trailing silence up to `min_seconds`.
    pub fn pad_to(&mut self, min_seconds: f64) {
        let min_len = (min_seconds * self.sample_rate as f64).ceil() as usize;
        if self.samples.len() < min_len {
            self.samples.resize(min_len, 0.0);
        }
    }
}

/// Averages interleaved channels down to one.
pub fn downmix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Converts a source file into engine-ready samples.
pub trait AudioConverter: Send + Sync {
    /// Decodes `source` to mono 16 kHz samples.
    ///
    /// `on_progress` receives non-decreasing fractions in [0, 1]. The
    /// conversion stops with `Cancelled` once `signal` is raised.
    fn convert(
        &self,
        source: &Path,
        signal: &CancelSignal,
        on_progress: &mut dyn FnMut(f64),
    ) -> Result<AudioBuffer>;
}

/// Decodes WAV natively and hands every other container to `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FileConverter {
    work_dir: PathBuf,
}

impl FileConverter {
    /// `work_dir` receives intermediate transcodes; they are removed after use.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }
}

impl Default for FileConverter {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("whisper-queue"))
    }
}

impl AudioConverter for FileConverter {
    fn convert(
        &self,
        source: &Path,
        signal: &CancelSignal,
        on_progress: &mut dyn FnMut(f64),
    ) -> Result<AudioBuffer> {
        if !source.exists() {
            return Err(QueueError::SourceMissing(source.display().to_string()));
        }
        signal.check()?;

        if is_wav(source) {
            return decode_wav(source, signal, on_progress);
        }

        tracing::debug!("Transcoding {} with ffmpeg", source.display());
        let wav = crate::process::transcode_to_wav(source, &self.work_dir, signal)?;
        on_progress(0.5);
        let decoded = decode_wav(&wav, signal, &mut |fraction| on_progress(0.5 + fraction * 0.5));
        if let Err(e) = std::fs::remove_file(&wav) {
            tracing::warn!("Failed to remove {}: {}", wav.display(), e);
        }
        decoded
    }
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("wav") || e.eq_ignore_ascii_case("wave"))
        .unwrap_or(false)
}

fn decode_error(path: &Path, e: impl std::fmt::Display) -> QueueError {
    QueueError::DecodeError(format!("{}: {}", path.display(), e))
}

/// Loads a WAV file as mono 16 kHz samples, reporting progress once per
/// second of decoded audio.
pub fn decode_wav(
    path: &Path,
    signal: &CancelSignal,
    on_progress: &mut dyn FnMut(f64),
) -> Result<AudioBuffer> {
    let mut reader = hound::WavReader::open(path).map_err(|e| decode_error(path, e))?;
    let spec = reader.spec();
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(decode_error(path, "invalid WAV header"));
    }
    // The header's sample count is untrusted; never expect more samples
    // than the file can hold.
    let file_len = std::fs::metadata(path)?.len();
    let bytes_per_sample = u64::from(spec.bits_per_sample.div_ceil(8).max(1));
    let total = (u64::from(reader.len()).min(file_len / bytes_per_sample) as usize).max(1);

    let samples = match spec.sample_format {
        hound::SampleFormat::Float => {
            read_samples::<f32>(&mut reader, path, total, signal, on_progress, |s| s)?
        }
        hound::SampleFormat::Int => {
            let max_value = (1u64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            read_samples::<i32>(&mut reader, path, total, signal, on_progress, |s| {
                s as f32 / max_value
            })?
        }
    };

    let mono = downmix_to_mono(&samples, spec.channels);
    let buffer = AudioBuffer::from_samples(mono, spec.sample_rate);
    let buffer = if spec.sample_rate != WHISPER_SAMPLE_RATE {
        buffer.resample(WHISPER_SAMPLE_RATE)
    } else {
        buffer
    };
    on_progress(1.0);

    tracing::debug!(
        "Decoded {} ({} Hz, {} ch) into {:.2}s of audio",
        path.display(),
        spec.sample_rate,
        spec.channels,
        buffer.duration_seconds()
    );
    Ok(buffer)
}

fn read_samples<S: hound::Sample>(
    reader: &mut hound::WavReader<BufReader<File>>,
    path: &Path,
    total: usize,
    signal: &CancelSignal,
    on_progress: &mut dyn FnMut(f64),
    to_f32: impl Fn(S) -> f32,
) -> Result<Vec<f32>> {
    let mut out = Vec::with_capacity(total);
    for (i, sample) in reader.samples::<S>().enumerate() {
        out.push(to_f32(sample.map_err(|e| decode_error(path, e))?));
        if (i + 1) % PROGRESS_INTERVAL == 0 {
            signal.check()?;
            on_progress(((i + 1) as f64 / total as f64).min(1.0));
        }
    }
    signal.check()?;
    Ok(out)
}

/// Best-effort duration of an audio file, used by the import handler.
pub fn probe_duration_seconds(path: &Path) -> Option<f64> {
    if is_wav(path) {
        let reader = hound::WavReader::open(path).ok()?;
        let rate = reader.spec().sample_rate;
        if rate == 0 {
            return None;
        }
        return Some(reader.duration() as f64 / rate as f64);
    }
    crate::process::probe_duration_seconds(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, seconds: f32) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let frames = (sample_rate as f32 * seconds) as usize;
        for i in 0..frames {
            let value = ((i as f32 / 20.0).sin() * 8000.0) as i16;
            for _ in 0..channels {
                writer.write_sample(value).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_resample() {
        // 48kHz to 16kHz should reduce length by 1/3
        let samples: Vec<f32> = (0..48000).map(|i| (i as f32 / 48000.0).sin()).collect();
        let buffer = AudioBuffer::from_samples(samples, 48000);
        let resampled = buffer.resample(WHISPER_SAMPLE_RATE);
        assert_eq!(resampled.len(), 16000);
        assert_eq!(resampled.sample_rate(), WHISPER_SAMPLE_RATE);
    }

    #[test]
    fn test_downmix_averages_channels() {
        let mono = downmix_to_mono(&[0.2, 0.4, -1.0, 1.0], 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert_eq!(mono[1], 0.0);
    }

    #[test]
    fn test_pad_to_minimum_length() {
        let mut buffer = AudioBuffer::from_samples(vec![0.5; 100], WHISPER_SAMPLE_RATE);
        buffer.pad_to(1.0);
        assert_eq!(buffer.len(), 16000);
        assert_eq!(buffer.samples()[99], 0.5);
        assert_eq!(buffer.samples()[100], 0.0);
    }

    #[test]
    fn test_decode_stereo_44k_with_progress() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 44100, 2, 2.0);

        let mut reported = Vec::new();
        let buffer = FileConverter::new(dir.path())
            .convert(&path, &CancelSignal::new(), &mut |p| reported.push(p))
            .unwrap();

        assert_eq!(buffer.sample_rate(), WHISPER_SAMPLE_RATE);
        assert!((buffer.duration_seconds() - 2.0).abs() < 0.01);
        assert!(reported.len() > 2);
        assert!(reported.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*reported.last().unwrap(), 1.0);
    }

    #[test]
    fn test_raised_signal_cancels_conversion() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, 16000, 1, 3.0);

        let signal = CancelSignal::new();
        let remote = signal.clone();
        let result = decode_wav(&path, &signal, &mut |p| {
            if p > 0.3 {
                remote.set();
            }
        });
        assert!(result.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_unreadable_file_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.wav");
        std::fs::write(&path, b"this is not audio").unwrap();
        let err = FileConverter::new(dir.path())
            .convert(&path, &CancelSignal::new(), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, QueueError::DecodeError(_)));
    }

    #[test]
    fn test_oversized_data_chunk_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lying.wav");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&0xFFFF_FF00u32.wrapping_add(36).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
        bytes.extend_from_slice(&1u16.to_le_bytes()); // mono
        bytes.extend_from_slice(&16000u32.to_le_bytes());
        bytes.extend_from_slice(&16000u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&8u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&0xFFFF_FF00u32.to_le_bytes());
        bytes.extend_from_slice(&[128u8; 106]);
        std::fs::write(&path, &bytes).unwrap();

        let err = decode_wav(&path, &CancelSignal::new(), &mut |_| {}).unwrap_err();
        assert!(matches!(err, QueueError::DecodeError(_)));
    }

    #[test]
    fn test_missing_source() {
        let err = FileConverter::default()
            .convert(Path::new("/nonexistent/x.wav"), &CancelSignal::new(), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, QueueError::SourceMissing(_)));
    }

    #[test]
    fn test_probe_wav_duration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, 8000, 1, 1.5);
        let secs = probe_duration_seconds(&path).unwrap();
        assert!((secs - 1.5).abs() < 1e-3);
    }
}
