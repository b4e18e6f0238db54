//! External transcoder invocation for containers `hound` cannot read.

use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use crate::audio::WHISPER_SAMPLE_RATE;
use crate::cancel::CancelSignal;
use crate::error::{QueueError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Transcodes `input` into a 16 kHz mono PCM WAV inside `work_dir`.
///
/// The child process is killed as soon as `signal` is raised.
pub fn transcode_to_wav(input: &Path, work_dir: &Path, signal: &CancelSignal) -> Result<PathBuf> {
    std::fs::create_dir_all(work_dir)?;
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    let output = work_dir.join(format!("{}.16k-mono.wav", stem));
    let args = vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-i".to_owned(),
        input.display().to_string(),
        "-ar".to_owned(),
        WHISPER_SAMPLE_RATE.to_string(),
        "-ac".to_owned(),
        "1".to_owned(),
        "-c:a".to_owned(),
        "pcm_s16le".to_owned(),
        output.display().to_string(),
    ];
    run_cancellable("ffmpeg", &args, signal)?;
    Ok(output)
}

/// Asks `ffprobe` for the container duration.
pub fn probe_duration_seconds(input: &Path) -> Option<f64> {
    let args = vec![
        "-v".to_owned(),
        "error".to_owned(),
        "-show_entries".to_owned(),
        "format=duration".to_owned(),
        "-of".to_owned(),
        "default=nokey=1:noprint_wrappers=1".to_owned(),
        input.display().to_string(),
    ];
    let stdout = run_cancellable("ffprobe", &args, &CancelSignal::new()).ok()?;
    let secs = stdout.trim().parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(secs)
}

/// Runs a subprocess, polling `signal` between status checks. Returns stdout.
fn run_cancellable(program: &str, args: &[String], signal: &CancelSignal) -> Result<String> {
    let rendered = format!("{} {}", program, args.join(" "));
    tracing::debug!("Running {}", rendered);

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                QueueError::DecodeError(format!("{} is not installed", program))
            }
            _ => QueueError::DecodeError(format!("failed to start {}: {}", program, e)),
        })?;

    let stdout_reader = child.stdout.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        })
    });

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if signal.is_set() {
            let _ = child.kill();
            let _ = child.wait();
            tracing::debug!("Killed {} after cancellation", program);
            return Err(QueueError::Cancelled);
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stderr = stderr_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    if !status.success() {
        return Err(QueueError::DecodeError(format!(
            "{} exited with {}: {}",
            program,
            status,
            stderr.trim()
        )));
    }
    Ok(stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_program_is_decode_error() {
        let err = run_cancellable("definitely-not-a-transcoder", &[], &CancelSignal::new())
            .unwrap_err();
        assert!(matches!(err, QueueError::DecodeError(msg) if msg.contains("not installed")));
    }

    #[cfg(unix)]
    #[test]
    fn test_cancellation_kills_child() {
        let signal = CancelSignal::new();
        let remote = signal.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            remote.set();
        });
        let started = std::time::Instant::now();
        let err = run_cancellable("sleep", &["5".to_string()], &signal).unwrap_err();
        canceller.join().unwrap();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_child_reports_status() {
        let err = run_cancellable("false", &[], &CancelSignal::new()).unwrap_err();
        assert!(matches!(err, QueueError::DecodeError(msg) if msg.contains("false exited")));
    }
}
