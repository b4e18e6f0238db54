//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber writing to stderr.
///
/// Honours `RUST_LOG`; defaults to `whisper_queue=info`. Calling it again
/// after a subscriber is installed does nothing.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("whisper_queue=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
