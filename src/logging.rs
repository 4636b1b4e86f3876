//! Structured logging setup for binaries embedding the runtime.

use tracing_subscriber::EnvFilter;

/// Installs a `tracing-subscriber` formatter writing to stderr.
///
/// `RUST_LOG` wins when set; otherwise `level` (`error`, `warn`, `info`,
/// `debug`, `trace` or any filter directive) is used. Calling this twice is
/// harmless: the second call leaves the first subscriber in place.
pub fn init(level: &str) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .with_writer(std::io::stderr)
    .try_init();
}
