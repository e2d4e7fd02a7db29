//! Tracing setup for binaries embedding the metadata engine. The library
//! itself only emits `tracing` events; it never installs a subscriber.

use tracing_subscriber::EnvFilter;

/// Installs a `tracing_subscriber` formatter driven by `RUST_LOG`, falling
/// back to `info` when unset. Intended for test harnesses and example
/// binaries, not for the library's own modules.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}
