//! Ambient logging setup (§6.7).
//!
//! One `tracing` subscriber for the whole process: an `EnvFilter` driven by
//! `RUST_LOG` (default `info`), human-readable output to stderr by default,
//! switching to newline-delimited JSON when `LOG_FORMAT=json` — useful when
//! stdout/stderr are shipped to a log aggregator rather than a terminal.
//! When `LOG_DIR` is set, logs are additionally written to a daily-rolling
//! file via `tracing-appender`; the returned guard must be held for the
//! life of the process or the background writer thread is dropped.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber. Returns a guard that must be kept
/// alive for the duration of the process when file logging is enabled.
pub fn init() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let log_dir = std::env::var("LOG_DIR").ok();
    let (non_blocking, guard) = match &log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "devteam-runner.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter);

    match (non_blocking, json) {
        (Some(writer), true) => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .init();
        }
        (Some(writer), false) => {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(writer))
                .init();
        }
        (None, true) => {
            registry.with(tracing_subscriber::fmt::layer().json()).init();
        }
        (None, false) => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_falls_back_to_info_when_rust_log_unset() {
        // try_from_default_env reads RUST_LOG; absent in the test process
        // unless the harness sets it, so this just checks the fallback path
        // doesn't panic.
        let _ = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    }
}
