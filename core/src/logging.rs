// Logging setup
//
// Both initialisers are idempotent: the first subscriber installed wins and
// later calls are silently ignored.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Log to stdout, filtered by RUST_LOG or `default_level`
pub fn init_tracing(default_level: &str, json: bool) {
    if json {
        let _ = tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter(default_level))
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter(default_level))
            .try_init();
    }
}

/// Log to a daily-rolling file under `dir`.
///
/// Keep the returned guard alive for as long as logs should be written;
/// dropping it flushes and stops the background writer.
pub fn init_file_tracing(dir: &Path, default_level: &str) -> WorkerGuard {
    let appender = tracing_appender::rolling::daily(dir, "meshlink.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing("debug", false);
        init_tracing("warn", true);
        tracing::info!("still logging");
    }
}
