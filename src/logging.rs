//! Diagnostic logging for the `tcpguard` binary.
//!
//! This is operator-facing `tracing` output, separate from the audit log:
//! decisions are recorded by [`crate::audit`] whatever the log level.
//!
//! The long-running host adapter ([`init_production`]) keeps a daily JSON
//! file under the logs directory and mirrors events to stderr. One-shot
//! subcommands ([`init_cli`]) log to stderr only, quietly, because their
//! stdout carries machine-readable results.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// File name prefix under the logs directory; the appender adds the date.
const LOG_FILE_PREFIX: &str = "tcpguard.log";

/// Keeps the background log writer alive. Drop it last; dropping flushes
/// buffered events to disk.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// `RUST_LOG` if set and valid, otherwise `default`.
fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Logging for `tcpguard run`.
///
/// Events go to `{logs_dir}/tcpguard.log.YYYY-MM-DD` as JSON lines and to
/// stderr as text. The default level is `info`, which includes every
/// quarantine, release and fail-open allowance.
///
/// # Errors
///
/// Fails if `logs_dir` cannot be created or another subscriber already
/// owns the process.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX));

    tracing_subscriber::registry()
        .with(filter_or("info"))
        .with(tracing_subscriber::fmt::layer().json().with_writer(file_writer))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("failed to install log subscriber")?;

    Ok(LoggingGuard { _guard: guard })
}

/// Logging for `encode`, `inspect`, `check` and `release`: stderr only, at
/// `warn` unless `RUST_LOG` says otherwise.
pub fn init_cli() {
    // Keep an already-installed subscriber (test harnesses).
    let _init_result = tracing_subscriber::fmt()
        .with_env_filter(filter_or("warn"))
        .with_writer(std::io::stderr)
        .try_init();
}
