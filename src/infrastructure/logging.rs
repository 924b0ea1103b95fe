//! Logging setup built on tracing.

use std::io;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::domain::models::{LogFormat, LogSettings};

/// Keeps the non-blocking file writer alive for the process lifetime.
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
}

/// Initialize the global subscriber from settings. RUST_LOG overrides
/// the configured default level.
pub fn init(settings: &LogSettings) -> Result<LogGuard> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(settings.level.parse()?)
        .from_env_lossy();

    let guard = if let Some(log_dir) = &settings.log_dir {
        let file_appender = rolling::daily(log_dir, "drover.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // File output is always JSON for structured search, capped by
        // the same filter as stdout.
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_filter(env_filter.clone());

        match settings.format {
            LogFormat::Json => {
                let stdout_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(io::stdout)
                    .with_target(true)
                    .with_filter(env_filter);
                tracing_subscriber::registry()
                    .with(file_layer)
                    .with(stdout_layer)
                    .init();
            }
            LogFormat::Pretty => {
                let stdout_layer = tracing_subscriber::fmt::layer()
                    .with_writer(io::stdout)
                    .with_target(true)
                    .with_filter(env_filter);
                tracing_subscriber::registry()
                    .with(file_layer)
                    .with(stdout_layer)
                    .init();
            }
        }
        Some(guard)
    } else {
        match settings.format {
            LogFormat::Json => {
                let stdout_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(io::stdout)
                    .with_target(true)
                    .with_filter(env_filter);
                tracing_subscriber::registry().with(stdout_layer).init();
            }
            LogFormat::Pretty => {
                let stdout_layer = tracing_subscriber::fmt::layer()
                    .with_writer(io::stdout)
                    .with_target(true)
                    .with_filter(env_filter);
                tracing_subscriber::registry().with(stdout_layer).init();
            }
        }
        None
    };

    Ok(LogGuard { _guard: guard })
}
