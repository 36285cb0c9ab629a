//! Logger bootstrap: wires the configured log sink into the tracing stack.
//!
//! An empty `file_path` logs to stdout; otherwise a size-rotated log file is
//! written next to non-blocking. The returned [`LoggerGuard`] must be kept
//! alive for the duration of the program or buffered log lines are lost.

use std::io;

use anyhow::Context as _;
use camino::Utf8Path;
use mrpc::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub struct LoggerGuard {
    _guard: WorkerGuard,
}

/// Initialize the process-wide tracing subscriber from a [`LoggingConfig`].
///
/// May be called once per process; later calls fail because a global
/// subscriber is already installed.
pub fn init(config: &LoggingConfig) -> anyhow::Result<LoggerGuard> {
    let env_filter = EnvFilter::try_new(config.output_log_level.as_directive())
        .context("invalid log level directive")?;

    let guard = if config.file_path.as_str().is_empty() {
        let (non_blocking_stdout, guard) = tracing_appender::non_blocking(io::stdout());
        let stdout_layer = fmt::layer().with_writer(non_blocking_stdout);

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(env_filter)
            .try_init()
            .context("failed to install the tracing subscriber")?;

        guard
    } else {
        let (folder, prefix) = split_log_path(&config.file_path)?;

        let file_appender = rolling::Builder::new()
            .rotation(rolling::Rotation::max_bytes(config.max_file_size))
            .filename_prefix(prefix)
            .filename_suffix("log")
            .max_log_files(config.max_files)
            .build(folder)
            .context("couldn’t create file appender")?;
        let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = fmt::layer().with_writer(non_blocking_file).with_ansi(false);

        tracing_subscriber::registry()
            .with(file_layer)
            .with(env_filter)
            .try_init()
            .context("failed to install the tracing subscriber")?;

        guard
    };

    Ok(LoggerGuard { _guard: guard })
}

fn split_log_path(path: &Utf8Path) -> anyhow::Result<(&Utf8Path, &str)> {
    if path.is_dir() {
        Ok((path, "mrpc"))
    } else {
        let folder = path.parent().context("invalid log path (parent)")?;
        // A bare file name rotates in the working directory.
        let folder = if folder.as_str().is_empty() {
            Utf8Path::new(".")
        } else {
            folder
        };
        Ok((
            folder,
            path.file_name().context("invalid log path (file_name)")?,
        ))
    }
}
