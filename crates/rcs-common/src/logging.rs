//! ---
//! rcs_section: "01-core-functionality"
//! rcs_subsection: "module"
//! rcs_type: "source"
//! rcs_scope: "code"
//! rcs_description: "Tracing setup for the supervisor: console output plus a rolling file on flash."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
use std::io;
use std::path::Path;

use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Supervisor-specific filter; wins over `RUST_LOG`.
pub const LOG_ENV: &str = "RCS_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

static WRITER_GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

/// Console log format. The rolling file is always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Filter directive picked from `RCS_LOG`, then `RUST_LOG`, then `info`.
///
/// A directive that does not parse is replaced by the default; the rejected
/// text comes back so it can be reported once logging is up.
pub fn select_filter(
    rcs_log: Option<String>,
    rust_log: Option<String>,
) -> (EnvFilter, Option<String>) {
    let Some(directive) = rcs_log.or(rust_log).filter(|d| !d.trim().is_empty()) else {
        return (EnvFilter::new(DEFAULT_DIRECTIVE), None);
    };
    match EnvFilter::try_new(&directive) {
        Ok(filter) => (filter, None),
        Err(_) => (EnvFilter::new(DEFAULT_DIRECTIVE), Some(directive)),
    }
}

fn rolling_writer(directory: &Path, prefix: &str) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(directory)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(format!("{prefix}.log"))
        .build(directory)?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Install the global subscriber for `service_name`.
///
/// When the log directory cannot be created (read-only or full flash) the
/// supervisor keeps running with console output only. Calling this twice
/// leaves the first subscriber in place.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let (filter, rejected) = select_filter(
        std::env::var(LOG_ENV).ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
    );

    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
    let (file_writer, file_error) = match rolling_writer(&config.directory, prefix) {
        Ok((writer, guard)) => (Some((writer, guard)), None),
        Err(err) => (None, Some(err)),
    };
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(io::stdout());

    let mut guards = vec![stdout_guard];
    let file_layer = file_writer.map(|(writer, guard)| {
        guards.push(guard);
        fmt::layer()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(writer)
    });
    let console_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();
    if !installed {
        return Ok(());
    }
    let _ = WRITER_GUARDS.set(guards);

    if let Some(directive) = rejected {
        warn!(directive = %directive, fallback = DEFAULT_DIRECTIVE, "ignoring unparsable log filter");
    }
    match file_error {
        Some(err) => warn!(
            log_dir = %config.directory.display(),
            error = %err,
            "log directory unavailable, logging to console only"
        ),
        None => info!(
            service = %service_name,
            log_dir = %config.directory.display(),
            format = ?config.format,
            "tracing initialised"
        ),
    }
    Ok(())
}
