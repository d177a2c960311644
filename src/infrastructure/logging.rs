//! Logging system configuration and initialization
//!
//! - Console output and/or a daily-rolling log file
//! - Optional structured JSON output
//! - Verbose dependency targets clamped unless the level is `trace`
//! - `RUST_LOG` overrides the configured filter

use anyhow::{Context, Result, anyhow};
use lazy_static::lazy_static;
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub use crate::infrastructure::config::LoggingConfig;

// Global guard to keep the log file writer alive
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>> = Mutex::new(Vec::new());
}

/// Dependency targets that are noisy below `trace`
const QUIET_TARGETS: &[(&str, &str)] = &[
    ("chromiumoxide", "warn"),
    ("chromiumoxide::conn", "error"),
    ("chromiumoxide::handler", "error"),
    ("tungstenite", "warn"),
    ("hyper", "warn"),
    ("hyper_util", "warn"),
    ("h2", "warn"),
    ("reqwest", "info"),
    ("sqlx::query", "warn"),
    ("sqlx::sqlite", "warn"),
    ("tokio", "info"),
];

/// Build the filter used when `RUST_LOG` is not set.
pub fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("Invalid log level '{}'", config.level))?;

    if !config.level.to_lowercase().contains("trace") {
        for (target, level) in QUIET_TARGETS {
            filter = filter.add_directive(format!("{target}={level}").parse()?);
        }
    }

    for (target, level) in &config.module_filters {
        filter = filter.add_directive(
            format!("{target}={level}")
                .parse()
                .with_context(|| format!("Invalid module filter '{target}={level}'"))?,
        );
    }

    Ok(filter)
}

/// Initialize logging with the given configuration.
///
/// Call once per process; the file writer guard lives until exit.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_env_filter(config)?,
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.file_output {
        std::fs::create_dir_all(&config.log_dir)
            .map_err(|e| anyhow!("Failed to create log directory {:?}: {}", config.log_dir, e))?;

        if let Err(e) = cleanup_old_logs(&config.log_dir, &config.file_name, config.max_files) {
            eprintln!("Log cleanup failed: {e}");
        }

        let file_appender = rolling::daily(&config.log_dir, &config.file_name);
        let (file_writer, file_guard) = non_blocking(file_appender);
        LOG_GUARDS
            .lock()
            .map_err(|_| anyhow!("Log guard registry poisoned"))?
            .push(file_guard);

        let file_layer = fmt::Layer::new()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_target(true);
        layers.push(if config.json_format {
            file_layer.json().with_current_span(true).boxed()
        } else {
            file_layer.boxed()
        });
    }

    if config.console_output {
        let console_layer = fmt::Layer::new().with_writer(std::io::stderr).with_target(false);
        layers.push(if config.json_format {
            console_layer.json().boxed()
        } else {
            console_layer.boxed()
        });
    }

    if layers.is_empty() {
        return Err(anyhow!("No logging output configured"));
    }

    Registry::default()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    info!("Logging system initialized");
    info!("Log level: {}", config.level);
    if config.file_output {
        info!("Log directory: {:?}", config.log_dir);
    }

    Ok(())
}

/// Remove rolled log files beyond `max_files`, newest kept first.
///
/// Returns the number of files removed.
pub fn cleanup_old_logs(log_dir: &Path, file_name: &str, max_files: u32) -> Result<usize> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let mut log_files = Vec::new();
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_ours = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with(file_name));
        if path.is_file() && is_ours {
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                log_files.push((path, modified));
            }
        }
    }

    // Sort by modification time (newest first)
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(max_files as usize) {
        match std::fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove old log file {:?}: {}", path, e),
        }
    }

    Ok(removed)
}
