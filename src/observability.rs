// SPDX-License-Identifier: Apache-2.0

//! Logging and observability helpers.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::TracingConfig;

const LOG_FILE_PREFIX: &str = "omopfed.log";

/// Installs the global tracing subscriber. Later calls are no-ops.
pub fn init_tracing(config: &TracingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);

    let installed = match &config.log_dir {
        Some(log_dir) => {
            let _ = fs::create_dir_all(log_dir);
            if let Err(e) = cleanup_old_logs(log_dir, config.retention_days) {
                eprintln!("Failed to clean up old logs: {}", e);
            }
            let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
            let builder = builder.with_writer(file_appender).with_ansi(false);
            if config.json {
                builder.json().with_current_span(true).try_init()
            } else {
                builder.try_init()
            }
        }
        None => {
            let builder = builder.with_writer(std::io::stderr);
            if config.json {
                builder.json().with_current_span(true).try_init()
            } else {
                builder.try_init()
            }
        }
    };

    if installed.is_ok() {
        tracing::info!(log_dir = ?config.log_dir, json = config.json, "Tracing initialized");
    }
}

fn cleanup_old_logs(log_dir: &Path, retention_days: u64) -> std::io::Result<()> {
    let now = SystemTime::now();
    let retention = Duration::from_secs(retention_days * 24 * 60 * 60);

    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();
        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with(LOG_FILE_PREFIX))
            .unwrap_or(false);
        if !is_log {
            continue;
        }

        let age = fs::metadata(&path)
            .and_then(|metadata| metadata.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if let Some(age) = age {
            if age > retention {
                if let Err(e) = fs::remove_file(&path) {
                    eprintln!("Failed to remove old log file {:?}: {}", path, e);
                }
            }
        }
    }
    Ok(())
}
