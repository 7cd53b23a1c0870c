use std::io;

use chrono::Local;
use tracing_appender::rolling;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

use super::paths::AppPaths;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing with a file logger under `~/.tiller/logs`, falling back
/// to stderr when there is no home directory. The filter comes from RUST_LOG
/// and defaults to `info`.
///
/// Calling this more than once is harmless: later calls leave the first
/// subscriber in place.
pub fn init_tracing() -> io::Result<()> {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");

    if let Some(log_dir) = AppPaths::log_dir() {
        std::fs::create_dir_all(&log_dir)?;

        let file_name = format!("{timestamp}.log");
        let file_appender = rolling::never(&log_dir, &file_name);

        let installed = tracing_subscriber::registry()
            .with(
                fmt::Layer::new()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(env_filter())
            .try_init()
            .is_ok();

        if installed {
            tracing::debug!(
                target: "tiller_core::utils::tracing",
                path = %log_dir.join(&file_name).display(),
                "Tracing initialized with file output"
            );
        }
    } else {
        let installed = tracing_subscriber::registry()
            .with(
                fmt::Layer::default()
                    .with_writer(io::stderr)
                    .with_target(true),
            )
            .with(env_filter())
            .try_init()
            .is_ok();

        if installed {
            tracing::debug!(
                target: "tiller_core::utils::tracing",
                "Tracing initialized with stderr output"
            );
        }
    }

    Ok(())
}
