//! Logging configuration with journald support on Linux.
//!
//! Training runs are usually launched unattended, so the default sink is the
//! systemd journal with a rolling file as fallback. Interactive runs can log to
//! stderr instead.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "GEOALIGN_LOG";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the logging system.
///
/// On Linux, this will attempt to connect to systemd-journald.
/// If unavailable or on other platforms, logs go to a daily rolling file.
///
/// Log level can be controlled via the `GEOALIGN_LOG` environment variable,
/// e.g. `GEOALIGN_LOG=geoalign=debug` to trace step state transitions.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(journald_layer)
                .try_init()?;

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("geoalign")
            .join("logs")
    });

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "geoalign.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The writer stops flushing once the guard drops; keep it for the process lifetime.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()?;

    tracing::info!("Logging initialized with file backend at {:?}", log_dir);
    Ok(())
}

/// Initialize logging to stderr, for runs attached to a terminal.
pub fn init_stderr() -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()?;
    Ok(())
}
