//! Tracing initialisation: level filtering from config, stderr by default,
//! daily-rolling non-blocking file output when a filename is configured.

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

// The non-blocking writer stops flushing once its guard drops, so the guard
// lives for the process.
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let filter = build_filter(&config.level);

    if config.filename.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(());
    }

    let path = Path::new(&config.filename);
    let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("log filename {:?} has no file component", config.filename))?;

    let appender = tracing_appender::rolling::daily(
        directory.unwrap_or_else(|| Path::new(".")),
        file_name,
    );
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .init();

    if config.compress {
        tracing::info!("log.compress is set; rotated files are not compressed");
    }
    Ok(())
}

fn build_filter(level: &str) -> EnvFilter {
    if let Ok(custom) = std::env::var("RUST_LOG") {
        return EnvFilter::new(custom);
    }
    EnvFilter::new(normalize_level(level))
}

fn normalize_level(level: &str) -> &str {
    match level {
        "trace" | "debug" | "info" | "warn" | "error" => level,
        _ => "info",
    }
}
