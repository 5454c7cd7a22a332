//! Tracing setup for the acvm binary.
//!
//! stderr always gets human-readable output. With `ACVM_LOG=1` every session
//! is also appended to `<logs>/acvm.log`, one file per day, including the
//! engine's own stderr (target `engine`).
//!
//! `RUST_LOG` overrides the default filter in both cases.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment switch for the file layer.
pub const FILE_LOG_ENV: &str = "ACVM_LOG";

/// Flushes the file layer when dropped. Keep it alive in `main`.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Default directive when `RUST_LOG` is unset.
fn default_directive(verbose: bool, file_logging: bool) -> &'static str {
    match (verbose, file_logging) {
        (true, _) => "acvm=debug,engine=info,info",
        (false, true) => "info",
        (false, false) => "warn",
    }
}

fn file_logging_enabled() -> bool {
    std::env::var(FILE_LOG_ENV).as_deref() == Ok("1")
}

/// Install the global subscriber. Call once.
pub fn init(log_dir: Option<&Path>, verbose: bool) -> LogGuard {
    let file_logging = file_logging_enabled();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, file_logging)));

    let (file_layer, file_guard) = if file_logging {
        let dir = log_dir.map_or_else(std::env::temp_dir, Path::to_path_buf);
        let _ = std::fs::create_dir_all(&dir);
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "acvm.log"));
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(verbose))
        .with(file_layer)
        .init();

    LogGuard { _file: file_guard }
}
