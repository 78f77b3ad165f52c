use std::path::Path;

use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use surgisync_core::config::LogSettings;

/// Keeps the file writer alive; buffered lines are flushed on drop.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Console output on stderr plus an optional plain-text log file.
/// `RUST_LOG` overrides the configured level.
pub fn init(settings: &LogSettings) -> LogGuard {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = if settings.file.trim().is_empty() {
        (None, None)
    } else {
        let path = Path::new(settings.file.trim());
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let name = path.file_name().unwrap_or(path.as_os_str());
        let appender = tracing_appender::rolling::never(dir, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        )
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(file_layer)
        .with(filter)
        .init();

    debug!(level = %settings.level, file = %settings.file, "Logging configured");
    LogGuard { _file: guard }
}
