//! Logging and tracing configuration
//!
//! Session progress goes to stderr. A session log file can be added for CI
//! runs where the terminal output is lost.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing for the CLI
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate (DEBUG when `verbose`), WARN for
/// dependencies. When `log_file` is given, everything is also written there
/// without ANSI colors; keep the returned guard alive until exit so the
/// writer flushes.
pub fn init_cli(verbose: bool, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let default_directive = if verbose {
        "harness=debug,runner=info,warn"
    } else {
        "harness=info,runner=info,warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return None;
    };

    let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
    let file_name = path.file_name().unwrap_or_else(|| "harness.log".as_ref());
    let appender = tracing_appender::rolling::never(directory.unwrap_or(Path::new(".")), file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Some(guard)
}
