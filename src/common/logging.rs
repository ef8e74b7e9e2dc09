//! Logging and tracing configuration
//!
//! The library itself only emits `tracing` events; these helpers install a
//! subscriber for the `dxipc` binary. The daemon logs to a file since it
//! usually runs detached from a terminal.

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::paths;

/// Initialize tracing for the CLI (stderr logging)
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate, WARN for dependencies.
pub fn init_cli() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dxrt_ipc=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

/// Initialize tracing for the daemon (file + stderr logging)
///
/// The file layer goes through a non-blocking writer; keep the returned
/// guard alive for the lifetime of the daemon or buffered lines are lost.
/// Returns `None` when no log directory is available, in which case only
/// stderr is used.
pub fn init_daemon(log_file_name: &str) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dxrt_ipc=debug,info"));

    let log_dir = paths::log_dir().filter(|dir| std::fs::create_dir_all(dir).is_ok());
    let (subscriber, guard) = daemon_subscriber(filter, log_dir.as_deref(), log_file_name);
    subscriber.init();
    guard
}

/// Registry with an optional file layer under `log_dir` and a stderr layer
fn daemon_subscriber(
    filter: EnvFilter,
    log_dir: Option<&Path>,
    log_file_name: &str,
) -> (impl Subscriber + Send + Sync + 'static, Option<WorkerGuard>) {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, log_file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .compact(),
        );

    (subscriber, guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_subscriber_writes_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let (subscriber, guard) =
            daemon_subscriber(EnvFilter::new("info"), Some(dir.path()), "daemon.log");
        assert!(guard.is_some());

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(pid = 7, "Service starting");
        });
        drop(guard);

        let written = std::fs::read_to_string(dir.path().join("daemon.log")).unwrap();
        assert!(written.contains("Service starting"));
        assert!(!written.contains("\x1b["));
    }

    #[test]
    fn test_daemon_subscriber_without_log_dir() {
        let (subscriber, guard) = daemon_subscriber(EnvFilter::new("info"), None, "daemon.log");
        assert!(guard.is_none());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("stderr only");
        });
    }
}
