//! Daemon mode - loopback diagnostic service
//!
//! Hosts a [`Server`] on the configured backend and answers every request
//! through [`LoopbackResponder`]. Useful for checking that runtime clients
//! can reach a service without any device attached.

mod responder;

pub use responder::LoopbackResponder;

use tokio::sync::mpsc;

use crate::common::config::Config;
use crate::common::{crash, Error, Result};
use crate::ipc::Server;

/// Why the daemon stopped waiting
enum Exit {
    Signal(&'static str),
    DispatchFailed(Error),
}

/// Run in daemon mode until SIGINT/SIGTERM or a dispatch failure
///
/// The daemon:
/// 1. Creates the transport channels fresh
/// 2. Answers each request with its natural reply code
/// 3. Closes the transport, joining every worker thread, on the way out
pub fn run(config: Config) -> Result<()> {
    crash::install();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        backend = %config.transport.backend,
        "Starting loopback service"
    );

    let server = Server::initialize(&config.transport)?;
    server.listen()?;

    let (failure_tx, failure_rx) = mpsc::unbounded_channel();
    server.register_receive_cb(LoopbackResponder::new(failure_tx))?;

    let exit = wait_for_exit(failure_rx)?;
    let outcome = match exit {
        Exit::Signal(signal) => {
            tracing::info!(signal, "Shutdown requested");
            Ok(())
        }
        Exit::DispatchFailed(e) => {
            tracing::error!(error = %e, "Dispatch failed, shutting down");
            Err(e)
        }
    };

    server.close()?;
    tracing::info!("Daemon shutdown complete");
    outcome
}

/// Block until a termination signal or a fatal dispatch error
fn wait_for_exit(mut failures: mpsc::UnboundedReceiver<Error>) -> Result<Exit> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(next_exit(&mut failures))
}

#[cfg(unix)]
async fn next_exit(failures: &mut mpsc::UnboundedReceiver<Error>) -> Result<Exit> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = terminate.recv() => Ok(Exit::Signal("SIGTERM")),
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            Ok(Exit::Signal("SIGINT"))
        }
        Some(e) = failures.recv() => Ok(Exit::DispatchFailed(e)),
    }
}

#[cfg(not(unix))]
async fn next_exit(failures: &mut mpsc::UnboundedReceiver<Error>) -> Result<Exit> {
    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            Ok(Exit::Signal("ctrl-c"))
        }
        Some(e) = failures.recv() => Ok(Exit::DispatchFailed(e)),
    }
}
