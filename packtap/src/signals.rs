//! Process lifecycle wiring
//!
//! [`install`] shuts packtap down on Ctrl-C or SIGTERM and exits with the
//! conventional `128 + signo` code. [`ExitGuard`] covers normal exit: its
//! drop runs the blocking shutdown, which flushes what is still queued.

use crate::engine::Packtap;
use tokio::task::JoinHandle;

pub const SIGINT: i32 = 2;
pub const SIGTERM: i32 = 15;

/// Exit code for a process terminated by `signo`
pub fn exit_code(signo: i32) -> i32 {
    128 + signo
}

/// Wait for Ctrl-C or SIGTERM and return the signal number
#[cfg(unix)]
pub async fn wait_for_signal() -> i32 {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => Some(term),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to listen for SIGTERM");
            None
        }
    };

    tokio::select! {
        _ = ctrl_c() => SIGINT,
        _ = async {
            match term.as_mut() {
                Some(term) => {
                    term.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        } => SIGTERM,
    }
}

/// Wait for Ctrl-C and return the signal number
#[cfg(not(unix))]
pub async fn wait_for_signal() -> i32 {
    ctrl_c().await;
    SIGINT
}

/// Resolves on Ctrl-C; never resolves when the handler cannot be set up
async fn ctrl_c() {
    settle_ctrl_c(tokio::signal::ctrl_c().await).await
}

async fn settle_ctrl_c(result: std::io::Result<()>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Shut `packtap` down when the process is signalled, then exit
///
/// [`Packtap::load`] calls this unless `handle_signals` is off.
pub fn install(packtap: Packtap) -> JoinHandle<()> {
    tokio::spawn(async move {
        let signo = wait_for_signal().await;
        tracing::info!(signal = signo, "Signal received, shutting down");

        let report = packtap.shutdown().await;
        tracing::debug!(
            drained = report.drained,
            flushed = report.flushed_events,
            "Shutdown complete"
        );
        std::process::exit(exit_code(signo));
    })
}

/// Runs [`Packtap::shutdown_blocking`] when dropped
///
/// Hold one in `main` so a normal exit flushes what is still queued.
#[derive(Debug)]
#[must_use = "the guard shuts packtap down as soon as it is dropped"]
pub struct ExitGuard {
    packtap: Packtap,
}

impl ExitGuard {
    pub fn new(packtap: Packtap) -> Self {
        Self { packtap }
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let report = self.packtap.shutdown_blocking();
        tracing::debug!(
            drained = report.drained,
            flushed = report.flushed_events,
            "Exit flush complete"
        );
    }
}
