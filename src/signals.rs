//! SIGINT/SIGTERM handling for a foreground coordinator.
//!
//! A signal does not interrupt anything directly. A dedicated thread waits
//! for it on a current-thread tokio runtime and sends the shutdown sentinel
//! to the coordinator's own control socket, which runs the normal drain,
//! aggregation, and cleanup. Later signals are logged and ignored while that
//! drain is in progress.

use std::io;
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use crate::protocol::ControlClient;

/// Install the handlers and start the forwarding thread.
///
/// The handlers are registered before this returns, so any later signal
/// takes the drain path instead of the default action.
///
/// # Errors
/// Returns an error if the runtime, the handlers, or the thread cannot be
/// created.
pub fn forward_to_shutdown(client: ControlClient) -> io::Result<JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let mut signals = {
        let _context = runtime.enter();
        ShutdownSignals::install()?
    };
    thread::Builder::new()
        .name("signal-forwarder".to_owned())
        .spawn(move || {
            let mut forwarded = false;
            while let Some(name) = runtime.block_on(signals.next()) {
                if forwarded {
                    warn!(signal = name, "drain already in progress, signal ignored");
                    continue;
                }
                forwarded = true;
                info!(signal = name, "signal received, requesting drain");
                if let Err(e) = client.send_shutdown() {
                    error!(signal = name, error = %e, "could not request drain");
                }
            }
            warn!("signal handling stopped");
        })
}

#[cfg(unix)]
struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn install() -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn next(&mut self) -> Option<&'static str> {
        tokio::select! {
            received = self.interrupt.recv() => received.map(|()| "SIGINT"),
            received = self.terminate.recv() => received.map(|()| "SIGTERM"),
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    #[allow(clippy::unnecessary_wraps)]
    const fn install() -> io::Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> Option<&'static str> {
        tokio::signal::ctrl_c().await.ok().map(|()| "ctrl-c")
    }
}
