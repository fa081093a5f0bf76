//! External shutdown signal for the reactor loop.

use mio::Waker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Cloneable handle that asks a reactor to stop.
///
/// The reactor checks the flag once per cycle. When a waker is attached,
/// triggering also interrupts a blocked poll.
#[derive(Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    waker: Option<Arc<Waker>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_waker(waker: Option<Arc<Waker>>) -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            waker,
        }
    }

    /// Request shutdown.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Some(waker) = &self.waker {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake reactor");
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Trigger on the first SIGINT or SIGTERM.
    ///
    /// Installs the handlers and waits for them on a background thread.
    #[cfg(unix)]
    pub fn trigger_on_signals(&self) -> std::io::Result<()> {
        use signal_hook::consts::signal::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let shutdown = self.clone();
        std::thread::Builder::new()
            .name("muxline-signals".into())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    tracing::info!(signal, "Shutdown signal received");
                    shutdown.trigger();
                }
            })?;
        Ok(())
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("requested", &self.is_triggered())
            .field("waker", &self.waker.is_some())
            .finish()
    }
}
