//! Shared background-poller plumbing.
//!
//! The remote sampler, the remote throttler, and the remote baggage
//! restriction manager all run the same loop: tick on an interval, do one
//! unit of work, exit promptly when told to. [`Poller`] owns that loop on a
//! dedicated thread.

use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Handle to a background polling thread.
///
/// Dropping the handle without calling [`Poller::shutdown`] leaves the thread
/// running until the process exits; owners call `shutdown` from their own
/// `close` paths.
#[derive(Debug)]
pub(crate) struct Poller {
    shutdown_tx: SyncSender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// Spawn a thread named `name` that invokes `tick` every `interval`
    /// until shut down.
    pub(crate) fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::sync_channel::<()>(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .ok();
        Poller {
            shutdown_tx,
            handle,
        }
    }

    /// Stop the loop and wait for the thread to exit.
    pub(crate) fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn poller_ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let mut poller = Poller::spawn("test.poller", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        thread::sleep(Duration::from_millis(100));
        poller.shutdown();
        let after_shutdown = ticks.load(Ordering::Relaxed);
        assert!(after_shutdown >= 1);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::Relaxed), after_shutdown);
    }

    #[test]
    fn shutdown_is_prompt() {
        let mut poller = Poller::spawn("test.slow", Duration::from_secs(3600), || {});
        let start = std::time::Instant::now();
        poller.shutdown();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
