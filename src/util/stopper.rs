//! A thread-safe stop flag. Long-running work (a sync run, a transfer, an
//! extraction loop) checks it between steps, and timed waits wake up as soon as
//! it's set instead of sleeping through the whole delay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};

pub struct Stopper {
    stopped: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl Stopper {
    /// Create a new (running) stopper
    pub fn new() -> Stopper {
        let (wake_tx, wake_rx) = channel::bounded(1);
        Stopper {
            stopped: AtomicBool::new(false),
            wake_tx,
            wake_rx,
        }
    }

    /// Flag a stop and wake anyone waiting on us
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(());
    }

    /// Clear the flag (and any pending wakeup) so the stopper can be reused
    pub fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        while self.wake_rx.try_recv().is_ok() {}
    }

    /// Check if we've been stopped
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Wait for the given duration, or until stopped. Returns true if the wait
    /// ran its full course.
    pub fn wait(&self, duration: Duration) -> bool {
        if self.stopped() { return false; }
        if duration == Duration::from_secs(0) { return true; }
        crossbeam::channel::select! {
            recv(self.wake_rx) -> _ => {
                // put the wakeup back for any other waiter
                let _ = self.wake_tx.try_send(());
                false
            }
            recv(channel::after(duration)) -> _ => !self.stopped(),
        }
    }
}
