//! Cooperative stop signal for worker loops.

use std::cell::Cell;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// Receiving end of a stop request.
///
/// Triggered by a message on the channel or by every sender being dropped.
/// Once triggered it stays triggered.
#[derive(Debug)]
pub struct ShutdownSignal {
    rx: Receiver<()>,
    triggered: Cell<bool>,
}

/// Sending end of a [`ShutdownSignal`].
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Sender<()>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

/// Create a linked trigger/signal pair.
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = mpsc::channel();
    (ShutdownTrigger { tx }, ShutdownSignal::new(rx))
}

impl ShutdownSignal {
    pub fn new(rx: Receiver<()>) -> Self {
        Self {
            rx,
            triggered: Cell::new(false),
        }
    }

    /// Non-blocking check.
    pub fn is_triggered(&self) -> bool {
        if self.triggered.get() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                self.triggered.set(true);
                true
            }
            Err(TryRecvError::Empty) => false,
        }
    }

    /// Sleep for up to `timeout`, returning early (with `true`) on shutdown.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.triggered.get() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                self.triggered.set(true);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn trigger_latches() {
        let (trigger, signal) = channel();
        assert!(!signal.is_triggered());
        trigger.trigger();
        assert!(signal.is_triggered());
        assert!(signal.is_triggered());
    }

    #[test]
    fn dropping_every_trigger_counts_as_shutdown() {
        let (trigger, signal) = channel();
        drop(trigger);
        assert!(signal.is_triggered());
    }

    #[test]
    fn wait_returns_early_on_trigger() {
        let (trigger, signal) = channel();
        trigger.trigger();
        let start = Instant::now();
        assert!(signal.wait(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));

        let (_trigger, idle) = channel();
        assert!(!idle.wait(Duration::from_millis(5)));
    }
}
