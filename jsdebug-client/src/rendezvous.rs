// One-shot rendezvous between a completing producer and a single blocked waiter
//
// Both halves are consumed by use, so a second signal or a second wait cannot
// be expressed. The signal carries the value the waiter is blocked on.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use tracing::debug;

/// Bounded wait used when the caller does not configure one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(120_000);

/// Producer half
#[derive(Debug)]
pub struct RendezvousSignal<T> {
    tx: mpsc::SyncSender<T>,
}

/// Consumer half
#[derive(Debug)]
pub struct RendezvousWaiter<T> {
    rx: mpsc::Receiver<T>,
}

/// Create a connected signal/waiter pair
pub fn rendezvous<T>() -> (RendezvousSignal<T>, RendezvousWaiter<T>) {
    let (tx, rx) = mpsc::sync_channel(1);
    (RendezvousSignal { tx }, RendezvousWaiter { rx })
}

impl<T> RendezvousSignal<T> {
    /// Release the waiter with `value`. Never blocks, and is harmless if the
    /// waiter already gave up.
    pub fn signal(self, value: T) {
        self.tx.try_send(value).ok();
    }
}

impl<T> RendezvousWaiter<T> {
    /// Block for at most [`DEFAULT_TIMEOUT`]
    pub fn wait_default(self) -> Option<T> {
        self.wait(DEFAULT_TIMEOUT)
    }

    /// Block until signalled or until `timeout` elapses. Returns the signalled
    /// value, or `None` on timeout.
    ///
    /// A signal half dropped without firing can never fire, so that also
    /// returns `None`, without waiting out the timeout.
    pub fn wait(self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout) => {
                debug!("Rendezvous timed out after {:?}", timeout);
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Rendezvous signal dropped without firing");
                None
            }
        }
    }
}
