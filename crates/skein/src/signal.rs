use std::sync::{Arc, OnceLock};

use tokio::sync::watch;

use crate::SessionError;

/// A cloneable one-shot signal. Fires at most once; waiting after the fact
/// resolves immediately.
#[derive(Clone)]
pub(crate) struct Flag {
    tx: Arc<watch::Sender<bool>>,
}

impl Flag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so wait_for cannot fail while we wait.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// The session's one-shot error slot.
///
/// The first caller of [`latch`](ErrorCell::latch) wins; later latches are
/// no-ops. The error value is published before the done flag fires, and
/// [`get`](ErrorCell::get) is gated on the flag, so observers that woke up
/// from the flag always see the error, and observers polling earlier see
/// none.
pub(crate) struct ErrorCell {
    err: OnceLock<SessionError>,
    done: Flag,
}

impl ErrorCell {
    pub fn new() -> Self {
        Self {
            err: OnceLock::new(),
            done: Flag::new(),
        }
    }

    pub fn latch(&self, err: SessionError) {
        let _ = self.err.set(err);
        self.done.fire();
    }

    pub fn get(&self) -> Option<SessionError> {
        if self.done.is_fired() {
            self.err.get().cloned()
        } else {
            None
        }
    }

    pub fn done_flag(&self) -> Flag {
        self.done.clone()
    }
}
