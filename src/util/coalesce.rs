//! Latest-only outbound snapshot slot
//!
//! Each connection gets one slot. The room publishes every tick; the connection's
//! writer takes whatever is newest when it is ready to send. A slow writer skips
//! intermediate snapshots instead of building a backlog, and never sees an older
//! snapshot after a newer one. This is only sound because snapshots are full state.

use tokio::sync::watch;

/// Producer half, owned by the room loop
#[derive(Debug)]
pub struct SnapshotPublisher<T> {
    tx: watch::Sender<Option<T>>,
}

/// Consumer half, owned by the connection writer
#[derive(Debug)]
pub struct SnapshotSubscriber<T> {
    rx: watch::Receiver<Option<T>>,
}

/// Create a connected publisher/subscriber pair with an empty slot
pub fn slot<T>() -> (SnapshotPublisher<T>, SnapshotSubscriber<T>) {
    let (tx, rx) = watch::channel(None);
    (SnapshotPublisher { tx }, SnapshotSubscriber { rx })
}

impl<T> SnapshotPublisher<T> {
    /// Overwrite the pending snapshot. Returns false once the subscriber is gone.
    pub fn publish(&self, value: T) -> bool {
        self.tx.send(Some(value)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T: Clone> SnapshotSubscriber<T> {
    /// Wait for a snapshot newer than the last one taken.
    ///
    /// Returns `None` once the publisher is dropped and nothing unseen remains.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(value) = self.rx.borrow_and_update().clone() {
                return Some(value);
            }
        }
    }

    /// Take the pending snapshot without waiting
    pub fn try_take(&mut self) -> Option<T> {
        if self.rx.has_changed().unwrap_or(false) {
            self.rx.borrow_and_update().clone()
        } else {
            None
        }
    }
}
