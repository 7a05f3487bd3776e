//! One-directional result stream with an idempotent, race-free close.
//!
//! Several failure paths of a scrape batch may try to finish the stream at the
//! same time. `SafeChannel::close` can be called any number of times from any
//! task; `send` after close is a no-op that reports `false` instead of faulting.

use futures::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

struct Shared<T> {
    tx: Mutex<Option<mpsc::Sender<T>>>,
}

/// Producer half. Cheap to clone; all clones share one closed flag.
pub struct SafeChannel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SafeChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Consumer half. Yields `None` once the producer side is closed and drained.
pub struct SafeReceiver<T> {
    rx: mpsc::Receiver<T>,
}

impl<T: Send> SafeChannel<T> {
    /// Capacity 1: a producer waits on `send` until the consumer reads.
    pub fn new() -> (Self, SafeReceiver<T>) {
        Self::with_capacity(1)
    }

    pub fn with_capacity(capacity: usize) -> (Self, SafeReceiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                shared: Arc::new(Shared {
                    tx: Mutex::new(Some(tx)),
                }),
            },
            SafeReceiver { rx },
        )
    }

    /// Returns `false` if the channel was closed or the receiver is gone.
    pub async fn send(&self, item: T) -> bool {
        // Clone under the lock, await outside it.
        let tx = match self.shared.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match tx {
            Some(tx) => tx.send(item).await.is_ok(),
            None => false,
        }
    }

    /// Idempotent. Items already handed to `send` are still delivered.
    pub fn close(&self) {
        let mut guard = match self.shared.tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take();
    }

    pub fn is_closed(&self) -> bool {
        match self.shared.tx.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl<T> SafeReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Drains the stream to completion.
    pub async fn collect_all(mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(item) = self.rx.recv().await {
            out.push(item);
        }
        out
    }
}

impl<T> Stream for SafeReceiver<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}
