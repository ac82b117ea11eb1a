//! Live query subscriptions.
//!
//! A subscription is an initial snapshot plus a stream of later snapshots.
//! Dropping or cancelling it unregisters the watch in the store that issued
//! it, so the store stops computing snapshots nobody reads.

use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use groundsync_common::Result;

type CancelFn = Box<dyn FnOnce() + Send + Sync>;

/// Initial value plus a cancellable stream of subsequent values.
pub struct Subscription<T> {
    initial: T,
    receiver: mpsc::UnboundedReceiver<T>,
    cancel: Option<CancelFn>,
}

impl<T> Subscription<T> {
    /// Snapshot taken when the subscription was created.
    pub fn initial(&self) -> &T {
        &self.initial
    }

    /// Wait for the next snapshot. Returns `None` once the store is gone.
    pub async fn next(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Return the next snapshot if one is already queued.
    pub fn try_next(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Stop receiving updates and release the underlying watch.
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.receiver.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: Unpin> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

struct Watcher<Q, T> {
    query: Q,
    sender: mpsc::UnboundedSender<T>,
}

/// Registered watches of one query kind.
///
/// `Q` describes what a watcher is interested in (a project id, or `()` for
/// whole-table watches); `T` is the snapshot type sent to it.
pub struct WatchRegistry<Q, T> {
    next_id: AtomicU64,
    watchers: Mutex<HashMap<u64, Watcher<Q, T>>>,
}

impl<Q, T> WatchRegistry<Q, T>
where
    Q: Send + 'static,
    T: Send + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    /// Register a watcher and hand back its subscription.
    ///
    /// Callers must compute `initial` and register under the same lock that
    /// guards writes, otherwise a write between the two would be missed.
    pub fn subscribe(self: &Arc<Self>, query: Q, initial: T) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();

        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Watcher { query, sender });
        debug!("Registered watch {}", id);

        let registry = Arc::downgrade(self);
        let cancel: CancelFn = Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.unsubscribe(id);
            }
        });

        Subscription {
            initial,
            receiver,
            cancel: Some(cancel),
        }
    }

    fn unsubscribe(&self, id: u64) {
        if self
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
        {
            debug!("Released watch {}", id);
        }
    }

    /// Number of live watchers.
    pub fn len(&self) -> usize {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push a fresh snapshot to every watcher.
    ///
    /// Watchers whose receiver has gone away are dropped. A snapshot query
    /// that fails is logged and the watcher kept for the next write.
    pub fn notify<F>(&self, mut snapshot: F)
    where
        F: FnMut(&Q) -> Result<T>,
    {
        let mut watchers = self
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        watchers.retain(|id, watcher| {
            if watcher.sender.is_closed() {
                return false;
            }
            match snapshot(&watcher.query) {
                Ok(value) => watcher.sender.send(value).is_ok(),
                Err(e) => {
                    warn!("Failed to refresh watch {}: {}", id, e);
                    true
                }
            }
        });
    }
}
