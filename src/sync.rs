//! Cancellation and one-shot signalling primitives.
//!
//! Blocking operations in this crate wait on condition variables. To make
//! those waits cancellable without polling, a [`CancelToken`] lets a waiter
//! register a notifier that is invoked exactly when the token is cancelled;
//! the notifier takes the waiter's lock and broadcasts its condvar, so a
//! sleeping waiter wakes promptly and observes the cancellation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::types::errors::IpCacheError;

//------------ CancelToken ---------------------------------------------------

type Notifier = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    notifiers: Mutex<Vec<(u64, Notifier)>>,
}

/// A cancellation token shared between a blocking operation and whoever
/// may want to abort it.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Cancels the token and runs every registered notifier.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let notifiers = self.inner.notifiers.lock();
        for (_, notify) in notifiers.iter() {
            notify();
        }
    }

    /// Registers a notifier to run on cancellation. The caller must check
    /// `is_cancelled` under its own lock after subscribing; a token that
    /// was cancelled before the subscription will not invoke the notifier.
    pub fn subscribe(&self, notify: Notifier) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.notifiers.lock().push((id, notify));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.notifiers.lock().retain(|(i, _)| *i != id);
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

//------------ Signal (shared one-shot flag) ---------------------------------

#[derive(Default)]
struct SignalInner {
    set: Mutex<bool>,
    cv: Condvar,
}

impl SignalInner {
    fn raise(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.cv.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.set.lock()
    }

    fn wait(
        inner: &Arc<SignalInner>,
        cancel: &CancelToken,
    ) -> Result<(), IpCacheError> {
        let notifier = {
            let inner = inner.clone();
            cancel.subscribe(Box::new(move || {
                let guard = inner.set.lock();
                drop(guard);
                inner.cv.notify_all();
            }))
        };
        let mut set = inner.set.lock();
        let result = loop {
            if *set {
                break Ok(());
            }
            if cancel.is_cancelled() {
                break Err(IpCacheError::Cancelled);
            }
            inner.cv.wait(&mut set);
        };
        drop(set);
        cancel.unsubscribe(notifier);
        result
    }
}

//------------ CacheStatus ---------------------------------------------------

/// One-shot signal that the external caches feeding the metadata layer
/// have synchronized. The injector blocks on this before its first run.
#[derive(Clone, Default)]
pub struct CacheStatus {
    inner: Arc<SignalInner>,
}

impl CacheStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the caches as synchronized and wakes all waiters.
    pub fn signal(&self) {
        self.inner.raise();
    }

    pub fn is_synchronized(&self) -> bool {
        self.inner.is_set()
    }

    /// Blocks until the caches are synchronized or `cancel` fires.
    pub fn wait(&self, cancel: &CancelToken) -> Result<(), IpCacheError> {
        SignalInner::wait(&self.inner, cancel)
    }
}

impl std::fmt::Debug for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CacheStatus")
            .field("synchronized", &self.is_synchronized())
            .finish()
    }
}

//------------ DoneSignal ----------------------------------------------------

/// Completion signal handed back by the identity updater. The injector
/// waits on it before touching the datapath, so policy selectors always
/// learn about an identity before traffic can be mapped to it.
#[derive(Clone, Default)]
pub struct DoneSignal {
    inner: Arc<SignalInner>,
}

impl DoneSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that is already complete. Useful for updaters that apply
    /// synchronously.
    pub fn completed() -> Self {
        let signal = Self::new();
        signal.complete();
        signal
    }

    pub fn complete(&self) {
        self.inner.raise();
    }

    pub fn is_complete(&self) -> bool {
        self.inner.is_set()
    }

    pub fn wait(&self, cancel: &CancelToken) -> Result<(), IpCacheError> {
        SignalInner::wait(&self.inner, cancel)
    }
}

impl std::fmt::Debug for DoneSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DoneSignal")
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_wait_observes_signal() {
        let status = CacheStatus::new();
        let waiter = status.clone();
        let handle = std::thread::spawn(move || {
            waiter.wait(&CancelToken::new())
        });
        std::thread::sleep(Duration::from_millis(10));
        status.signal();
        assert_eq!(handle.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let status = CacheStatus::new();
        let cancel = CancelToken::new();
        let (waiter, token) = (status.clone(), cancel.clone());
        let handle = std::thread::spawn(move || waiter.wait(&token));
        std::thread::sleep(Duration::from_millis(10));
        cancel.cancel();
        assert_eq!(handle.join().unwrap(), Err(IpCacheError::Cancelled));
    }

    #[test]
    fn test_wait_on_cancelled_token_returns_immediately() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let status = CacheStatus::new();
        assert_eq!(status.wait(&cancel), Err(IpCacheError::Cancelled));
    }
}
