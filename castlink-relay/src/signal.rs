//! Change-notifying values.
//!
//! Everything reactive in the relay is a `tokio::sync::watch` channel:
//!
//! ```text
//!  Registry add/remove ─┐
//!  peer link changes ───┼──► Invalidation (u64 counter) ──► computed(view) ──► RpcEngine
//!  inbound state ───────┘                                        │
//!                                                                └──► SerialDerivation
//! ```
//!
//! An [`Invalidation`] is a bare version counter bumped by anything that
//! changes shared state. [`computed`] re-evaluates a closure after every bump
//! and republishes only when the result differs, so subscribers never see
//! spurious wake-ups.

use std::sync::Arc;
use tokio::sync::watch;

/// A value cell whose changes can be observed.
pub struct Signal<T> {
    tx: watch::Sender<T>,
}

impl<T> Signal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        let (tx, _) = watch::channel(value);
        Self { tx }
    }

    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Store `value`; returns whether it differed from the previous one.
    pub fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current != value {
                *current = value;
                true
            } else {
                false
            }
        })
    }

    /// Mutate in place; `f` returns whether anything changed.
    pub fn modify(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Default + Clone + PartialEq + Send + Sync + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Shared change counter.
///
/// Cloning yields a handle to the same counter.
#[derive(Clone)]
pub struct Invalidation {
    tx: Arc<watch::Sender<u64>>,
}

impl Invalidation {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Notify every subscriber that shared state changed.
    pub fn bump(&self) {
        self.tx.send_modify(|version| *version = version.wrapping_add(1));
    }

    pub fn version(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for Invalidation {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive a value from shared state, recomputed on every change notification.
///
/// The background task ends once every receiver is dropped or the change
/// source goes away.
pub fn computed<T, F>(changes: watch::Receiver<u64>, compute: F) -> watch::Receiver<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: Fn() -> T + Send + 'static,
{
    let (tx, rx) = watch::channel(compute());
    tokio::spawn(publish(changes, tx, compute));
    rx
}

/// Feed an existing sender from `compute`, as [`computed`] does.
pub async fn publish<T, F>(mut changes: watch::Receiver<u64>, tx: watch::Sender<T>, compute: F)
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: Fn() -> T + Send + 'static,
{
    changes.mark_changed();
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = compute();
                tx.send_if_modified(|current| {
                    if *current != next {
                        *current = next;
                        true
                    } else {
                        false
                    }
                });
            }
            _ = tx.closed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::time::{timeout, Duration};

    #[test]
    fn test_signal_set_reports_changes() {
        let signal = Signal::new(1);
        let rx = signal.subscribe();
        assert!(!signal.set(1));
        assert!(!rx.has_changed().unwrap());
        assert!(signal.set(2));
        assert!(rx.has_changed().unwrap());
        assert_eq!(signal.get(), 2);
    }

    #[test]
    fn test_invalidation_bump_without_subscribers() {
        let changes = Invalidation::new();
        changes.bump();
        changes.bump();
        assert_eq!(changes.version(), 2);
        let handle = changes.clone();
        handle.bump();
        assert_eq!(changes.version(), 3);
    }

    #[tokio::test]
    async fn test_computed_tracks_shared_state() {
        let changes = Invalidation::new();
        let shared = Arc::new(Mutex::new(0));
        let source = shared.clone();
        let mut view = computed(changes.subscribe(), move || *source.lock() * 10);
        assert_eq!(*view.borrow(), 0);

        *shared.lock() = 4;
        changes.bump();
        timeout(Duration::from_secs(1), view.changed()).await.unwrap().unwrap();
        assert_eq!(*view.borrow_and_update(), 40);
    }

    #[tokio::test]
    async fn test_computed_suppresses_identical_values() {
        let changes = Invalidation::new();
        let mut view = computed(changes.subscribe(), || "constant");
        changes.bump();
        changes.bump();
        let waited = timeout(Duration::from_millis(50), view.changed()).await;
        assert!(waited.is_err(), "no change should be published");
    }
}
