//! Publish/subscribe primitive
//!
//! An `Observable` holds the current snapshot of some value and a list of
//! listeners. Publishing a value equal to the current one is a no-op, so
//! observers only ever see changes. Listeners run synchronously, in
//! registration order, outside the internal lock (a listener may publish).
//!
//! Async consumers can take a `tokio::sync::watch` receiver instead; disposing
//! the observable closes it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner<T> {
    value: T,
    listeners: Vec<(u64, Listener<T>)>,
    next_id: u64,
    watch_tx: Option<watch::Sender<T>>,
    disposed: bool,
}

impl<T> Inner<T> {
    fn is_live(&self, id: u64) -> bool {
        !self.disposed && self.listeners.iter().any(|(lid, _)| *lid == id)
    }
}

pub struct Observable<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Observable<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(initial: T) -> Self {
        let (watch_tx, _) = watch::channel(initial.clone());
        Self {
            inner: Arc::new(Mutex::new(Inner {
                value: initial,
                listeners: Vec::new(),
                next_id: 0,
                watch_tx: Some(watch_tx),
                disposed: false,
            })),
        }
    }

    /// Current snapshot.
    pub fn get(&self) -> T {
        lock(&self.inner).value.clone()
    }

    /// Replace the value. Returns true if it changed and was delivered.
    pub fn publish(&self, value: T) -> bool {
        self.update(|current| *current = value)
    }

    /// Mutate the value in place; observers are notified only on change.
    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool {
        let (snapshot, listeners) = {
            let mut inner = lock(&self.inner);
            if inner.disposed {
                return false;
            }
            let mut next = inner.value.clone();
            f(&mut next);
            if next == inner.value {
                return false;
            }
            inner.value = next.clone();
            if let Some(tx) = &inner.watch_tx {
                tx.send_replace(next.clone());
            }
            let listeners: Vec<(u64, Listener<T>)> = inner.listeners.clone();
            (next, listeners)
        };

        for (id, listener) in listeners {
            // Skip listeners removed (or a dispose) while earlier ones ran.
            if !lock(&self.inner).is_live(id) {
                continue;
            }
            listener(&snapshot);
        }
        true
    }

    /// Register a listener. It is not called with the current value; use
    /// `get` for that. Dropping the returned `Subscription` unsubscribes.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let mut inner = lock(&self.inner);
        if inner.disposed {
            return Subscription::detached();
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let listener: Listener<T> = Arc::new(listener);
        inner.listeners.push((id, listener));

        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner).listeners.retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Async view of the value. Closed once the observable is disposed.
    pub fn watch(&self) -> watch::Receiver<T> {
        let inner = lock(&self.inner);
        match &inner.watch_tx {
            Some(tx) => tx.subscribe(),
            None => {
                // Already disposed: hand out a receiver whose sender is gone.
                let (_, rx) = watch::channel(inner.value.clone());
                rx
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    /// Drop every listener and close watch receivers. Idempotent.
    pub fn dispose(&self) {
        let mut inner = lock(&self.inner);
        inner.disposed = true;
        inner.listeners.clear();
        inner.watch_tx = None;
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.inner).disposed
    }
}

/// Handle returned by `Observable::subscribe`.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn detached() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&i32) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        let make = move |name: &str| -> Box<dyn Fn(&i32) + Send + Sync> {
            let log = Arc::clone(&log2);
            let name = name.to_string();
            Box::new(move |v: &i32| lock(&log).push(format!("{}:{}", name, v)))
        };
        (log, make)
    }

    #[test]
    fn test_delivers_in_registration_order() {
        let obs = Observable::new(0);
        let (log, make) = recorder();
        let a = make("a");
        let b = make("b");
        let _s1 = obs.subscribe(move |v| a(v));
        let _s2 = obs.subscribe(move |v| b(v));

        assert!(obs.publish(1));
        assert_eq!(*lock(&log), vec!["a:1", "b:1"]);
    }

    #[test]
    fn test_equal_values_are_deduplicated() {
        let obs = Observable::new(5);
        let (log, make) = recorder();
        let a = make("a");
        let _s = obs.subscribe(move |v| a(v));

        assert!(!obs.publish(5));
        assert!(obs.publish(6));
        assert!(!obs.publish(6));
        assert_eq!(lock(&log).len(), 1);
    }

    #[test]
    fn test_unsubscribe_and_drop_stop_delivery() {
        let obs = Observable::new(0);
        let (log, make) = recorder();
        let a = make("a");
        let b = make("b");
        let s1 = obs.subscribe(move |v| a(v));
        {
            let _s2 = obs.subscribe(move |v| b(v));
        }
        assert_eq!(obs.listener_count(), 1);

        s1.unsubscribe();
        obs.publish(1);
        assert!(lock(&log).is_empty());
    }

    #[test]
    fn test_no_delivery_after_dispose() {
        let obs = Observable::new(0);
        let (log, make) = recorder();
        let a = make("a");
        let _s = obs.subscribe(move |v| a(v));

        obs.dispose();
        assert!(!obs.publish(1));
        assert_eq!(obs.get(), 0);
        assert!(lock(&log).is_empty());

        let late = obs.subscribe(|_| {});
        assert_eq!(obs.listener_count(), 0);
        drop(late);
    }

    #[test]
    fn test_listener_can_publish_reentrantly() {
        let obs = Observable::new(0);
        let obs2 = obs.clone();
        let _s = obs.subscribe(move |v| {
            if *v < 3 {
                obs2.publish(v + 1);
            }
        });
        obs.publish(1);
        assert_eq!(obs.get(), 3);
    }

    #[test]
    fn test_listener_removed_mid_delivery_is_skipped() {
        let obs = Observable::new(0);
        let (log, make) = recorder();
        let b = make("b");
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let victim2 = Arc::clone(&victim);
        let _first = obs.subscribe(move |_| {
            if let Some(s) = lock(&victim2).take() {
                s.unsubscribe();
            }
        });
        *lock(&victim) = Some(obs.subscribe(move |v| b(v)));

        obs.publish(1);
        assert!(lock(&log).is_empty());
    }

    #[tokio::test]
    async fn test_watch_sees_updates_and_closes_on_dispose() {
        let obs = Observable::new(0);
        let mut rx = obs.watch();
        obs.publish(7);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 7);

        obs.dispose();
        assert!(rx.changed().await.is_err());
    }
}
