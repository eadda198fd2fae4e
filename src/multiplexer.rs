//! At most one watch per key, fanned out to a per-key listener.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::Result;

/// A raw signal received from a watch.
#[derive(Clone, Debug, PartialEq)]
pub enum Signal<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// Anything else the remote reports, dropped on dispatch.
    Error(String),
}

/// Callbacks for changes of a watched value.
///
/// Called on the subscription's task without any lock held, so listeners may
/// call back into the object that registered them.
pub trait Listener<T>: Send + Sync {
    fn added(&self, _value: &T) {}

    fn removed(&self, _value: &T) {}

    fn modified(&self, _value: &T) {}
}

/// Handed to the open function of [`WatchMultiplexer::watch`], routes signals
/// to the listener of that key.
pub struct EventSink<T> {
    listener: Arc<dyn Listener<T>>,
}

impl<T> Clone for EventSink<T> {
    fn clone(&self) -> Self {
        EventSink {
            listener: Arc::clone(&self.listener),
        }
    }
}

impl<T> EventSink<T> {
    pub fn new(listener: Arc<dyn Listener<T>>) -> Self {
        EventSink { listener }
    }

    pub fn send(&self, signal: Signal<T>) {
        match signal {
            Signal::Added(value) => self.listener.added(&value),
            Signal::Deleted(value) => self.listener.removed(&value),
            Signal::Modified(value) => self.listener.modified(&value),
            Signal::Error(err) => debug!(message = "dropped watch signal", %err),
        }
    }
}

/// An open watch.
pub trait Subscription: Send {
    fn close(self: Box<Self>) -> Result<()>;
}

/// A watch pumped by its own tokio task, closing aborts the task.
pub struct TaskSubscription(JoinHandle<()>);

impl TaskSubscription {
    /// Spawn a task delivering every signal of `stream` to `sink`.
    pub fn spawn<T>(mut stream: BoxStream<'static, Signal<T>>, sink: EventSink<T>) -> Self
    where
        T: Send + 'static,
    {
        let handle = tokio::spawn(async move {
            while let Some(signal) = stream.next().await {
                sink.send(signal);
            }

            debug!(message = "watch stream finished");
        });

        TaskSubscription(handle)
    }
}

impl Subscription for TaskSubscription {
    fn close(self: Box<Self>) -> Result<()> {
        self.0.abort();
        Ok(())
    }
}

enum Slot {
    /// The open function is in flight, tagged to detect a stop/start racing it.
    Opening(u64),
    Active(Box<dyn Subscription>),
}

pub struct WatchMultiplexer<K, T> {
    slots: Mutex<HashMap<K, Slot>>,
    next_id: AtomicU64,
    _value: PhantomData<fn(T)>,
}

impl<K, T> Default for WatchMultiplexer<K, T> {
    fn default() -> Self {
        WatchMultiplexer {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            _value: PhantomData,
        }
    }
}

/// Frees an `Opening` slot if the open future is dropped before completing.
struct OpeningGuard<'a, K: Eq + Hash> {
    slots: &'a Mutex<HashMap<K, Slot>>,
    key: Option<K>,
    id: u64,
}

impl<K: Eq + Hash> OpeningGuard<'_, K> {
    fn disarm(&mut self) {
        self.key = None;
    }
}

impl<K: Eq + Hash> Drop for OpeningGuard<'_, K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut slots = self.slots.lock();
            if matches!(slots.get(&key), Some(Slot::Opening(id)) if *id == self.id) {
                slots.remove(&key);
            }
        }
    }
}

impl<K, T> WatchMultiplexer<K, T>
where
    K: Clone + Debug + Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching `key` unless it is already watched.
    ///
    /// `open` receives the sink signals must be sent to and returns the
    /// subscription, or `None` if there is nothing to watch. Returns whether
    /// a new subscription was recorded. Errors of `open` are returned as is
    /// and leave nothing behind.
    pub async fn watch<F, Fut>(&self, key: K, open: F, listener: Arc<dyn Listener<T>>) -> Result<bool>
    where
        F: FnOnce(EventSink<T>) -> Fut,
        Fut: Future<Output = Result<Option<Box<dyn Subscription>>>>,
    {
        let id = {
            let mut slots = self.slots.lock();
            if slots.contains_key(&key) {
                debug!(message = "already watching", ?key);
                return Ok(false);
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            slots.insert(key.clone(), Slot::Opening(id));
            id
        };

        let mut guard = OpeningGuard {
            slots: &self.slots,
            key: Some(key.clone()),
            id,
        };

        let result = open(EventSink::new(listener)).await;

        guard.disarm();
        let mut slots = self.slots.lock();
        let ours = matches!(slots.get(&key), Some(Slot::Opening(current)) if *current == id);

        match result {
            Ok(Some(subscription)) if ours => {
                debug!(message = "watch started", ?key);
                slots.insert(key, Slot::Active(subscription));
                Ok(true)
            }
            Ok(Some(subscription)) => {
                drop(slots);

                debug!(message = "watch stopped while opening", ?key);
                close(&key, subscription);
                Ok(false)
            }
            other => {
                if ours {
                    slots.remove(&key);
                }

                other.map(|_| false)
            }
        }
    }

    /// Stop the watch of `key`, returns whether there was one.
    ///
    /// Failures to close are logged, the key is removed regardless.
    pub fn stop_watch(&self, key: &K) -> bool {
        let slot = self.slots.lock().remove(key);

        match slot {
            Some(Slot::Active(subscription)) => {
                close(key, subscription);
                true
            }
            // the opener notices the slot is gone and closes what it opened
            Some(Slot::Opening(_)) => true,
            None => false,
        }
    }

    /// Stop every key in `keys`, never stopping early.
    pub fn stop_watch_all<'a>(&self, keys: impl IntoIterator<Item = &'a K>)
    where
        K: 'a,
    {
        for key in keys {
            self.stop_watch(key);
        }
    }

    /// Keys with an active subscription.
    pub fn watched_keys(&self) -> Vec<K> {
        self.slots
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Active(_)))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn is_watching(&self, key: &K) -> bool {
        matches!(self.slots.lock().get(key), Some(Slot::Active(_)))
    }

    /// Stop every subscription. The multiplexer can be used again afterwards.
    pub fn close(&self) {
        let slots = std::mem::take(&mut *self.slots.lock());

        for (key, slot) in slots {
            if let Slot::Active(subscription) = slot {
                close(&key, subscription);
            }
        }
    }
}

fn close<K: Debug>(key: &K, subscription: Box<dyn Subscription>) {
    match subscription.close() {
        Ok(()) => debug!(message = "watch stopped", ?key),
        Err(err) => warn!(message = "close watch failed", ?key, %err),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::stream;
    use tokio::sync::mpsc;

    use super::*;
    use crate::Error;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Listener<String> for Recorder {
        fn added(&self, value: &String) {
            self.events.lock().push(format!("added {value}"));
        }

        fn removed(&self, value: &String) {
            self.events.lock().push(format!("removed {value}"));
        }

        fn modified(&self, value: &String) {
            self.events.lock().push(format!("modified {value}"));
        }
    }

    struct Counted {
        closed: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Subscription for Counted {
        fn close(self: Box<Self>) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::transport(None, "close failed"));
            }

            Ok(())
        }
    }

    fn counted(closed: &Arc<AtomicUsize>, fail: bool) -> Option<Box<dyn Subscription>> {
        Some(Box::new(Counted {
            closed: Arc::clone(closed),
            fail,
        }))
    }

    #[tokio::test]
    async fn watch_is_idempotent() {
        let mux = WatchMultiplexer::<&str, String>::new();
        let closed = Arc::new(AtomicUsize::new(0));
        let opened = AtomicUsize::new(0);
        let listener = Arc::new(Recorder::default());

        for _ in 0..2 {
            mux.watch(
                "a",
                |_sink| async {
                    opened.fetch_add(1, Ordering::SeqCst);
                    Ok(counted(&closed, false))
                },
                listener.clone(),
            )
            .await
            .unwrap();
        }

        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(mux.watched_keys(), vec!["a"]);

        assert!(mux.stop_watch(&"a"));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        // stopping again is a no-op
        assert!(!mux.stop_watch(&"a"));
        assert!(mux.watched_keys().is_empty());
    }

    #[tokio::test]
    async fn open_failure_records_nothing() {
        let mux = WatchMultiplexer::<&str, String>::new();
        let listener = Arc::new(Recorder::default());

        let result = mux
            .watch(
                "a",
                |_sink| async { Err(Error::transport(Some(500), "boom")) },
                listener.clone(),
            )
            .await;
        assert!(result.is_err());
        assert!(!mux.is_watching(&"a"));

        // the key is free again
        let closed = Arc::new(AtomicUsize::new(0));
        let started = mux
            .watch("a", |_sink| async { Ok(counted(&closed, false)) }, listener)
            .await
            .unwrap();
        assert!(started);
    }

    #[tokio::test]
    async fn stop_all_continues_after_failure() {
        let mux = WatchMultiplexer::<&str, String>::new();
        let closed = Arc::new(AtomicUsize::new(0));
        let listener = Arc::new(Recorder::default());

        for (key, fail) in [("a", false), ("b", true), ("c", false)] {
            mux.watch(key, |_sink| async { Ok(counted(&closed, fail)) }, listener.clone())
                .await
                .unwrap();
        }

        mux.stop_watch_all(&["a", "b", "c"]);

        assert_eq!(closed.load(Ordering::SeqCst), 3);
        assert!(mux.watched_keys().is_empty());
    }

    #[tokio::test]
    async fn close_and_reuse() {
        let mux = WatchMultiplexer::<&str, String>::new();
        let closed = Arc::new(AtomicUsize::new(0));
        let listener = Arc::new(Recorder::default());

        for key in ["a", "b"] {
            mux.watch(key, |_sink| async { Ok(counted(&closed, false)) }, listener.clone())
                .await
                .unwrap();
        }

        mux.close();
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert!(mux.watched_keys().is_empty());

        assert!(
            mux.watch("a", |_sink| async { Ok(counted(&closed, false)) }, listener)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn dispatch() {
        let mux = WatchMultiplexer::<&str, String>::new();
        let listener = Arc::new(Recorder::default());
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let signals = vec![
            Signal::Added("a1".to_string()),
            Signal::Modified("a2".to_string()),
            Signal::Error("expired".to_string()),
            Signal::Deleted("a2".to_string()),
        ];

        mux.watch(
            "a",
            |sink| async move {
                let stream = stream::iter(signals)
                    .chain(stream::once(async move {
                        let _ = tx.send(());
                        Signal::Error("done".to_string())
                    }))
                    .boxed();
                let subscription: Box<dyn Subscription> =
                    Box::new(TaskSubscription::spawn(stream, sink));
                Ok(Some(subscription))
            },
            listener.clone(),
        )
        .await
        .unwrap();

        rx.recv().await.unwrap();

        assert_eq!(
            *listener.events.lock(),
            vec!["added a1", "modified a2", "removed a2"]
        );
    }

    #[tokio::test]
    async fn stop_while_opening() {
        let mux = Arc::new(WatchMultiplexer::<&str, String>::new());
        let closed = Arc::new(AtomicUsize::new(0));
        let listener = Arc::new(Recorder::default());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let opening = {
            let mux = Arc::clone(&mux);
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                mux.watch(
                    "a",
                    |_sink| async move {
                        let _ = rx.await;
                        Ok(counted(&closed, false))
                    },
                    listener,
                )
                .await
            })
        };

        // wait until the slot is taken by the opener
        while !mux.slots.lock().contains_key("a") {
            tokio::task::yield_now().await;
        }

        assert!(mux.stop_watch(&"a"));
        tx.send(()).unwrap();

        let started = opening.await.unwrap().unwrap();
        assert!(!started);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(mux.watched_keys().is_empty());
    }
}
