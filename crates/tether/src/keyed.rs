//! Serial executors addressed by key.
//!
//! Work under different keys runs in parallel; work under the same key is
//! serialized. An executor exists only while its key has work.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::executor::{Resolutions, Shared};
use crate::{ExecutorError, Interrupted, Pending};

struct KeyedShared<K, T, E> {
    name: String,
    executors: Mutex<HashMap<K, Arc<Shared<T, E>>>>,
}

/// A lazily-populated, eagerly-evicted map of serial executors.
pub struct KeyedExecutors<K, T, E> {
    shared: Arc<KeyedShared<K, T, E>>,
}

impl<K, T, E> Clone for KeyedExecutors<K, T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, T, E> KeyedExecutors<K, T, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    T: Send + 'static,
    E: From<Interrupted> + Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(KeyedShared {
                name: name.into(),
                executors: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queues `start` behind any work already queued for `key`.
    ///
    /// If `key` has nothing in flight, `start` runs before this returns.
    pub fn enqueue<F>(&self, key: K, start: F) -> Pending<T, E>
    where
        F: FnOnce() + Send + 'static,
    {
        let (executor, id, rx) = {
            let mut executors = self.shared.executors.lock();
            let executor = executors.entry(key.clone()).or_insert_with(|| {
                tracing::debug!(registry = %self.shared.name, ?key, "creating executor");
                Arc::new(Shared::new(format!("{}[{key:?}]", self.shared.name)))
            });
            let (id, rx) = executor.state.lock().push(Box::new(start));
            (Arc::clone(executor), id, rx)
        };

        let weak = Arc::downgrade(&self.shared);
        let pending = Pending::new(
            rx,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.cancel(&key, id);
                }
            }),
        );
        executor.pump();
        pending
    }

    /// Resolves the in-flight unit for `key` and starts its next unit.
    pub fn complete(&self, key: &K, result: Result<T, E>) -> Result<(), ExecutorError> {
        let (executor, resolutions) = {
            let mut executors = self.shared.executors.lock();
            let Some(executor) = executors.get(key).map(Arc::clone) else {
                return Err(ExecutorError::ExecutorNotFound);
            };
            let (resolutions, idle) = {
                let mut state = executor.state.lock();
                let resolutions = state.complete(result)?;
                (resolutions, !state.has_work())
            };
            if idle {
                executors.remove(key);
            }
            (executor, resolutions)
        };

        resolutions.resolve();
        executor.pump();
        Ok(())
    }

    /// Resolves every unit queued or in flight for `key` with `result`.
    pub fn flush(&self, key: &K, result: Result<T, E>) -> Result<(), ExecutorError>
    where
        T: Clone,
        E: Clone,
    {
        let Some(executor) = self.shared.executors.lock().remove(key) else {
            return Err(ExecutorError::ExecutorNotFound);
        };
        let waiters = executor.state.lock().drain();
        for mut waiter in waiters {
            let _ = waiter.resume(result.clone());
        }
        Ok(())
    }

    /// Resolves all work under every key with `result` and empties the registry.
    pub fn flush_all(&self, result: Result<T, E>)
    where
        T: Clone,
        E: Clone,
    {
        let executors: Vec<_> = self.shared.executors.lock().drain().collect();
        for (key, executor) in executors {
            let waiters = executor.state.lock().drain();
            if !waiters.is_empty() {
                tracing::debug!(registry = %self.shared.name, ?key, count = waiters.len(), "flushing work");
            }
            for mut waiter in waiters {
                let _ = waiter.resume(result.clone());
            }
        }
    }

    pub fn has_work(&self, key: &K) -> bool {
        self.shared
            .executors
            .lock()
            .get(key)
            .is_some_and(|executor| executor.state.lock().has_work())
    }

    /// Number of keys that currently own an executor.
    pub fn len(&self) -> usize {
        self.shared.executors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.executors.lock().is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shared.executors.lock().contains_key(key)
    }
}

impl<K, T, E> KeyedShared<K, T, E>
where
    K: Eq + Hash,
    E: From<Interrupted>,
{
    fn cancel(&self, key: &K, id: u64) {
        let (executor, resolutions) = {
            let mut executors = self.executors.lock();
            let Some(executor) = executors.get(key).map(Arc::clone) else {
                return;
            };
            let (resolutions, idle): (Resolutions<T, E>, bool) = {
                let mut state = executor.state.lock();
                let resolutions = state.cancel(id);
                (resolutions, !state.has_work())
            };
            if idle {
                executors.remove(key);
            }
            (executor, resolutions)
        };

        resolutions.resolve();
        executor.pump();
    }
}

impl<K, T, E> fmt::Debug for KeyedExecutors<K, T, E>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let executors = self.shared.executors.lock();
        f.debug_struct("KeyedExecutors")
            .field("name", &self.shared.name)
            .field("keys", &executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Recorder, TestError};

    fn registry() -> KeyedExecutors<&'static str, u32, TestError> {
        KeyedExecutors::new("test")
    }

    #[tokio::test]
    async fn distinct_keys_run_in_parallel() {
        let keyed = registry();
        let log = Recorder::default();

        let one = keyed.enqueue("one", log.start("one"));
        let two = keyed.enqueue("two", log.start("two"));
        assert_eq!(log.take(), vec!["one", "two"]);

        keyed.complete(&"two", Ok(2)).unwrap();
        keyed.complete(&"one", Ok(1)).unwrap();
        assert_eq!(one.await, Ok(1));
        assert_eq!(two.await, Ok(2));
    }

    #[tokio::test]
    async fn same_key_is_serialized_in_submission_order() {
        let keyed = registry();
        let log = Recorder::default();

        let a = keyed.enqueue("k", log.start("a"));
        let b = keyed.enqueue("k", log.start("b"));
        let c = keyed.enqueue("k", log.start("c"));
        assert_eq!(log.take(), vec!["a"]);

        keyed.complete(&"k", Ok(1)).unwrap();
        assert_eq!(log.take(), vec!["b"]);
        keyed.complete(&"k", Ok(2)).unwrap();
        assert_eq!(log.take(), vec!["c"]);
        keyed.complete(&"k", Ok(3)).unwrap();

        assert_eq!((a.await, b.await, c.await), (Ok(1), Ok(2), Ok(3)));
    }

    #[tokio::test]
    async fn executor_is_evicted_once_idle() {
        let keyed = registry();
        let log = Recorder::default();

        let a = keyed.enqueue("k", log.start("a"));
        let b = keyed.enqueue("k", log.start("b"));
        assert_eq!(keyed.len(), 1);

        keyed.complete(&"k", Ok(1)).unwrap();
        assert!(keyed.contains_key(&"k"));
        assert!(keyed.has_work(&"k"));

        keyed.complete(&"k", Ok(2)).unwrap();
        assert!(!keyed.contains_key(&"k"));
        assert!(!keyed.has_work(&"k"));
        assert!(keyed.is_empty());

        assert_eq!((a.await, b.await), (Ok(1), Ok(2)));
    }

    #[test]
    fn completion_for_unknown_key_is_not_found() {
        let keyed = registry();
        assert_eq!(keyed.complete(&"nope", Ok(0)), Err(ExecutorError::ExecutorNotFound));
        assert_eq!(
            keyed.flush(&"nope", Err(TestError::TornDown)),
            Err(ExecutorError::ExecutorNotFound)
        );
    }

    #[tokio::test]
    async fn flush_resolves_everything_and_evicts_key() {
        let keyed = registry();
        let log = Recorder::default();

        let a = keyed.enqueue("k", log.start("a"));
        let b = keyed.enqueue("k", log.start("b"));
        let c = keyed.enqueue("k", log.start("c"));

        keyed.flush(&"k", Err(TestError::TornDown)).unwrap();

        assert_eq!(a.await, Err(TestError::TornDown));
        assert_eq!(b.await, Err(TestError::TornDown));
        assert_eq!(c.await, Err(TestError::TornDown));
        assert!(!keyed.has_work(&"k"));
        assert!(!keyed.contains_key(&"k"));
        assert_eq!(log.take(), vec!["a"]);
    }

    #[tokio::test]
    async fn flush_all_covers_every_key() {
        let keyed = registry();
        let log = Recorder::default();

        let a = keyed.enqueue("a", log.start("a"));
        let b = keyed.enqueue("b", log.start("b"));
        let b2 = keyed.enqueue("b", log.start("b2"));

        keyed.flush_all(Err(TestError::TornDown));

        assert!(keyed.is_empty());
        assert_eq!(a.await, Err(TestError::TornDown));
        assert_eq!(b.await, Err(TestError::TornDown));
        assert_eq!(b2.await, Err(TestError::TornDown));
    }

    #[tokio::test]
    async fn canceling_last_in_flight_unit_evicts_key() {
        let keyed = registry();
        let log = Recorder::default();

        let a = keyed.enqueue("k", log.start("a"));
        drop(a);

        assert!(!keyed.contains_key(&"k"));
        assert_eq!(keyed.complete(&"k", Ok(0)), Err(ExecutorError::ExecutorNotFound));
    }

    #[tokio::test]
    async fn cancel_while_queued_under_key_starts_following_unit() {
        let keyed = registry();
        let log = Recorder::default();

        let a = keyed.enqueue("k", log.start("a"));
        let b = keyed.enqueue("k", log.start("b"));
        let c = keyed.enqueue("k", log.start("c"));
        drop(b);

        keyed.complete(&"k", Ok(1)).unwrap();
        assert_eq!(a.await, Ok(1));
        assert_eq!(log.take(), vec!["a", "c"]);

        keyed.complete(&"k", Ok(3)).unwrap();
        assert_eq!(c.await, Ok(3));
        assert!(keyed.is_empty());
    }

    #[tokio::test]
    async fn canceled_tail_does_not_keep_executor_alive() {
        let keyed = registry();
        let log = Recorder::default();

        let a = keyed.enqueue("k", log.start("a"));
        let b = keyed.enqueue("k", log.start("b"));
        drop(b);

        keyed.complete(&"k", Ok(1)).unwrap();
        assert_eq!(a.await, Ok(1));
        assert!(keyed.is_empty());
        assert_eq!(log.take(), vec!["a"]);
    }

    #[tokio::test]
    async fn completion_from_inside_start_goes_through_registry() {
        let keyed = registry();
        let inner = keyed.clone();

        let a = keyed.enqueue("k", move || {
            inner.complete(&"k", Ok(7)).unwrap();
        });

        assert_eq!(a.await, Ok(7));
        assert!(keyed.is_empty());
    }
}
