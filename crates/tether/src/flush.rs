use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Interrupted, KeyedExecutors, SerialExecutor, StreamGate};

/// Something that can resolve all of its outstanding waiters with one error.
pub trait Flushable<E>: Send + Sync {
    fn flush_with(&self, error: E);
}

impl<T, E> Flushable<E> for SerialExecutor<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + From<Interrupted> + Send + 'static,
{
    fn flush_with(&self, error: E) {
        self.flush(Err(error));
    }
}

impl<K, T, E> Flushable<E> for KeyedExecutors<K, T, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + From<Interrupted> + Send + 'static,
{
    fn flush_with(&self, error: E) {
        self.flush_all(Err(error));
    }
}

impl<V, E> Flushable<E> for StreamGate<V>
where
    V: Send + 'static,
{
    fn flush_with(&self, _error: E) {
        self.stop();
    }
}

/// Every executor and gate owned by one entity, flushed together on teardown.
pub struct FlushGroup<E> {
    members: Mutex<Vec<Arc<dyn Flushable<E>>>>,
}

impl<E> FlushGroup<E>
where
    E: Clone + From<Interrupted> + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            members: Mutex::new(Vec::new()),
        }
    }

    pub fn register<F>(&self, member: F)
    where
        F: Flushable<E> + 'static,
    {
        self.members.lock().push(Arc::new(member));
    }

    /// Creates a serial executor that this group will flush.
    pub fn serial<T>(&self, name: impl Into<String>) -> SerialExecutor<T, E>
    where
        T: Clone + Send + 'static,
    {
        let executor = SerialExecutor::new(name);
        self.register(executor.clone());
        executor
    }

    /// Creates a keyed registry that this group will flush.
    pub fn keyed<K, T>(&self, name: impl Into<String>) -> KeyedExecutors<K, T, E>
    where
        K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
        T: Clone + Send + 'static,
    {
        let executors = KeyedExecutors::new(name);
        self.register(executors.clone());
        executors
    }

    /// Creates a stream gate that this group will stop.
    pub fn gate<V>(&self, name: impl Into<String>) -> StreamGate<V>
    where
        V: Send + 'static,
    {
        let gate = StreamGate::new(name);
        self.register(gate.clone());
        gate
    }

    /// Resolves every outstanding waiter of every member with `error`.
    pub fn flush(&self, error: E) {
        let members: Vec<_> = self.members.lock().iter().map(Arc::clone).collect();
        tracing::debug!(members = members.len(), "flushing group");
        for member in members {
            member.flush_with(error.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }
}

impl<E> Default for FlushGroup<E>
where
    E: Clone + From<Interrupted> + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
