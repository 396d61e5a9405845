//! Serial execution of callback-completed work.
//!
//! A unit of work is a `start` closure that issues a native command plus a
//! waiter that is resolved when the driver reports the command's completion.
//! At most one unit is in flight per executor; the rest wait in FIFO order.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{ExecutorError, Interrupted, SingleSlotWaiter};

pub(crate) type Start = Box<dyn FnOnce() + Send + 'static>;
pub(crate) type Cancel = Box<dyn FnOnce() + Send + 'static>;

// Work ids are unique across executors so a late cancel can never match a
// unit that belongs to a recreated executor for the same key.
static NEXT_WORK_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_work_id() -> u64 {
    NEXT_WORK_ID.fetch_add(1, Ordering::Relaxed)
}

struct QueuedWork<T, E> {
    id: u64,
    start: Start,
    waiter: SingleSlotWaiter<T, E>,
    canceled: bool,
}

struct CurrentWork<T, E> {
    id: u64,
    waiter: SingleSlotWaiter<T, E>,
}

/// Waiters collected under the lock, resolved after it is released.
pub(crate) struct Resolutions<T, E> {
    completed: Option<(SingleSlotWaiter<T, E>, Result<T, E>)>,
    canceled: Vec<SingleSlotWaiter<T, E>>,
}

impl<T, E> Resolutions<T, E>
where
    E: From<Interrupted>,
{
    pub(crate) fn none() -> Self {
        Self {
            completed: None,
            canceled: Vec::new(),
        }
    }

    pub(crate) fn resolve(self) {
        if let Some((mut waiter, result)) = self.completed {
            let _ = waiter.resume(result);
        }
        for mut waiter in self.canceled {
            let _ = waiter.resume(Err(Interrupted::Canceled.into()));
        }
    }
}

pub(crate) struct WorkQueue<T, E> {
    current: Option<CurrentWork<T, E>>,
    queue: VecDeque<QueuedWork<T, E>>,
    pumping: bool,
}

impl<T, E> WorkQueue<T, E> {
    fn new() -> Self {
        Self {
            current: None,
            queue: VecDeque::new(),
            pumping: false,
        }
    }

    pub(crate) fn has_work(&self) -> bool {
        self.current.is_some() || !self.queue.is_empty()
    }

    pub(crate) fn push(&mut self, start: Start) -> (u64, oneshot::Receiver<Result<T, E>>) {
        let id = next_work_id();
        let (waiter, rx) = SingleSlotWaiter::pair();
        self.queue.push_back(QueuedWork {
            id,
            start,
            waiter,
            canceled: false,
        });
        (id, rx)
    }

    /// Pops canceled units off the head while nothing is in flight.
    fn settle(&mut self, resolutions: &mut Resolutions<T, E>) {
        while self.current.is_none() {
            match self.queue.front() {
                Some(work) if work.canceled => {
                    if let Some(work) = self.queue.pop_front() {
                        tracing::debug!(work_id = work.id, "skipping canceled work");
                        resolutions.canceled.push(work.waiter);
                    }
                }
                _ => break,
            }
        }
    }

    /// Installs the queue head as current and hands back its start closure.
    fn install_next(&mut self) -> Option<(u64, Start)> {
        if self.current.is_some() {
            return None;
        }
        let work = self.queue.pop_front()?;
        self.current = Some(CurrentWork {
            id: work.id,
            waiter: work.waiter,
        });
        Some((work.id, work.start))
    }

    pub(crate) fn complete(&mut self, result: Result<T, E>) -> Result<Resolutions<T, E>, ExecutorError> {
        let Some(current) = self.current.take() else {
            return Err(ExecutorError::NoCurrentWork);
        };
        let mut resolutions = Resolutions {
            completed: Some((current.waiter, result)),
            canceled: Vec::new(),
        };
        self.settle(&mut resolutions);
        Ok(resolutions)
    }

    pub(crate) fn cancel(&mut self, id: u64) -> Resolutions<T, E> {
        let mut resolutions = Resolutions {
            completed: None,
            canceled: Vec::new(),
        };
        match self.current.take() {
            Some(current) if current.id == id => {
                tracing::debug!(work_id = id, "canceling work in flight");
                resolutions.canceled.push(current.waiter);
            }
            other => {
                self.current = other;
                if let Some(work) = self.queue.iter_mut().find(|work| work.id == id) {
                    tracing::debug!(work_id = id, "marking queued work canceled");
                    work.canceled = true;
                }
            }
        }
        self.settle(&mut resolutions);
        resolutions
    }

    pub(crate) fn drain(&mut self) -> Vec<SingleSlotWaiter<T, E>> {
        let mut waiters = Vec::with_capacity(self.queue.len() + 1);
        if let Some(current) = self.current.take() {
            waiters.push(current.waiter);
        }
        waiters.extend(self.queue.drain(..).map(|work| work.waiter));
        waiters
    }
}

pub(crate) struct Shared<T, E> {
    name: String,
    pub(crate) state: Mutex<WorkQueue<T, E>>,
}

impl<T, E> Shared<T, E> {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            state: Mutex::new(WorkQueue::new()),
        }
    }
}

impl<T, E> Shared<T, E>
where
    E: From<Interrupted>,
{
    /// Issues queued starts one at a time until a unit is in flight or the
    /// queue runs dry.
    ///
    /// Only one thread pumps at a time. A completion arriving from inside a
    /// start closure only updates the state; the pumping thread picks up the
    /// next unit once the closure returns.
    pub(crate) fn pump(&self) {
        {
            let mut state = self.state.lock();
            if state.pumping {
                return;
            }
            state.pumping = true;
        }

        let mut guard = PumpGuard {
            shared: self,
            starting: None,
        };
        loop {
            let mut resolutions = Resolutions::none();
            let next = {
                let mut state = self.state.lock();
                state.settle(&mut resolutions);
                let next = state.install_next();
                if next.is_none() {
                    state.pumping = false;
                }
                next
            };
            resolutions.resolve();

            let Some((id, start)) = next else {
                break;
            };
            tracing::debug!(executor = %self.name, work_id = id, "starting work");
            guard.starting = Some(id);
            start();
            guard.starting = None;
        }
    }
}

/// Releases the pump if a start closure unwinds.
///
/// The unit whose start panicked is resolved with `Interrupted::Dropped`.
/// Units still queued behind it start on the next `enqueue`.
struct PumpGuard<'a, T, E>
where
    E: From<Interrupted>,
{
    shared: &'a Shared<T, E>,
    starting: Option<u64>,
}

impl<T, E> Drop for PumpGuard<'_, T, E>
where
    E: From<Interrupted>,
{
    fn drop(&mut self) {
        let Some(id) = self.starting else {
            return;
        };
        let abandoned = {
            let mut state = self.shared.state.lock();
            state.pumping = false;
            match state.current.take() {
                Some(current) if current.id == id => Some(current.waiter),
                other => {
                    state.current = other;
                    None
                }
            }
        };
        tracing::warn!(executor = %self.shared.name, work_id = id, "start panicked, abandoning work");
        if let Some(mut waiter) = abandoned {
            let _ = waiter.resume(Err(Interrupted::Dropped.into()));
        }
    }
}

impl<T, E> Drop for Shared<T, E> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.queue.is_empty() {
            tracing::warn!(executor = %self.name, "executor dropped with pending work");
        }
        if state.current.is_some() {
            tracing::warn!(executor = %self.name, "executor dropped while executing work");
        }
    }
}

/// Future returned by `enqueue`, resolving when the unit is completed,
/// flushed, or canceled.
///
/// Dropping it cancels the unit: a queued unit is skipped, an in-flight unit
/// is abandoned and the next unit starts.
#[must_use = "dropping the pending result cancels the work"]
pub struct Pending<T, E> {
    rx: oneshot::Receiver<Result<T, E>>,
    cancel: Option<Cancel>,
}

impl<T, E> Pending<T, E> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T, E>>, cancel: Cancel) -> Self {
        Self {
            rx,
            cancel: Some(cancel),
        }
    }
}

impl<T, E> Future for Pending<T, E>
where
    E: From<Interrupted>,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                this.cancel = None;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                this.cancel = None;
                Poll::Ready(Err(Interrupted::Dropped.into()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, E> Drop for Pending<T, E> {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl<T, E> fmt::Debug for Pending<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// Executes queued work serially, in FIFO order, one native command at a time.
pub struct SerialExecutor<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for SerialExecutor<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> SerialExecutor<T, E>
where
    T: Send + 'static,
    E: From<Interrupted> + Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared::new(name.into())),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queues `start` and returns the future for its result.
    ///
    /// If nothing is in flight, `start` runs before this returns. The one
    /// exception is a start closure on another thread that completed its own
    /// unit and has not returned yet: that thread is still pumping, so it
    /// issues this `start` as soon as its closure returns.
    pub fn enqueue<F>(&self, start: F) -> Pending<T, E>
    where
        F: FnOnce() + Send + 'static,
    {
        let (id, rx) = self.shared.state.lock().push(Box::new(start));
        let weak = Arc::downgrade(&self.shared);
        let pending = Pending::new(rx, Box::new(move || cancel_on(&weak, id)));
        self.shared.pump();
        pending
    }

    /// Resolves the in-flight unit with `result` and starts the next one.
    pub fn complete(&self, result: Result<T, E>) -> Result<(), ExecutorError> {
        let resolutions = self.shared.state.lock().complete(result);
        let resolutions = resolutions.inspect_err(|_| {
            tracing::debug!(executor = %self.shared.name, "completion without work in flight");
        })?;
        resolutions.resolve();
        self.shared.pump();
        Ok(())
    }

    /// Resolves the in-flight unit and every queued unit with `result`.
    pub fn flush(&self, result: Result<T, E>)
    where
        T: Clone,
        E: Clone,
    {
        let waiters = self.shared.state.lock().drain();
        if !waiters.is_empty() {
            tracing::debug!(executor = %self.shared.name, count = waiters.len(), "flushing work");
        }
        for mut waiter in waiters {
            let _ = waiter.resume(result.clone());
        }
    }

    pub fn has_work(&self) -> bool {
        self.shared.state.lock().has_work()
    }

    pub fn is_executing(&self) -> bool {
        self.shared.state.lock().current.is_some()
    }

    pub fn queued_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}

fn cancel_on<T, E>(weak: &Weak<Shared<T, E>>, id: u64)
where
    E: From<Interrupted>,
{
    let Some(shared) = weak.upgrade() else {
        return;
    };
    let resolutions = shared.state.lock().cancel(id);
    resolutions.resolve();
    shared.pump();
}

impl<T, E> fmt::Debug for SerialExecutor<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("SerialExecutor")
            .field("name", &self.shared.name)
            .field("executing", &state.current.is_some())
            .field("queued", &state.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Recorder, TestError};
    use std::time::Duration;

    fn executor() -> SerialExecutor<u32, TestError> {
        SerialExecutor::new("test")
    }

    #[test]
    fn idle_executor_starts_work_before_enqueue_returns() {
        let exec = executor();
        let log = Recorder::default();

        let _a = exec.enqueue(log.start("a"));

        assert_eq!(log.take(), vec!["a"]);
        assert!(exec.is_executing());
    }

    #[tokio::test]
    async fn runs_work_in_fifo_order_one_at_a_time() {
        let exec = executor();
        let log = Recorder::default();

        let a = exec.enqueue(log.start("a"));
        let b = exec.enqueue(log.start("b"));
        let c = exec.enqueue(log.start("c"));
        assert_eq!(log.take(), vec!["a"]);
        assert_eq!(exec.queued_len(), 2);

        exec.complete(Ok(1)).unwrap();
        assert_eq!(a.await, Ok(1));
        assert_eq!(log.take(), vec!["b"]);

        exec.complete(Ok(2)).unwrap();
        assert_eq!(b.await, Ok(2));
        assert_eq!(log.take(), vec!["c"]);

        exec.complete(Err(TestError::Driver("boom"))).unwrap();
        assert_eq!(c.await, Err(TestError::Driver("boom")));
        assert!(!exec.has_work());
    }

    #[tokio::test]
    async fn cancel_while_queued_skips_start_and_keeps_queue_moving() {
        let exec = executor();
        let log = Recorder::default();

        let a = exec.enqueue(log.start("a"));
        let b = exec.enqueue(log.start("b"));
        let c = exec.enqueue(log.start("c"));
        assert_eq!(log.take(), vec!["a"]);

        drop(b);
        assert_eq!(exec.queued_len(), 2, "canceled work stays queued until dequeued");

        exec.complete(Ok(1)).unwrap();
        assert_eq!(a.await, Ok(1));
        assert_eq!(log.take(), vec!["c"]);
        assert!(exec.is_executing());

        exec.complete(Ok(3)).unwrap();
        assert_eq!(c.await, Ok(3));
    }

    #[tokio::test]
    async fn aborted_task_cancels_its_queued_work() {
        let exec = executor();
        let log = Recorder::default();

        let a = exec.enqueue(log.start("a"));
        let b = tokio::spawn(exec.enqueue(log.start("b")));
        let c = exec.enqueue(log.start("c"));

        b.abort();
        let joined = b.await;
        assert!(joined.unwrap_err().is_cancelled());

        exec.complete(Ok(1)).unwrap();
        assert_eq!(a.await, Ok(1));
        assert_eq!(log.take(), vec!["a", "c"]);
        drop(c);
    }

    #[tokio::test]
    async fn late_completion_after_cancel_with_nothing_queued_is_stray() {
        let exec = executor();
        let log = Recorder::default();

        let a = exec.enqueue(log.start("a"));
        assert!(exec.is_executing());

        drop(a);
        assert!(!exec.has_work());
        assert_eq!(exec.complete(Ok(9)), Err(ExecutorError::NoCurrentWork));

        let b = exec.enqueue(log.start("b"));
        assert_eq!(log.take(), vec!["a", "b"]);
        exec.complete(Ok(2)).unwrap();
        assert_eq!(b.await, Ok(2));
    }

    #[tokio::test]
    async fn late_completion_after_cancel_resolves_the_successor() {
        let exec = executor();
        let log = Recorder::default();

        let a = exec.enqueue(log.start("a"));
        let b = exec.enqueue(log.start("b"));
        drop(a);
        assert_eq!(log.take(), vec!["a", "b"]);

        // Completions carry no unit id, so the answer to `a` lands on `b`.
        exec.complete(Ok(7)).unwrap();
        assert_eq!(b.await, Ok(7));
        assert!(!exec.has_work());
    }

    #[test]
    fn panicking_start_does_not_wedge_the_executor() {
        let exec = executor();
        let log = Recorder::default();

        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _a = exec.enqueue(|| panic!("driver blew up"));
        }));
        assert!(caught.is_err());
        assert!(!exec.has_work());

        let _b = exec.enqueue(log.start("b"));
        assert_eq!(log.take(), vec!["b"]);
        assert!(exec.is_executing());
    }

    #[tokio::test]
    async fn panicking_start_during_handover_resolves_its_caller() {
        let exec = executor();
        let log = Recorder::default();

        let a = exec.enqueue(log.start("a"));
        let b = exec.enqueue(|| panic!("driver blew up"));
        let c = exec.enqueue(log.start("c"));

        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            exec.complete(Ok(1)).unwrap();
        }));
        assert!(caught.is_err());
        assert_eq!(a.await, Ok(1));
        assert_eq!(b.await, Err(TestError::Dropped));
        assert_eq!(log.take(), vec!["a"]);

        // The next enqueue picks the queue back up.
        let d = exec.enqueue(log.start("d"));
        assert_eq!(log.take(), vec!["c"]);
        exec.complete(Ok(3)).unwrap();
        assert_eq!(c.await, Ok(3));
        assert_eq!(log.take(), vec!["d"]);
        exec.complete(Ok(4)).unwrap();
        assert_eq!(d.await, Ok(4));
    }

    #[tokio::test]
    async fn flush_resolves_current_and_queued_work() {
        let exec = executor();
        let log = Recorder::default();

        let a = exec.enqueue(log.start("a"));
        let b = exec.enqueue(log.start("b"));
        let c = exec.enqueue(log.start("c"));

        exec.flush(Err(TestError::TornDown));

        assert_eq!(a.await, Err(TestError::TornDown));
        assert_eq!(b.await, Err(TestError::TornDown));
        assert_eq!(c.await, Err(TestError::TornDown));
        assert_eq!(log.take(), vec!["a"]);
        assert!(!exec.has_work());

        exec.flush(Err(TestError::TornDown));
        assert_eq!(exec.complete(Ok(0)), Err(ExecutorError::NoCurrentWork));
    }

    #[tokio::test]
    async fn completion_from_inside_start_does_not_deadlock() {
        let exec = executor();
        let inner = exec.clone();
        let log = Recorder::default();
        let start = log.start("a");

        let a = exec.enqueue(move || {
            start();
            inner.complete(Ok(11)).unwrap();
        });
        let b = exec.enqueue(log.start("b"));

        assert_eq!(a.await, Ok(11));
        assert_eq!(log.take(), vec!["a", "b"]);
        exec.complete(Ok(12)).unwrap();
        assert_eq!(b.await, Ok(12));
    }

    #[tokio::test]
    async fn reentrant_completion_starts_next_after_current_start_returns() {
        let exec = executor();
        let inner = exec.clone();
        let log = Recorder::default();
        let first = log.start("a:begin");
        let last = log.start("a:end");

        let x = exec.enqueue(log.start("x"));
        let a = exec.enqueue(move || {
            first();
            inner.complete(Ok(1)).unwrap();
            last();
        });
        let b = exec.enqueue(log.start("b"));

        exec.complete(Ok(0)).unwrap();
        assert_eq!(x.await, Ok(0));
        assert_eq!(a.await, Ok(1));
        assert_eq!(log.take(), vec!["x", "a:begin", "a:end", "b"]);

        exec.complete(Ok(2)).unwrap();
        assert_eq!(b.await, Ok(2));
    }

    #[tokio::test]
    async fn dropping_executor_interrupts_waiters() {
        let exec = executor();
        let log = Recorder::default();

        let a = exec.enqueue(log.start("a"));
        let b = exec.enqueue(log.start("b"));
        drop(exec);

        assert_eq!(a.await, Err(TestError::Dropped));
        assert_eq!(b.await, Err(TestError::Dropped));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_layered_by_the_caller() {
        let exec = executor();
        let log = Recorder::default();

        let a = exec.enqueue(log.start("a"));
        let b = exec.enqueue(log.start("b"));

        let timed_out = tokio::time::timeout(Duration::from_millis(100), a).await;
        assert!(timed_out.is_err());
        assert_eq!(log.take(), vec!["a", "b"]);

        exec.complete(Ok(4)).unwrap();
        assert_eq!(b.await, Ok(4));
    }

    #[tokio::test]
    async fn concurrent_callers_never_overlap() {
        let exec = executor();
        let in_flight = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let max_seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            let pending = exec.enqueue(move || {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
            });
            handles.push(tokio::spawn(pending));
        }

        for n in 0..16 {
            in_flight.fetch_sub(1, Ordering::SeqCst);
            exec.complete(Ok(n)).unwrap();
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
