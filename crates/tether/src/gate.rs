//! Single-subscriber gate for long-lived native streams (scans and the like).
//!
//! Starting is split in two: `request_start` claims the gate, `bind` installs
//! the sink and only then issues the native start, so no value can arrive
//! before something is listening. Every way of ending the stream funnels into
//! one transition back to `Idle` that runs the native cancel once.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::GateError;
use crate::executor::{Cancel, next_work_id};

enum GateState<V> {
    Idle,
    AwaitingStart,
    Active {
        session: u64,
        sink: mpsc::UnboundedSender<V>,
        /// `None` while the native start is still running.
        cancel: Option<Cancel>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    Idle,
    AwaitingStart,
    Active,
}

struct GateShared<V> {
    name: String,
    state: Mutex<GateState<V>>,
}

impl<V> GateShared<V> {
    /// Moves to `Idle`, running the native cancel if a stream was active.
    ///
    /// With `only_session` set, does nothing unless that session is the
    /// active one.
    fn terminate(&self, only_session: Option<u64>) -> bool {
        let previous = {
            let mut state = self.state.lock();
            if let Some(wanted) = only_session {
                match &*state {
                    GateState::Active { session, .. } if *session == wanted => {}
                    _ => return false,
                }
            }
            std::mem::replace(&mut *state, GateState::Idle)
        };

        match previous {
            GateState::Idle => false,
            GateState::AwaitingStart => {
                tracing::debug!(gate = %self.name, "start abandoned before bind");
                true
            }
            GateState::Active { session, cancel, .. } => {
                tracing::info!(gate = %self.name, session, "stopping stream");
                match cancel {
                    Some(cancel) => cancel(),
                    None => tracing::debug!(gate = %self.name, session, "stopped while starting"),
                }
                true
            }
        }
    }
}

/// Three-state gate: idle, awaiting start, active with a sink.
pub struct StreamGate<V> {
    shared: Arc<GateShared<V>>,
}

impl<V> Clone for StreamGate<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> StreamGate<V>
where
    V: Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(GateShared {
                name: name.into(),
                state: Mutex::new(GateState::Idle),
            }),
        }
    }

    pub fn request_start(&self) -> Result<(), GateError> {
        let mut state = self.shared.state.lock();
        match *state {
            GateState::Idle => {
                *state = GateState::AwaitingStart;
                Ok(())
            }
            _ => Err(GateError::AlreadyActive),
        }
    }

    /// Installs `sink`, then issues the native `start`.
    ///
    /// `cancel` runs exactly once when the stream ends, whichever way it ends.
    pub fn bind<S, C>(&self, sink: mpsc::UnboundedSender<V>, start: S, cancel: C) -> Result<(), GateError>
    where
        S: FnOnce(),
        C: FnOnce() + Send + 'static,
    {
        self.bind_session(sink, start, Box::new(cancel)).map(|_| ())
    }

    fn bind_session<S>(&self, sink: mpsc::UnboundedSender<V>, start: S, cancel: Cancel) -> Result<u64, GateError>
    where
        S: FnOnce(),
    {
        let session = next_work_id();
        {
            let mut state = self.shared.state.lock();
            if !matches!(*state, GateState::AwaitingStart) {
                return Err(GateError::NotAwaitingStart);
            }
            *state = GateState::Active {
                session,
                sink,
                cancel: None,
            };
        }
        tracing::info!(gate = %self.shared.name, session, "starting stream");
        start();

        // A stop that landed while `start` ran left the cancel to us.
        let stopped_while_starting = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                GateState::Active {
                    session: active,
                    cancel: slot,
                    ..
                } if *active == session => {
                    *slot = Some(cancel);
                    None
                }
                _ => Some(cancel),
            }
        };
        if let Some(cancel) = stopped_while_starting {
            tracing::info!(gate = %self.shared.name, session, "stream stopped during start, cancelling");
            cancel();
        }
        Ok(session)
    }

    /// Claims the gate and binds a fresh channel, returning its receiving end.
    pub fn open<S, C>(&self, start: S, cancel: C) -> Result<GateStream<V>, GateError>
    where
        S: FnOnce(),
        C: FnOnce() + Send + 'static,
    {
        self.request_start()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let session = self.bind_session(tx, start, Box::new(cancel))?;
        Ok(GateStream {
            rx,
            session,
            gate: Arc::downgrade(&self.shared),
        })
    }

    /// Ends whatever is in progress. Returns whether anything was stopped.
    pub fn stop(&self) -> bool {
        self.shared.terminate(None)
    }

    /// Delivers `value` to the active sink. Returns whether it was delivered.
    pub fn emit(&self, value: V) -> bool {
        let closed_session = {
            let state = self.shared.state.lock();
            match &*state {
                GateState::Active { session, sink, .. } => match sink.send(value) {
                    Ok(()) => return true,
                    Err(_) => *session,
                },
                _ => {
                    tracing::debug!(gate = %self.shared.name, "ignoring value, stream not active");
                    return false;
                }
            }
        };
        self.shared.terminate(Some(closed_session));
        false
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.shared.state.lock(), GateState::Active { .. })
    }

    pub fn status(&self) -> GateStatus {
        match *self.shared.state.lock() {
            GateState::Idle => GateStatus::Idle,
            GateState::AwaitingStart => GateStatus::AwaitingStart,
            GateState::Active { .. } => GateStatus::Active,
        }
    }
}

impl<V> fmt::Debug for StreamGate<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match *self.shared.state.lock() {
            GateState::Idle => GateStatus::Idle,
            GateState::AwaitingStart => GateStatus::AwaitingStart,
            GateState::Active { .. } => GateStatus::Active,
        };
        f.debug_struct("StreamGate")
            .field("name", &self.shared.name)
            .field("status", &status)
            .finish()
    }
}

/// Receiving end of an opened gate. Dropping it ends the stream.
pub struct GateStream<V> {
    rx: mpsc::UnboundedReceiver<V>,
    session: u64,
    gate: Weak<GateShared<V>>,
}

impl<V> GateStream<V> {
    /// Next value, or `None` once the stream has been stopped.
    pub async fn next(&mut self) -> Option<V> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<V> {
        self.rx.try_recv().ok()
    }
}

impl<V> Drop for GateStream<V> {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.upgrade() {
            gate.terminate(Some(self.session));
        }
    }
}

impl<V> fmt::Debug for GateStream<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateStream")
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&count);
        (count, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn second_start_is_rejected_until_idle() {
        let gate = StreamGate::<u32>::new("scan");
        let (_, cancel) = counter();

        let stream = gate.open(|| {}, cancel).unwrap();
        assert_eq!(gate.request_start(), Err(GateError::AlreadyActive));

        drop(stream);
        assert_eq!(gate.status(), GateStatus::Idle);
        assert_eq!(gate.request_start(), Ok(()));
        assert_eq!(gate.status(), GateStatus::AwaitingStart);
        assert_eq!(gate.request_start(), Err(GateError::AlreadyActive));
    }

    #[test]
    fn bind_requires_a_pending_start() {
        let gate = StreamGate::<u32>::new("scan");
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(gate.bind(tx, || {}, || {}), Err(GateError::NotAwaitingStart));
    }

    #[tokio::test]
    async fn native_start_runs_after_sink_is_installed() {
        let gate = StreamGate::<u32>::new("scan");
        let emitter = gate.clone();

        let mut stream = gate
            .open(
                move || {
                    assert!(emitter.emit(1));
                },
                || {},
            )
            .unwrap();

        assert_eq!(stream.next().await, Some(1));
    }

    #[test]
    fn emit_outside_active_is_dropped() {
        let gate = StreamGate::<u32>::new("scan");
        assert!(!gate.emit(1));
        gate.request_start().unwrap();
        assert!(!gate.emit(2));
    }

    #[test]
    fn concurrent_stops_cancel_once() {
        let gate = StreamGate::<u32>::new("scan");
        let (count, cancel) = counter();
        let _stream = gate.open(|| {}, cancel).unwrap();

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || gate.stop())
            })
            .collect();
        let stopped: Vec<bool> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(stopped.iter().filter(|s| **s).count(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(gate.status(), GateStatus::Idle);
    }

    #[tokio::test]
    async fn stop_then_stream_drop_cancels_once() {
        let gate = StreamGate::<u32>::new("scan");
        let (count, cancel) = counter();
        let mut stream = gate.open(|| {}, cancel).unwrap();

        assert!(gate.stop());
        assert_eq!(stream.next().await, None);
        drop(stream);

        assert!(!gate.stop());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_stream_drop_leaves_new_session_alone() {
        let gate = StreamGate::<u32>::new("scan");
        let (first_count, first_cancel) = counter();
        let (second_count, second_cancel) = counter();

        let first = gate.open(|| {}, first_cancel).unwrap();
        gate.stop();
        let _second = gate.open(|| {}, second_cancel).unwrap();
        drop(first);

        assert!(gate.is_active());
        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_during_native_start_cancels_once_start_returns() {
        let gate = StreamGate::<u32>::new("scan");
        let scanning = Arc::new(AtomicUsize::new(0));
        let stopper = gate.clone();
        let on = Arc::clone(&scanning);
        let off = Arc::clone(&scanning);

        let mut stream = gate
            .open(
                move || {
                    assert!(stopper.stop());
                    on.store(1, Ordering::SeqCst);
                },
                move || off.store(0, Ordering::SeqCst),
            )
            .unwrap();

        assert_eq!(gate.status(), GateStatus::Idle);
        assert_eq!(scanning.load(Ordering::SeqCst), 0);
        assert_eq!(stream.next().await, None);

        drop(stream);
        assert_eq!(gate.request_start(), Ok(()));
    }

    #[test]
    fn stop_from_another_thread_during_start_leaves_radio_off() {
        let gate = StreamGate::<u32>::new("scan");
        let (count, cancel) = counter();
        let stopper = gate.clone();

        let _stream = gate
            .open(
                move || {
                    std::thread::spawn(move || stopper.stop()).join().unwrap();
                },
                cancel,
            )
            .unwrap();

        assert_eq!(gate.status(), GateStatus::Idle);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn emit_into_dropped_receiver_ends_stream() {
        let gate = StreamGate::<u32>::new("scan");
        let (count, cancel) = counter();
        let (tx, rx) = mpsc::unbounded_channel();

        gate.request_start().unwrap();
        gate.bind(tx, || {}, cancel).unwrap();
        drop(rx);

        assert!(!gate.emit(5));
        assert_eq!(gate.status(), GateStatus::Idle);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
