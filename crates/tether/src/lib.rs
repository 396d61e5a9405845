//! Bridges delegate-style native APIs into awaitable, cancellable requests.
//!
//! A native command is issued from a `start` closure and finished later by a
//! completion callback. Executors hold the suspended callers in between,
//! keep at most one command in flight per key, and resolve everyone on
//! cancellation, completion, or teardown.

pub(crate) mod error;
pub(crate) mod executor;
pub(crate) mod flush;
pub(crate) mod gate;
pub(crate) mod keyed;
pub(crate) mod waiter;

pub use self::error::*;
pub use self::executor::{Pending, SerialExecutor};
pub use self::flush::*;
pub use self::gate::{GateStatus, GateStream, StreamGate};
pub use self::keyed::KeyedExecutors;
pub use self::waiter::SingleSlotWaiter;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::Interrupted;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum TestError {
        Canceled,
        Dropped,
        TornDown,
        Driver(&'static str),
    }

    impl From<Interrupted> for TestError {
        fn from(value: Interrupted) -> Self {
            match value {
                Interrupted::Canceled => Self::Canceled,
                Interrupted::Dropped => Self::Dropped,
            }
        }
    }

    /// Records which start closures ran, in order.
    #[derive(Clone, Default)]
    pub struct Recorder {
        started: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Recorder {
        pub fn start(&self, label: &'static str) -> impl FnOnce() + Send + 'static {
            let started = Arc::clone(&self.started);
            move || started.lock().push(label)
        }

        pub fn take(&self) -> Vec<&'static str> {
            std::mem::take(&mut *self.started.lock())
        }
    }
}
