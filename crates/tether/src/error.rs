use std::fmt;

/// Resolution the bridge itself hands to a waiter when no driver result exists.
///
/// Executor error types must be constructible from this via `From`, so a
/// canceled or abandoned unit of work can resolve its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// The caller stopped waiting (its future was dropped or its task aborted).
    Canceled,
    /// The executor holding the unit was dropped before resolving it.
    Dropped,
}

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled => f.write_str("operation canceled"),
            Self::Dropped => f.write_str("executor dropped with pending work"),
        }
    }
}

impl std::error::Error for Interrupted {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterError {
    AlreadySet,
    NotFound,
}

impl fmt::Display for WaiterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadySet => f.write_str("waiter slot already occupied"),
            Self::NotFound => f.write_str("no waiter to resume"),
        }
    }
}

impl std::error::Error for WaiterError {}

/// Returned to the driver-facing side when a completion has nothing to resolve.
///
/// Both variants are expected races (a caller canceled or was flushed first);
/// callers log them and carry on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorError {
    NoCurrentWork,
    ExecutorNotFound,
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCurrentWork => f.write_str("completion received with no work in flight"),
            Self::ExecutorNotFound => f.write_str("no executor registered for key"),
        }
    }
}

impl std::error::Error for ExecutorError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    AlreadyActive,
    NotAwaitingStart,
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyActive => f.write_str("stream already started"),
            Self::NotAwaitingStart => f.write_str("stream bind without a pending start"),
        }
    }
}

impl std::error::Error for GateError {}
