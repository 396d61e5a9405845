use std::fmt;

use tether::Interrupted;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    Unsupported,
    Unauthorized,
    PoweredOff,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported => f.write_str("unsupported"),
            Self::Unauthorized => f.write_str("unauthorized"),
            Self::PoweredOff => f.write_str("powered off"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralError {
    /// The caller stopped waiting.
    Canceled,
    /// The executor holding the request went away without resolving it.
    Dropped,
    /// `cancel_all_operations` resolved the request.
    OperationCancelled,
    /// The owning central or peripheral was dropped.
    OwnerTornDown,
    Timeout,
    BluetoothUnavailable(UnavailableReason),
    ConnectingInProgress,
    DisconnectingInProgress,
    CancelledConnection,
    ConnectFailed(String),
    NoConnectionToPeripheral,
    ScanInProgress,
    /// Error reported by the native driver, passed through unchanged.
    Driver(String),
}

impl fmt::Display for CentralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled => f.write_str("operation canceled"),
            Self::Dropped => f.write_str("operation abandoned by its executor"),
            Self::OperationCancelled => f.write_str("all operations cancelled"),
            Self::OwnerTornDown => f.write_str("owner torn down"),
            Self::Timeout => f.write_str("operation timed out"),
            Self::BluetoothUnavailable(reason) => write!(f, "bluetooth unavailable: {reason}"),
            Self::ConnectingInProgress => f.write_str("a connection attempt is already in progress"),
            Self::DisconnectingInProgress => {
                f.write_str("a disconnection attempt is already in progress")
            }
            Self::CancelledConnection => f.write_str("connection attempt cancelled"),
            Self::ConnectFailed(reason) => write!(f, "failed to connect: {reason}"),
            Self::NoConnectionToPeripheral => {
                f.write_str("no connection to the peripheral exists or is being attempted")
            }
            Self::ScanInProgress => f.write_str("a scan is already in progress"),
            Self::Driver(reason) => write!(f, "driver error: {reason}"),
        }
    }
}

impl std::error::Error for CentralError {}

impl From<Interrupted> for CentralError {
    fn from(value: Interrupted) -> Self {
        match value {
            Interrupted::Canceled => Self::Canceled,
            Interrupted::Dropped => Self::Dropped,
        }
    }
}
