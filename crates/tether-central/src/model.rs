use std::fmt;

use crate::{CentralError, UnavailableReason};

/// Identifies a remote peripheral.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeripheralId(pub u128);

/// Identifies a service, characteristic, or descriptor on a peripheral.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttributeId(pub u128);

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short ids (the assigned 16-bit range) read better unpadded.
        if self.0 <= u128::from(u16::MAX) {
            write!(f, "{:04x}", self.0)
        } else {
            write!(f, "{:032x}", self.0)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

/// Whether the radio can be used in `state`.
///
/// `None` means the state is transitional and the caller should keep waiting.
pub fn readiness(state: RadioState) -> Option<Result<(), CentralError>> {
    let reason = match state {
        RadioState::PoweredOn => return Some(Ok(())),
        RadioState::Unknown | RadioState::Resetting => return None,
        RadioState::Unsupported => UnavailableReason::Unsupported,
        RadioState::Unauthorized => UnavailableReason::Unauthorized,
        RadioState::PoweredOff => UnavailableReason::PoweredOff,
    };
    Some(Err(CentralError::BluetoothUnavailable(reason)))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only report peripherals advertising one of these services; empty means all.
    pub services: Vec<AttributeId>,
    pub allow_duplicates: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    pub peripheral: PeripheralId,
    pub name: Option<String>,
    pub rssi: i16,
    pub services: Vec<AttributeId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharacteristicValue {
    pub characteristic: AttributeId,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CentralEvent {
    StateChanged(RadioState),
    Connected(PeripheralId),
    Disconnected {
        peripheral: PeripheralId,
        /// The system keeps trying to reconnect on its own.
        is_reconnecting: bool,
        error: Option<String>,
    },
}

/// An L2CAP connection-oriented channel opened on a peripheral.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct L2capChannel {
    pub peripheral: PeripheralId,
    pub psm: u16,
}
