//! Native driver seams.
//!
//! Every command method is fire-and-forget: it issues the native call and
//! returns. Completions come back later through [`crate::CentralCallbacks`]
//! or [`crate::PeripheralCallbacks`], from whatever thread the platform uses.

use crate::{AttributeId, ConnectionState, PeripheralId, RadioState, ScanFilter, WriteKind};

pub trait CentralDriver: Send + Sync + 'static {
    fn state(&self) -> RadioState;

    fn start_scan(&self, filter: &ScanFilter);

    fn stop_scan(&self);

    fn connect(&self, peripheral: PeripheralId);

    fn cancel_connection(&self, peripheral: PeripheralId);

    fn connection_state(&self, peripheral: PeripheralId) -> ConnectionState;

    /// Known peripherals among `ids`. Answers synchronously.
    fn retrieve_peripherals(&self, ids: &[PeripheralId]) -> Vec<PeripheralId>;

    /// Peripherals connected to the system that expose any of `services`.
    fn retrieve_connected_peripherals(&self, services: &[AttributeId]) -> Vec<PeripheralId>;
}

pub trait PeripheralDriver: Send + Sync + 'static {
    fn read_rssi(&self);

    fn discover_services(&self, filter: &[AttributeId]);

    fn discover_included_services(&self, service: AttributeId, filter: &[AttributeId]);

    fn discover_characteristics(&self, service: AttributeId, filter: &[AttributeId]);

    fn read_characteristic(&self, characteristic: AttributeId);

    fn write_characteristic(&self, characteristic: AttributeId, value: &[u8], kind: WriteKind);

    fn set_notify(&self, characteristic: AttributeId, enabled: bool);

    fn discover_descriptors(&self, characteristic: AttributeId);

    fn read_descriptor(&self, descriptor: AttributeId);

    fn write_descriptor(&self, descriptor: AttributeId, value: &[u8]);

    fn open_l2cap_channel(&self, psm: u16);

    fn maximum_write_len(&self, kind: WriteKind) -> usize;
}
