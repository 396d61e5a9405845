//! An in-process radio that answers commands after a fixed latency.
//!
//! It exposes one heart-rate peripheral and reports every completion from a
//! spawned task, the way a native stack reports from its own queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tether_central::{
    Advertisement, AttributeId, CentralCallbacks, CentralDriver, CentralError, ConnectionState,
    L2capChannel, PeripheralCallbacks, PeripheralDriver, PeripheralId, RadioState, ScanFilter,
    WriteKind,
};
use tokio::task::JoinHandle;
use tracing::debug;

pub const SIM_PERIPHERAL: PeripheralId = PeripheralId(0x7e7e_0000_0000_0000_0000_0000_0000_5157);
pub const HEART_RATE: AttributeId = AttributeId(0x180d);
pub const MEASUREMENT: AttributeId = AttributeId(0x2a37);
pub const BODY_SENSOR_LOCATION: AttributeId = AttributeId(0x2a38);
pub const CONTROL_POINT: AttributeId = AttributeId(0x2a39);
pub const CLIENT_CONFIG: AttributeId = AttributeId(0x2902);
pub const SIM_L2CAP_PSM: u16 = 0x0081;

pub struct SimRadio {
    latency: Duration,
    state: Arc<Mutex<RadioState>>,
    connections: Arc<Mutex<HashMap<PeripheralId, ConnectionState>>>,
    values: Arc<Mutex<HashMap<AttributeId, Vec<u8>>>>,
    central: Mutex<Option<CentralCallbacks>>,
    peripheral: Mutex<Option<PeripheralCallbacks>>,
    scan: Mutex<Option<JoinHandle<()>>>,
    notifying: Mutex<Option<JoinHandle<()>>>,
    reads: AtomicUsize,
    heart_rate: Arc<AtomicU8>,
}

impl SimRadio {
    pub fn new(latency: Duration) -> Self {
        let values = HashMap::from([
            (BODY_SENSOR_LOCATION, vec![0x01]),
            (CONTROL_POINT, vec![0x00]),
            (CLIENT_CONFIG, vec![0x00, 0x00]),
        ]);
        Self {
            latency,
            state: Arc::new(Mutex::new(RadioState::Unknown)),
            connections: Default::default(),
            values: Arc::new(Mutex::new(values)),
            central: Mutex::new(None),
            peripheral: Mutex::new(None),
            scan: Mutex::new(None),
            notifying: Mutex::new(None),
            reads: AtomicUsize::new(0),
            heart_rate: Arc::new(AtomicU8::new(62)),
        }
    }

    pub fn attach_central(&self, callbacks: CentralCallbacks) {
        *self.central.lock() = Some(callbacks);
    }

    pub fn attach_peripheral(&self, callbacks: PeripheralCallbacks) {
        *self.peripheral.lock() = Some(callbacks);
    }

    /// Reports `PoweredOn` after one latency period.
    pub fn power_on(&self) {
        *self.state.lock() = RadioState::Resetting;
        let Some(callbacks) = self.central_callbacks() else {
            return;
        };
        let state = Arc::clone(&self.state);
        self.later(move || {
            *state.lock() = RadioState::PoweredOn;
            callbacks.state_changed(RadioState::PoweredOn);
        });
    }

    /// Characteristic and descriptor reads the radio has been asked for.
    pub fn reads_issued(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn later(&self, report: impl FnOnce() + Send + 'static) {
        let latency = self.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            report();
        });
    }

    fn central_callbacks(&self) -> Option<CentralCallbacks> {
        self.central.lock().clone()
    }

    fn peripheral_callbacks(&self) -> Option<PeripheralCallbacks> {
        self.peripheral.lock().clone()
    }

    fn value(&self, attribute: AttributeId) -> Result<Vec<u8>, CentralError> {
        if attribute == MEASUREMENT {
            return Ok(vec![0x00, self.heart_rate.load(Ordering::SeqCst)]);
        }
        self.values
            .lock()
            .get(&attribute)
            .cloned()
            .ok_or_else(|| CentralError::Driver(format!("unknown attribute {attribute}")))
    }
}

impl CentralDriver for SimRadio {
    fn state(&self) -> RadioState {
        *self.state.lock()
    }

    fn start_scan(&self, filter: &ScanFilter) {
        let Some(callbacks) = self.central_callbacks() else {
            return;
        };
        if !filter.services.is_empty() && !filter.services.contains(&HEART_RATE) {
            debug!(?filter, "sim: nothing matches the scan filter");
            return;
        }
        let latency = self.latency;
        let advertisement = Advertisement {
            peripheral: SIM_PERIPHERAL,
            name: Some("tether-sim".to_owned()),
            rssi: -58,
            services: vec![HEART_RATE],
        };
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(latency).await;
                callbacks.discovered(advertisement.clone());
            }
        });
        if let Some(previous) = self.scan.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop_scan(&self) {
        if let Some(task) = self.scan.lock().take() {
            task.abort();
        }
    }

    fn connect(&self, peripheral: PeripheralId) {
        let Some(callbacks) = self.central_callbacks() else {
            return;
        };
        if peripheral != SIM_PERIPHERAL {
            debug!(%peripheral, "sim: unknown peripheral, connection will fail");
            self.later(move || callbacks.failed_to_connect(peripheral, "peripheral not in range"));
            return;
        }
        self.connections
            .lock()
            .insert(peripheral, ConnectionState::Connecting);
        let connections = Arc::clone(&self.connections);
        self.later(move || {
            {
                let mut connections = connections.lock();
                // A cancel issued in the meantime wins.
                if connections.get(&peripheral) != Some(&ConnectionState::Connecting) {
                    return;
                }
                connections.insert(peripheral, ConnectionState::Connected);
            }
            callbacks.connected(peripheral);
        });
    }

    fn cancel_connection(&self, peripheral: PeripheralId) {
        let Some(callbacks) = self.central_callbacks() else {
            return;
        };
        self.connections
            .lock()
            .insert(peripheral, ConnectionState::Disconnecting);
        let connections = Arc::clone(&self.connections);
        self.later(move || {
            connections
                .lock()
                .insert(peripheral, ConnectionState::Disconnected);
            callbacks.disconnected(peripheral, false, None);
        });
    }

    fn connection_state(&self, peripheral: PeripheralId) -> ConnectionState {
        self.connections
            .lock()
            .get(&peripheral)
            .copied()
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn retrieve_peripherals(&self, ids: &[PeripheralId]) -> Vec<PeripheralId> {
        ids.iter().copied().filter(|id| *id == SIM_PERIPHERAL).collect()
    }

    fn retrieve_connected_peripherals(&self, services: &[AttributeId]) -> Vec<PeripheralId> {
        let connected = self.connection_state(SIM_PERIPHERAL) == ConnectionState::Connected;
        if connected && services.contains(&HEART_RATE) {
            vec![SIM_PERIPHERAL]
        } else {
            Vec::new()
        }
    }
}

impl PeripheralDriver for SimRadio {
    fn read_rssi(&self) {
        let Some(callbacks) = self.peripheral_callbacks() else {
            return;
        };
        self.later(move || callbacks.rssi_read(Ok(-61)));
    }

    fn discover_services(&self, _filter: &[AttributeId]) {
        let Some(callbacks) = self.peripheral_callbacks() else {
            return;
        };
        self.later(move || callbacks.services_discovered(Ok(vec![HEART_RATE])));
    }

    fn discover_included_services(&self, service: AttributeId, _filter: &[AttributeId]) {
        let Some(callbacks) = self.peripheral_callbacks() else {
            return;
        };
        self.later(move || callbacks.included_services_discovered(service, Ok(Vec::new())));
    }

    fn discover_characteristics(&self, service: AttributeId, _filter: &[AttributeId]) {
        let Some(callbacks) = self.peripheral_callbacks() else {
            return;
        };
        let found = if service == HEART_RATE {
            Ok(vec![MEASUREMENT, BODY_SENSOR_LOCATION, CONTROL_POINT])
        } else {
            Err(CentralError::Driver(format!("unknown service {service}")))
        };
        self.later(move || callbacks.characteristics_discovered(service, found));
    }

    fn read_characteristic(&self, characteristic: AttributeId) {
        let Some(callbacks) = self.peripheral_callbacks() else {
            return;
        };
        self.reads.fetch_add(1, Ordering::SeqCst);
        let value = self.value(characteristic);
        self.later(move || callbacks.characteristic_value(characteristic, value, false));
    }

    fn write_characteristic(&self, characteristic: AttributeId, value: &[u8], kind: WriteKind) {
        self.values.lock().insert(characteristic, value.to_vec());
        if kind == WriteKind::WithoutResponse {
            return;
        }
        let Some(callbacks) = self.peripheral_callbacks() else {
            return;
        };
        self.later(move || callbacks.characteristic_written(characteristic, Ok(())));
    }

    fn set_notify(&self, characteristic: AttributeId, enabled: bool) {
        let Some(callbacks) = self.peripheral_callbacks() else {
            return;
        };
        if characteristic != MEASUREMENT {
            let error = CentralError::Driver(format!("{characteristic} does not notify"));
            self.later(move || callbacks.notification_state_updated(characteristic, Err(error)));
            return;
        }

        let previous = if enabled {
            let latency = self.latency;
            let heart_rate = Arc::clone(&self.heart_rate);
            let notifier = callbacks.clone();
            let task = tokio::spawn(async move {
                // First value lands after the enable acknowledgement.
                tokio::time::sleep(latency * 2).await;
                loop {
                    let bpm = heart_rate.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
                    notifier.characteristic_value(MEASUREMENT, Ok(vec![0x00, bpm]), true);
                    tokio::time::sleep(latency).await;
                }
            });
            self.notifying.lock().replace(task)
        } else {
            self.notifying.lock().take()
        };
        if let Some(previous) = previous {
            debug!("sim: stopping notifications");
            previous.abort();
        }
        self.later(move || callbacks.notification_state_updated(characteristic, Ok(())));
    }

    fn discover_descriptors(&self, characteristic: AttributeId) {
        let Some(callbacks) = self.peripheral_callbacks() else {
            return;
        };
        let found = if characteristic == MEASUREMENT {
            vec![CLIENT_CONFIG]
        } else {
            Vec::new()
        };
        self.later(move || callbacks.descriptors_discovered(characteristic, Ok(found)));
    }

    fn read_descriptor(&self, descriptor: AttributeId) {
        let Some(callbacks) = self.peripheral_callbacks() else {
            return;
        };
        self.reads.fetch_add(1, Ordering::SeqCst);
        let value = self.value(descriptor);
        self.later(move || callbacks.descriptor_value(descriptor, value));
    }

    fn write_descriptor(&self, descriptor: AttributeId, value: &[u8]) {
        let Some(callbacks) = self.peripheral_callbacks() else {
            return;
        };
        self.values.lock().insert(descriptor, value.to_vec());
        self.later(move || callbacks.descriptor_written(descriptor, Ok(())));
    }

    fn open_l2cap_channel(&self, psm: u16) {
        let Some(callbacks) = self.peripheral_callbacks() else {
            return;
        };
        let opened = if psm == SIM_L2CAP_PSM {
            Ok(Some(L2capChannel {
                peripheral: SIM_PERIPHERAL,
                psm,
            }))
        } else {
            Err(CentralError::Driver(format!("no L2CAP service on psm {psm:#x}")))
        };
        self.later(move || callbacks.l2cap_channel_opened(opened));
    }

    fn maximum_write_len(&self, kind: WriteKind) -> usize {
        match kind {
            WriteKind::WithResponse => 512,
            WriteKind::WithoutResponse => 182,
        }
    }
}

impl Drop for SimRadio {
    fn drop(&mut self) {
        for task in [self.scan.get_mut().take(), self.notifying.get_mut().take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}
