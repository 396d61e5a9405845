use std::fmt;
use std::sync::{Arc, Weak};

use tether::{FlushGroup, GateStream, KeyedExecutors, SerialExecutor, StreamGate};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    Advertisement, AttributeId, CentralConfig, CentralDriver, CentralError, CentralEvent,
    ConnectionState, PeripheralId, RadioState, ScanFilter, bounded, log_stray, readiness,
};

/// Advertisements from a running scan. Dropping it stops the scan.
pub type ScanStream = GateStream<Advertisement>;

struct CentralContext {
    ready: SerialExecutor<(), CentralError>,
    scan: StreamGate<Advertisement>,
    connect: KeyedExecutors<PeripheralId, (), CentralError>,
    disconnect: KeyedExecutors<PeripheralId, (), CentralError>,
    group: FlushGroup<CentralError>,
    events: broadcast::Sender<CentralEvent>,
}

/// Awaitable front for a [`CentralDriver`].
///
/// The driver must report completions through [`Central::callbacks`].
pub struct Central<D> {
    driver: Arc<D>,
    context: Arc<CentralContext>,
    config: CentralConfig,
}

impl<D: CentralDriver> Central<D> {
    pub fn new(driver: Arc<D>, config: CentralConfig) -> Self {
        let group = FlushGroup::new();
        let (events, _) = broadcast::channel(config.event_capacity);
        let context = CentralContext {
            ready: group.serial("central.ready"),
            scan: group.gate("central.scan"),
            connect: group.keyed("central.connect"),
            disconnect: group.keyed("central.disconnect"),
            group,
            events,
        };
        Self {
            driver,
            context: Arc::new(context),
            config,
        }
    }

    /// Completion entry points for the driver. They do not keep the central alive.
    pub fn callbacks(&self) -> CentralCallbacks {
        CentralCallbacks {
            context: Arc::downgrade(&self.context),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<CentralEvent> {
        self.context.events.subscribe()
    }

    pub fn state(&self) -> RadioState {
        self.driver.state()
    }

    /// Resolves once the radio is powered on, or fails once it is known to be unusable.
    pub async fn wait_until_ready(&self) -> Result<(), CentralError> {
        if let Some(ready) = readiness(self.driver.state()) {
            return ready;
        }

        info!("waiting for the radio to become ready");
        let driver = Arc::clone(&self.driver);
        let ready = self.context.ready.clone();
        let pending = self.context.ready.enqueue(move || {
            // The state may have settled while this waiter sat in the queue.
            if let Some(result) = readiness(driver.state()) {
                ready.flush(result);
            }
        });
        bounded(self.config.operation_timeout, pending).await
    }

    pub fn scan(&self, filter: ScanFilter) -> Result<ScanStream, CentralError> {
        let start_driver = Arc::clone(&self.driver);
        let stop_driver = Arc::clone(&self.driver);
        let stream = self
            .context
            .scan
            .open(
                move || start_driver.start_scan(&filter),
                move || {
                    stop_driver.stop_scan();
                    info!("stopped scanning");
                },
            )
            .map_err(|_| {
                error!("unable to scan, a scan is already in progress");
                CentralError::ScanInProgress
            })?;
        info!("scanning for peripherals");
        Ok(stream)
    }

    pub fn stop_scan(&self) {
        if !self.context.scan.stop() {
            debug!("stop_scan called while not scanning");
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.context.scan.is_active()
    }

    pub async fn connect(&self, peripheral: PeripheralId) -> Result<(), CentralError> {
        if self.context.connect.has_work(&peripheral) {
            error!(%peripheral, "unable to connect, a connection attempt is already in progress");
            return Err(CentralError::ConnectingInProgress);
        }

        let driver = Arc::clone(&self.driver);
        let pending = self.context.connect.enqueue(peripheral, move || {
            info!(%peripheral, "connecting");
            driver.connect(peripheral);
        });
        bounded(self.config.operation_timeout, pending).await
    }

    /// Disconnects, or aborts a connection attempt still in progress.
    pub async fn cancel_connection(&self, peripheral: PeripheralId) -> Result<(), CentralError> {
        match self.driver.connection_state(peripheral) {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            state => {
                error!(%peripheral, ?state, "unable to disconnect, no connection");
                return Err(CentralError::NoConnectionToPeripheral);
            }
        }

        if self.context.disconnect.has_work(&peripheral) {
            error!(%peripheral, "unable to disconnect, a disconnection is already in progress");
            return Err(CentralError::DisconnectingInProgress);
        }

        if self.context.connect.has_work(&peripheral) {
            info!(%peripheral, "cancelling connection attempt");
            let _ = self
                .context
                .connect
                .complete(&peripheral, Err(CentralError::CancelledConnection));
        }

        let driver = Arc::clone(&self.driver);
        let pending = self.context.disconnect.enqueue(peripheral, move || {
            info!(%peripheral, "disconnecting");
            driver.cancel_connection(peripheral);
        });
        bounded(self.config.operation_timeout, pending).await
    }

    pub fn retrieve_peripherals(&self, ids: &[PeripheralId]) -> Vec<PeripheralId> {
        self.driver.retrieve_peripherals(ids)
    }

    pub fn retrieve_connected_peripherals(&self, services: &[AttributeId]) -> Vec<PeripheralId> {
        self.driver.retrieve_connected_peripherals(services)
    }

    /// Stops any scan and fails every outstanding request with `OperationCancelled`.
    pub fn cancel_all_operations(&self) {
        info!("cancelling all operations");
        self.context.group.flush(CentralError::OperationCancelled);
    }
}

impl<D> Drop for Central<D> {
    fn drop(&mut self) {
        self.context.group.flush(CentralError::OwnerTornDown);
    }
}

impl<D> fmt::Debug for Central<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Central")
            .field("scan", &self.context.scan)
            .field("connecting", &self.context.connect.len())
            .field("disconnecting", &self.context.disconnect.len())
            .finish()
    }
}

/// Driver-facing completion handlers for a [`Central`].
#[derive(Clone)]
pub struct CentralCallbacks {
    context: Weak<CentralContext>,
}

impl CentralCallbacks {
    fn context(&self) -> Option<Arc<CentralContext>> {
        let context = self.context.upgrade();
        if context.is_none() {
            debug!("central is gone, ignoring driver callback");
        }
        context
    }

    pub fn state_changed(&self, state: RadioState) {
        let Some(context) = self.context() else {
            return;
        };
        info!(?state, "radio state changed");
        let _ = context.events.send(CentralEvent::StateChanged(state));
        if let Some(result) = readiness(state) {
            context.ready.flush(result);
        }
    }

    pub fn discovered(&self, advertisement: Advertisement) {
        let Some(context) = self.context() else {
            return;
        };
        if !context.scan.emit(advertisement) {
            debug!("discovered a peripheral while not scanning");
        }
    }

    pub fn connected(&self, peripheral: PeripheralId) {
        let Some(context) = self.context() else {
            return;
        };
        let _ = context.events.send(CentralEvent::Connected(peripheral));
        log_stray(
            context.connect.complete(&peripheral, Ok(())),
            "connected",
            &peripheral,
        );
    }

    pub fn failed_to_connect(&self, peripheral: PeripheralId, reason: impl Into<String>) {
        let Some(context) = self.context() else {
            return;
        };
        let reason = reason.into();
        warn!(%peripheral, %reason, "failed to connect");
        log_stray(
            context
                .connect
                .complete(&peripheral, Err(CentralError::ConnectFailed(reason))),
            "failed to connect",
            &peripheral,
        );
    }

    /// `is_reconnecting` is set when the system will reconnect on its own.
    pub fn disconnected(&self, peripheral: PeripheralId, is_reconnecting: bool, error: Option<String>) {
        let Some(context) = self.context() else {
            return;
        };
        let result = match &error {
            Some(reason) => Err(CentralError::Driver(reason.clone())),
            None => Ok(()),
        };
        let _ = context.events.send(CentralEvent::Disconnected {
            peripheral,
            is_reconnecting,
            error,
        });
        // Unsolicited disconnects have no waiter; that is expected.
        if context.disconnect.complete(&peripheral, result).is_err() {
            info!(%peripheral, "disconnected without a pending request");
        }
    }
}

impl fmt::Debug for CentralCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CentralCallbacks")
            .field("alive", &(self.context.strong_count() > 0))
            .finish()
    }
}
