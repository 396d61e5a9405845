use std::fmt;
use std::sync::{Arc, Weak};

use tether::{FlushGroup, KeyedExecutors, SerialExecutor};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    AttributeId, CentralConfig, CentralError, CharacteristicValue, L2capChannel, PeripheralDriver,
    PeripheralId, WriteKind, bounded, log_stray,
};

type Attributes = Vec<AttributeId>;
type ByAttribute<T> = KeyedExecutors<AttributeId, T, CentralError>;

struct PeripheralContext {
    id: PeripheralId,
    rssi: SerialExecutor<i16, CentralError>,
    services: SerialExecutor<Attributes, CentralError>,
    included_services: ByAttribute<Attributes>,
    characteristics: ByAttribute<Attributes>,
    read_characteristic: ByAttribute<Vec<u8>>,
    write_characteristic: ByAttribute<()>,
    notify: ByAttribute<()>,
    descriptors: ByAttribute<Attributes>,
    read_descriptor: ByAttribute<Vec<u8>>,
    write_descriptor: ByAttribute<()>,
    l2cap: SerialExecutor<Option<L2capChannel>, CentralError>,
    group: FlushGroup<CentralError>,
    value_updates: broadcast::Sender<CharacteristicValue>,
}

/// Awaitable commands against one connected peripheral.
///
/// Commands on the same attribute run one at a time; different attributes
/// proceed independently. Dropping the peripheral fails whatever is pending.
pub struct Peripheral<D> {
    driver: Arc<D>,
    context: Arc<PeripheralContext>,
    config: CentralConfig,
}

impl<D: PeripheralDriver> Peripheral<D> {
    pub fn new(id: PeripheralId, driver: Arc<D>, config: CentralConfig) -> Self {
        let group = FlushGroup::new();
        let (value_updates, _) = broadcast::channel(config.event_capacity);
        let context = PeripheralContext {
            id,
            rssi: group.serial(format!("{id}.rssi")),
            services: group.serial(format!("{id}.services")),
            included_services: group.keyed(format!("{id}.included_services")),
            characteristics: group.keyed(format!("{id}.characteristics")),
            read_characteristic: group.keyed(format!("{id}.read_characteristic")),
            write_characteristic: group.keyed(format!("{id}.write_characteristic")),
            notify: group.keyed(format!("{id}.notify")),
            descriptors: group.keyed(format!("{id}.descriptors")),
            read_descriptor: group.keyed(format!("{id}.read_descriptor")),
            write_descriptor: group.keyed(format!("{id}.write_descriptor")),
            l2cap: group.serial(format!("{id}.l2cap")),
            group,
            value_updates,
        };
        Self {
            driver,
            context: Arc::new(context),
            config,
        }
    }

    pub fn id(&self) -> PeripheralId {
        self.context.id
    }

    pub fn callbacks(&self) -> PeripheralCallbacks {
        PeripheralCallbacks {
            context: Arc::downgrade(&self.context),
        }
    }

    /// Values pushed by characteristics with notifications enabled.
    pub fn value_updates(&self) -> broadcast::Receiver<CharacteristicValue> {
        self.context.value_updates.subscribe()
    }

    pub fn maximum_write_len(&self, kind: WriteKind) -> usize {
        self.driver.maximum_write_len(kind)
    }

    pub async fn read_rssi(&self) -> Result<i16, CentralError> {
        let driver = Arc::clone(&self.driver);
        let pending = self.context.rssi.enqueue(move || driver.read_rssi());
        bounded(self.config.operation_timeout, pending).await
    }

    /// Discovers services, limited to `filter` unless it is empty.
    pub async fn discover_services(&self, filter: &[AttributeId]) -> Result<Attributes, CentralError> {
        let driver = Arc::clone(&self.driver);
        let filter = filter.to_vec();
        let pending = self
            .context
            .services
            .enqueue(move || driver.discover_services(&filter));
        bounded(self.config.operation_timeout, pending).await
    }

    pub async fn discover_included_services(
        &self,
        service: AttributeId,
        filter: &[AttributeId],
    ) -> Result<Attributes, CentralError> {
        let driver = Arc::clone(&self.driver);
        let filter = filter.to_vec();
        let pending = self
            .context
            .included_services
            .enqueue(service, move || driver.discover_included_services(service, &filter));
        bounded(self.config.operation_timeout, pending).await
    }

    pub async fn discover_characteristics(
        &self,
        service: AttributeId,
        filter: &[AttributeId],
    ) -> Result<Attributes, CentralError> {
        let driver = Arc::clone(&self.driver);
        let filter = filter.to_vec();
        let pending = self
            .context
            .characteristics
            .enqueue(service, move || driver.discover_characteristics(service, &filter));
        bounded(self.config.operation_timeout, pending).await
    }

    pub async fn read_characteristic(&self, characteristic: AttributeId) -> Result<Vec<u8>, CentralError> {
        let driver = Arc::clone(&self.driver);
        let pending = self
            .context
            .read_characteristic
            .enqueue(characteristic, move || driver.read_characteristic(characteristic));
        bounded(self.config.operation_timeout, pending).await
    }

    /// Writes `value`. A write without response resolves as soon as it is issued.
    pub async fn write_characteristic(
        &self,
        characteristic: AttributeId,
        value: Vec<u8>,
        kind: WriteKind,
    ) -> Result<(), CentralError> {
        let driver = Arc::clone(&self.driver);
        let writes = self.context.write_characteristic.clone();
        let pending = self
            .context
            .write_characteristic
            .enqueue(characteristic, move || {
                driver.write_characteristic(characteristic, &value, kind);
                if kind == WriteKind::WithoutResponse {
                    let _ = writes.complete(&characteristic, Ok(()));
                }
            });
        bounded(self.config.operation_timeout, pending).await
    }

    pub async fn set_notify(&self, characteristic: AttributeId, enabled: bool) -> Result<(), CentralError> {
        let driver = Arc::clone(&self.driver);
        let pending = self
            .context
            .notify
            .enqueue(characteristic, move || driver.set_notify(characteristic, enabled));
        bounded(self.config.operation_timeout, pending).await
    }

    pub async fn discover_descriptors(&self, characteristic: AttributeId) -> Result<Attributes, CentralError> {
        let driver = Arc::clone(&self.driver);
        let pending = self
            .context
            .descriptors
            .enqueue(characteristic, move || driver.discover_descriptors(characteristic));
        bounded(self.config.operation_timeout, pending).await
    }

    pub async fn read_descriptor(&self, descriptor: AttributeId) -> Result<Vec<u8>, CentralError> {
        let driver = Arc::clone(&self.driver);
        let pending = self
            .context
            .read_descriptor
            .enqueue(descriptor, move || driver.read_descriptor(descriptor));
        bounded(self.config.operation_timeout, pending).await
    }

    pub async fn write_descriptor(&self, descriptor: AttributeId, value: Vec<u8>) -> Result<(), CentralError> {
        let driver = Arc::clone(&self.driver);
        let pending = self
            .context
            .write_descriptor
            .enqueue(descriptor, move || driver.write_descriptor(descriptor, &value));
        bounded(self.config.operation_timeout, pending).await
    }

    /// Opens an L2CAP channel on `psm`. `None` means the peripheral accepted
    /// the request but reported no channel.
    pub async fn open_l2cap_channel(&self, psm: u16) -> Result<Option<L2capChannel>, CentralError> {
        let driver = Arc::clone(&self.driver);
        let pending = self.context.l2cap.enqueue(move || {
            debug!(psm, "opening L2CAP channel");
            driver.open_l2cap_channel(psm);
        });
        bounded(self.config.operation_timeout, pending).await
    }

    /// Fails every outstanding command with `OperationCancelled`.
    pub fn cancel_all_operations(&self) {
        info!(peripheral = %self.context.id, "cancelling all operations");
        self.context.group.flush(CentralError::OperationCancelled);
    }
}

impl<D> Drop for Peripheral<D> {
    fn drop(&mut self) {
        self.context.group.flush(CentralError::OwnerTornDown);
    }
}

impl<D> fmt::Debug for Peripheral<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peripheral")
            .field("id", &self.context.id)
            .field("rssi", &self.context.rssi)
            .field("services", &self.context.services)
            .finish_non_exhaustive()
    }
}

/// Driver-facing completion handlers for a [`Peripheral`].
#[derive(Clone)]
pub struct PeripheralCallbacks {
    context: Weak<PeripheralContext>,
}

impl PeripheralCallbacks {
    fn context(&self) -> Option<Arc<PeripheralContext>> {
        let context = self.context.upgrade();
        if context.is_none() {
            debug!("peripheral is gone, ignoring driver callback");
        }
        context
    }

    pub fn rssi_read(&self, result: Result<i16, CentralError>) {
        let Some(context) = self.context() else {
            return;
        };
        log_stray(context.rssi.complete(result), "read rssi", &context.id);
    }

    pub fn services_discovered(&self, result: Result<Attributes, CentralError>) {
        let Some(context) = self.context() else {
            return;
        };
        log_stray(context.services.complete(result), "discovered services", &context.id);
    }

    pub fn included_services_discovered(&self, service: AttributeId, result: Result<Attributes, CentralError>) {
        let Some(context) = self.context() else {
            return;
        };
        log_stray(
            context.included_services.complete(&service, result),
            "discovered included services",
            &service,
        );
    }

    pub fn characteristics_discovered(&self, service: AttributeId, result: Result<Attributes, CentralError>) {
        let Some(context) = self.context() else {
            return;
        };
        log_stray(
            context.characteristics.complete(&service, result),
            "discovered characteristics",
            &service,
        );
    }

    /// A characteristic value arrived, either for a read or as a notification.
    ///
    /// Notifications are published on [`Peripheral::value_updates`] and are
    /// not expected to have a pending read.
    pub fn characteristic_value(
        &self,
        characteristic: AttributeId,
        result: Result<Vec<u8>, CentralError>,
        notifying: bool,
    ) {
        let Some(context) = self.context() else {
            return;
        };
        if let (true, Ok(value)) = (notifying, &result) {
            let _ = context.value_updates.send(CharacteristicValue {
                characteristic,
                value: value.clone(),
            });
        }
        let completed = context.read_characteristic.complete(&characteristic, result);
        if !notifying {
            log_stray(completed, "updated characteristic value", &characteristic);
        }
    }

    pub fn characteristic_written(&self, characteristic: AttributeId, result: Result<(), CentralError>) {
        let Some(context) = self.context() else {
            return;
        };
        log_stray(
            context.write_characteristic.complete(&characteristic, result),
            "wrote characteristic",
            &characteristic,
        );
    }

    pub fn notification_state_updated(&self, characteristic: AttributeId, result: Result<(), CentralError>) {
        let Some(context) = self.context() else {
            return;
        };
        log_stray(
            context.notify.complete(&characteristic, result),
            "updated notification state",
            &characteristic,
        );
    }

    pub fn descriptors_discovered(&self, characteristic: AttributeId, result: Result<Attributes, CentralError>) {
        let Some(context) = self.context() else {
            return;
        };
        log_stray(
            context.descriptors.complete(&characteristic, result),
            "discovered descriptors",
            &characteristic,
        );
    }

    pub fn descriptor_value(&self, descriptor: AttributeId, result: Result<Vec<u8>, CentralError>) {
        let Some(context) = self.context() else {
            return;
        };
        log_stray(
            context.read_descriptor.complete(&descriptor, result),
            "updated descriptor value",
            &descriptor,
        );
    }

    pub fn descriptor_written(&self, descriptor: AttributeId, result: Result<(), CentralError>) {
        let Some(context) = self.context() else {
            return;
        };
        log_stray(
            context.write_descriptor.complete(&descriptor, result),
            "wrote descriptor",
            &descriptor,
        );
    }

    pub fn l2cap_channel_opened(&self, result: Result<Option<L2capChannel>, CentralError>) {
        let Some(context) = self.context() else {
            return;
        };
        log_stray(context.l2cap.complete(result), "opened L2CAP channel", &context.id);
    }
}

impl fmt::Debug for PeripheralCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralCallbacks")
            .field("alive", &(self.context.strong_count() > 0))
            .finish()
    }
}
