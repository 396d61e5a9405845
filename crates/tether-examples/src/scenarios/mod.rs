pub mod cancel_while_queued;
pub mod connect_and_read;
pub mod teardown;

use std::sync::Arc;

use tether_central::{Central, Peripheral, PeripheralId, ScanFilter};

use crate::Config;
use crate::sim::{HEART_RATE, SimRadio};

/// A central wired to a fresh simulated radio that is powering on.
pub fn central(cfg: &Config) -> (Central<SimRadio>, Arc<SimRadio>) {
    let radio = Arc::new(SimRadio::new(cfg.latency));
    let central = Central::new(Arc::clone(&radio), cfg.central.clone());
    radio.attach_central(central.callbacks());
    radio.power_on();
    (central, radio)
}

pub fn peripheral(cfg: &Config, radio: &Arc<SimRadio>, id: PeripheralId) -> Peripheral<SimRadio> {
    let peripheral = Peripheral::new(id, Arc::clone(radio), cfg.central.clone());
    radio.attach_peripheral(peripheral.callbacks());
    peripheral
}

/// Waits for the radio, then scans until a heart-rate peripheral shows up.
pub async fn find_heart_rate_monitor(central: &Central<SimRadio>) -> Result<PeripheralId, String> {
    central
        .wait_until_ready()
        .await
        .map_err(|e| format!("radio never became ready: {e}"))?;

    let mut scan = central
        .scan(ScanFilter {
            services: vec![HEART_RATE],
            allow_duplicates: false,
        })
        .map_err(|e| e.to_string())?;
    let found = scan
        .next()
        .await
        .ok_or_else(|| "scan ended before anything was found".to_owned())?;
    println!(
        "found {} ({}) at {} dBm",
        found.name.as_deref().unwrap_or("unnamed"),
        found.peripheral,
        found.rssi
    );
    Ok(found.peripheral)
}
