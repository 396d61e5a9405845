use tether_central::WriteKind;

use crate::Config;
use crate::sim::{
    BODY_SENSOR_LOCATION, CLIENT_CONFIG, CONTROL_POINT, HEART_RATE, MEASUREMENT, SIM_L2CAP_PSM,
};

pub async fn run(cfg: &Config) -> Result<(), String> {
    let (central, radio) = super::central(cfg);
    let id = super::find_heart_rate_monitor(&central).await?;

    central.connect(id).await.map_err(|e| e.to_string())?;
    println!("connected to {id}");
    let connected = central.retrieve_connected_peripherals(&[HEART_RATE]);
    println!("connected heart rate monitors: {}", connected.len());

    let peripheral = super::peripheral(cfg, &radio, id);
    let rssi = peripheral.read_rssi().await.map_err(|e| e.to_string())?;
    println!("rssi: {rssi} dBm");

    let services = peripheral
        .discover_services(&[HEART_RATE])
        .await
        .map_err(|e| e.to_string())?;
    for service in services {
        let included = peripheral
            .discover_included_services(service, &[])
            .await
            .map_err(|e| e.to_string())?;
        if !included.is_empty() {
            println!("service {service} includes {} other services", included.len());
        }
        let characteristics = peripheral
            .discover_characteristics(service, &[])
            .await
            .map_err(|e| e.to_string())?;
        let listed: Vec<_> = characteristics.iter().map(|c| c.to_string()).collect();
        println!("service {service}: {}", listed.join(", "));
    }

    let location = peripheral
        .read_characteristic(BODY_SENSOR_LOCATION)
        .await
        .map_err(|e| e.to_string())?;
    println!("body sensor location: {location:?}");

    let descriptors = peripheral
        .discover_descriptors(MEASUREMENT)
        .await
        .map_err(|e| e.to_string())?;
    if descriptors.contains(&CLIENT_CONFIG) {
        let config = peripheral
            .read_descriptor(CLIENT_CONFIG)
            .await
            .map_err(|e| e.to_string())?;
        println!("client configuration before subscribing: {config:?}");
    }

    let mut updates = peripheral.value_updates();
    peripheral
        .set_notify(MEASUREMENT, true)
        .await
        .map_err(|e| e.to_string())?;
    for _ in 0..3 {
        let update = updates.recv().await.map_err(|e| e.to_string())?;
        println!("heart rate: {} bpm", update.value.get(1).copied().unwrap_or_default());
    }
    peripheral
        .set_notify(MEASUREMENT, false)
        .await
        .map_err(|e| e.to_string())?;

    peripheral
        .write_characteristic(CONTROL_POINT, vec![0x01], WriteKind::WithResponse)
        .await
        .map_err(|e| e.to_string())?;
    println!(
        "wrote control point (up to {} bytes per write)",
        peripheral.maximum_write_len(WriteKind::WithResponse)
    );

    match peripheral
        .open_l2cap_channel(SIM_L2CAP_PSM)
        .await
        .map_err(|e| e.to_string())?
    {
        Some(channel) => println!("opened L2CAP channel on psm {:#x}", channel.psm),
        None => println!("peripheral reported no L2CAP channel"),
    }

    central.cancel_connection(id).await.map_err(|e| e.to_string())?;
    println!("disconnected from {id}");
    Ok(())
}
