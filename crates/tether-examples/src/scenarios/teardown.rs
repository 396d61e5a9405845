use tether_central::{CentralError, PeripheralId, ScanFilter};

use crate::Config;
use crate::sim::{HEART_RATE, MEASUREMENT, SIM_PERIPHERAL};

pub async fn run(cfg: &Config) -> Result<(), String> {
    let (central, radio) = super::central(cfg);
    central
        .wait_until_ready()
        .await
        .map_err(|e| format!("radio never became ready: {e}"))?;

    // A scan plus a connection attempt still waiting on the radio.
    let mut scan = central
        .scan(ScanFilter::default())
        .map_err(|e| e.to_string())?;
    let (connect, ()) = tokio::join!(central.connect(PeripheralId(0xdead)), async {
        tokio::task::yield_now().await;
        central.cancel_all_operations();
    });
    println!("pending connect after cancel_all_operations: {connect:?}");
    expect(connect, CentralError::OperationCancelled)?;
    while scan.next().await.is_some() {}
    println!("scan stream ended, scanning: {}", central.is_scanning());
    drop(scan);

    // Peripheral commands in flight when everything is cancelled.
    let peripheral = super::peripheral(cfg, &radio, SIM_PERIPHERAL);
    let (rssi, services, value, ()) = tokio::join!(
        peripheral.read_rssi(),
        peripheral.discover_services(&[HEART_RATE]),
        peripheral.read_characteristic(MEASUREMENT),
        async {
            tokio::task::yield_now().await;
            peripheral.cancel_all_operations();
        }
    );
    for result in [rssi.map(|_| ()), services.map(|_| ()), value.map(|_| ())] {
        println!("peripheral command: {result:?}");
        expect(result, CentralError::OperationCancelled)?;
    }

    // The radio still answers the abandoned commands; those answers find no waiter.
    tokio::time::sleep(cfg.latency * 2).await;

    // Dropping the central ends a scan that nobody stopped.
    let mut scan = central
        .scan(ScanFilter::default())
        .map_err(|e| e.to_string())?;
    drop(central);
    while scan.next().await.is_some() {}
    println!("scan stream ended with its central");
    Ok(())
}

fn expect(result: Result<(), CentralError>, wanted: CentralError) -> Result<(), String> {
    match result {
        Err(err) if err == wanted => Ok(()),
        other => Err(format!("expected {wanted:?}, got {other:?}")),
    }
}
