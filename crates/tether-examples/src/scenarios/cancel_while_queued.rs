use std::time::Duration;

use crate::Config;
use crate::sim::BODY_SENSOR_LOCATION;

/// Three reads of one characteristic queue behind each other. The middle one
/// is abandoned before its turn and never reaches the radio.
pub async fn run(cfg: &Config) -> Result<(), String> {
    let (central, radio) = super::central(cfg);
    let id = super::find_heart_rate_monitor(&central).await?;
    central.connect(id).await.map_err(|e| e.to_string())?;
    let peripheral = super::peripheral(cfg, &radio, id);

    let before = radio.reads_issued();
    let abandoned = async {
        tokio::select! {
            result = peripheral.read_characteristic(BODY_SENSOR_LOCATION) => {
                Err(format!("middle read was supposed to be abandoned, got {result:?}"))
            }
            _ = tokio::time::sleep(cfg.latency / 2) => {
                println!("middle read abandoned while queued");
                Ok(())
            }
        }
    };
    let (first, middle, last) = tokio::join!(
        peripheral.read_characteristic(BODY_SENSOR_LOCATION),
        abandoned,
        async {
            // Queue behind the middle read so its slot has to be skipped.
            tokio::time::sleep(Duration::from_millis(1)).await;
            peripheral.read_characteristic(BODY_SENSOR_LOCATION).await
        }
    );

    println!("first read: {first:?}");
    middle?;
    println!("last read: {last:?}");
    first.map_err(|e| e.to_string())?;
    last.map_err(|e| e.to_string())?;

    let issued = radio.reads_issued() - before;
    println!("radio saw {issued} reads for 3 requests");
    if issued != 2 {
        return Err(format!("expected the radio to see 2 reads, saw {issued}"));
    }

    central.cancel_connection(id).await.map_err(|e| e.to_string())?;
    Ok(())
}
