//! Example: Data logging without hardware
//!
//! Records two simulated ISM330DHCX sensors at 100 Hz for two seconds, then
//! reads the CSV files back.
//!
//! Run with: cargo run --example data_logging

use gyro_sensor_interface::transport::mock::MockBus;
use gyro_sensor_interface::{
    read_records, sink_path, BringUpConfig, GyroLogger, SamplingConfig, Transport,
    ISM330DHCX_ADDRESS_HIGH, ISM330DHCX_ADDRESS_LOW,
};
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Data Logging Example");
    println!("====================\n");

    let bus = MockBus::new();
    bus.add_sensor(ISM330DHCX_ADDRESS_LOW, 0x6B);
    bus.add_sensor(ISM330DHCX_ADDRESS_HIGH, 0x6B);
    bus.set_gyro(ISM330DHCX_ADDRESS_LOW, [120, -40, 7]);
    bus.set_gyro(ISM330DHCX_ADDRESS_HIGH, [-3, 250, 64]);

    let mut logger = GyroLogger::new(
        Transport::new(Box::new(bus)),
        BringUpConfig::immediate(),
        SamplingConfig::default(),
    );
    logger.register_device(ISM330DHCX_ADDRESS_LOW)?;
    logger.register_device(ISM330DHCX_ADDRESS_HIGH)?;

    let output = std::env::temp_dir().join("gyro_demo");
    println!("Logging data at 100 Hz for 2 seconds...");
    println!("Output folder: {}\n", output.display());

    logger.configure_recording(true, 100)?;
    logger.start_session(&output)?;
    thread::sleep(Duration::from_secs(2));

    if let Some(summary) = logger.stop_session()? {
        for (index, rate) in summary.rates_hz().iter().enumerate() {
            let records = read_records(sink_path(&output, index))?;
            println!("sensor{}: {} rows, {:.1} Hz", index, records.len(), rate);
            if let Some(last) = records.last() {
                println!("  last: {}", last);
            }
        }
    }

    println!("\nLog files saved successfully!");
    Ok(())
}
