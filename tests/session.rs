//! Drives the public `GyroLogger` surface through a real sampling thread

use gyro_sensor_interface::sink::SINK_HEADER;
use gyro_sensor_interface::transport::mock::MockBus;
use gyro_sensor_interface::{
    read_records, sink_path, BringUpConfig, GyroLogger, SamplingConfig, Transport,
    ISM330DHCX_ADDRESS_HIGH, ISM330DHCX_ADDRESS_LOW,
};
use std::fs;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn logger_with(bus: &MockBus) -> GyroLogger {
    GyroLogger::new(
        Transport::new(Box::new(bus.clone())),
        BringUpConfig::immediate(),
        SamplingConfig::default(),
    )
}

#[test]
fn records_every_registered_device() {
    let bus = MockBus::new();
    bus.add_sensor(ISM330DHCX_ADDRESS_LOW, 0x6B);
    bus.add_sensor(ISM330DHCX_ADDRESS_HIGH, 0x6B);
    bus.set_gyro(ISM330DHCX_ADDRESS_LOW, [1, 2, 3]);
    bus.set_gyro(ISM330DHCX_ADDRESS_HIGH, [-4, -5, -6]);

    let mut logger = logger_with(&bus);
    assert_eq!(logger.register_device(ISM330DHCX_ADDRESS_LOW).unwrap(), 0);
    assert_eq!(logger.register_device(ISM330DHCX_ADDRESS_HIGH).unwrap(), 1);
    assert!(logger.health_check());

    let dir = tempdir().unwrap();
    logger.configure_recording(true, 200).unwrap();
    logger.start_session(dir.path()).unwrap();
    thread::sleep(Duration::from_millis(100));
    logger.flush().unwrap();
    assert!(!read_records(sink_path(dir.path(), 0)).unwrap().is_empty());

    let summary = logger.stop_session().unwrap().unwrap();
    assert!(!logger.is_running());
    assert_eq!(summary.addresses, vec![ISM330DHCX_ADDRESS_LOW, ISM330DHCX_ADDRESS_HIGH]);

    for (index, expected) in [(0, (1, 2, 3)), (1, (-4, -5, -6))] {
        let path = sink_path(dir.path(), index);
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with(SINK_HEADER));
        assert_eq!(contents.matches(SINK_HEADER).count(), 1);

        let records = read_records(&path).unwrap();
        assert_eq!(records.len() as u64, summary.samples_per_device[index]);
        assert!(!records.is_empty());
        // 200 Hz over ~100 ms, with generous slack for scheduling
        assert!(records.len() <= 40, "sensor{} has {} rows", index, records.len());
        for record in &records {
            assert_eq!((record.reading.x, record.reading.y, record.reading.z), expected);
        }
        assert!(records.windows(2).all(|w| w[0].timestamp_ns <= w[1].timestamp_ns));
    }
}

#[test]
fn live_reconfiguration_pauses_recording() {
    let bus = MockBus::new();
    bus.add_sensor(ISM330DHCX_ADDRESS_LOW, 0x6B);
    let mut logger = logger_with(&bus);
    logger.register_device(ISM330DHCX_ADDRESS_LOW).unwrap();

    let dir = tempdir().unwrap();
    logger.configure_recording(true, 1000).unwrap();
    logger.start_session(dir.path()).unwrap();
    thread::sleep(Duration::from_millis(20));

    logger.configure_recording(false, 1000).unwrap();
    thread::sleep(Duration::from_millis(20));
    logger.flush().unwrap();
    let paused = read_records(sink_path(dir.path(), 0)).unwrap().len();
    thread::sleep(Duration::from_millis(20));
    logger.flush().unwrap();
    assert_eq!(read_records(sink_path(dir.path(), 0)).unwrap().len(), paused);

    let summary = logger.stop_session().unwrap().unwrap();
    assert_eq!(summary.samples_per_device[0] as usize, paused);
}

#[test]
fn session_survives_a_vanished_device() {
    let bus = MockBus::new();
    bus.add_sensor(ISM330DHCX_ADDRESS_LOW, 0x6B);
    bus.add_sensor(ISM330DHCX_ADDRESS_HIGH, 0x6B);
    let mut logger = logger_with(&bus);
    logger.register_device(ISM330DHCX_ADDRESS_LOW).unwrap();
    logger.register_device(ISM330DHCX_ADDRESS_HIGH).unwrap();

    let dir = tempdir().unwrap();
    logger.configure_recording(true, 500).unwrap();
    logger.start_session(dir.path()).unwrap();
    thread::sleep(Duration::from_millis(10));
    bus.remove_sensor(ISM330DHCX_ADDRESS_LOW);
    thread::sleep(Duration::from_millis(30));
    assert!(!logger.health_check());

    let summary = logger.stop_session().unwrap().unwrap();
    assert!(summary.samples_per_device[1] > 0);
    assert!(!logger.health_check());
}

#[test]
fn wrong_identity_is_never_registered() {
    let bus = MockBus::new();
    bus.add_sensor(ISM330DHCX_ADDRESS_LOW, 0x00);
    let mut logger = logger_with(&bus);

    assert!(logger.register_device(ISM330DHCX_ADDRESS_LOW).is_err());
    assert_eq!(logger.device_count(), 0);
    assert!(!logger.health_check());
}
