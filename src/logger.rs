//! `GyroLogger`: registry, recording settings and sampling session behind one handle

use crate::clock::{Clock, MonotonicClock};
use crate::config::LoggerConfig;
use crate::error::{GyroError, Result};
use crate::registry::{BringUpConfig, DeviceRegistry};
use crate::sampler::{RecordingControl, SamplingConfig, SamplingEngine, SessionSummary};
use crate::transport::{open_bus, Transport};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Multi-device gyro logger
///
/// Devices are registered while idle. A session moves the registry onto the
/// sampling thread until [`stop_session`](Self::stop_session) returns it.
pub struct GyroLogger {
    registry: Option<DeviceRegistry>,
    engine: Option<SamplingEngine>,
    control: Arc<RecordingControl>,
    clock: Arc<dyn Clock>,
    sampling: SamplingConfig,
}

impl GyroLogger {
    /// Create a logger over `transport`. Recording starts disabled.
    pub fn new(transport: Transport, bring_up: BringUpConfig, sampling: SamplingConfig) -> Self {
        Self {
            registry: Some(DeviceRegistry::new(transport, bring_up)),
            engine: None,
            control: Arc::new(RecordingControl::default()),
            clock: Arc::new(MonotonicClock::new()),
            sampling,
        }
    }

    /// Open the configured bus and apply the configured target rate
    ///
    /// Devices listed in `config.addresses` are not registered here.
    pub fn from_config(config: &LoggerConfig) -> Result<Self> {
        let driver = open_bus(&config.bus)?;
        let logger = Self::new(
            Transport::new(driver),
            config.bring_up.clone(),
            config.sampling.clone(),
        );
        logger.control.configure(false, config.rate_hz)?;
        Ok(logger)
    }

    /// Replace the time source used by later sessions
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn registry_mut(&mut self) -> Result<&mut DeviceRegistry> {
        if self.engine.is_some() {
            return Err(GyroError::SessionActive);
        }
        self.registry.as_mut().ok_or(GyroError::RegistryLost)
    }

    /// Bring up the device at `address`; returns its logging index
    pub fn register_device(&mut self, address: u8) -> Result<usize> {
        self.registry_mut()?.register_device(address)
    }

    /// True iff devices are registered and all of them answer
    ///
    /// During a session the answer is the worker's latest observation.
    pub fn health_check(&mut self) -> bool {
        if let Some(engine) = &self.engine {
            return engine.is_healthy();
        }
        self.registry.as_mut().map_or(false, DeviceRegistry::status_check)
    }

    /// Enable or disable recording and set the per-device target rate
    pub fn configure_recording(&self, enabled: bool, target_rate_hz: u32) -> Result<()> {
        self.control.configure(enabled, target_rate_hz)?;
        info!(enabled, rate_hz = target_rate_hz, "Recording configured");
        Ok(())
    }

    pub fn recording_enabled(&self) -> bool {
        self.control.is_enabled()
    }

    pub fn target_rate_hz(&self) -> u32 {
        self.control.rate_hz()
    }

    /// Start sampling into `output_dir`, stopping any running session first
    pub fn start_session<P: AsRef<Path>>(&mut self, output_dir: P) -> Result<()> {
        if self.engine.is_some() {
            self.stop_session()?;
        }

        let registry = self.registry.take().ok_or(GyroError::RegistryLost)?;
        if registry.is_empty() {
            warn!("Starting a session with no registered devices");
        }

        match SamplingEngine::start(
            registry,
            output_dir,
            Arc::clone(&self.control),
            Arc::clone(&self.clock),
            self.sampling.clone(),
        ) {
            Ok(engine) => {
                self.engine = Some(engine);
                Ok(())
            }
            Err((registry, e)) => {
                self.registry = registry;
                Err(e)
            }
        }
    }

    /// Stop the running session and wait for the worker
    ///
    /// Returns `Ok(None)` when no session was running.
    pub fn stop_session(&mut self) -> Result<Option<SessionSummary>> {
        let Some(engine) = self.engine.take() else {
            return Ok(None);
        };
        let (registry, summary) = engine.stop()?;
        self.registry = Some(registry);
        Ok(Some(summary))
    }

    /// Persist buffered rows of the running session
    pub fn flush(&self) -> Result<()> {
        match &self.engine {
            Some(engine) => engine.flush(),
            None => Ok(()),
        }
    }

    pub fn device_count(&self) -> usize {
        match (&self.engine, &self.registry) {
            (Some(engine), _) => engine.device_count(),
            (None, Some(registry)) => registry.len(),
            (None, None) => 0,
        }
    }

    /// Registered addresses in logging-index order; empty during a session
    pub fn addresses(&self) -> Vec<u8> {
        self.registry
            .as_ref()
            .map(DeviceRegistry::addresses)
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_some()
    }
}

impl Drop for GyroLogger {
    fn drop(&mut self) {
        if let Err(e) = self.stop_session() {
            warn!(error = %e, "failed to stop sampling session on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ism330dhcx::{ISM330DHCX_ADDRESS_HIGH, ISM330DHCX_ADDRESS_LOW};
    use crate::sink::{read_records, sink_path, SINK_HEADER};
    use crate::transport::mock::MockBus;
    use crate::transport::BusConfig;
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
    fn test_health_follows_registration() {
        let bus = MockBus::new();
        bus.add_sensor(ISM330DHCX_ADDRESS_LOW, 0x6B);
        let mut logger = logger_with(&bus);
        assert!(!logger.health_check());

        assert_eq!(logger.register_device(ISM330DHCX_ADDRESS_LOW).unwrap(), 0);
        assert!(logger.health_check());
        assert_eq!(logger.device_count(), 1);
    }

    #[test]
    fn test_wrong_identity_keeps_logger_unhealthy() {
        let bus = MockBus::new();
        bus.add_sensor(ISM330DHCX_ADDRESS_LOW, 0x00);
        let mut logger = logger_with(&bus);
        assert!(logger.register_device(ISM330DHCX_ADDRESS_LOW).is_err());
        assert_eq!(logger.device_count(), 0);
        assert!(!logger.health_check());
    }

    #[test]
    fn test_zero_rate_rejected() {
        let logger = logger_with(&MockBus::new());
        assert!(matches!(
            logger.configure_recording(true, 0),
            Err(GyroError::InvalidParameter(_))
        ));
        assert!(!logger.recording_enabled());
    }

    #[test]
    fn test_registration_refused_during_session() {
        let bus = MockBus::new();
        bus.add_sensor(ISM330DHCX_ADDRESS_LOW, 0x6B);
        bus.add_sensor(ISM330DHCX_ADDRESS_HIGH, 0x6B);
        let mut logger = logger_with(&bus);
        logger.register_device(ISM330DHCX_ADDRESS_LOW).unwrap();

        let dir = tempdir().unwrap();
        logger.start_session(dir.path()).unwrap();
        assert!(logger.is_running());
        assert!(matches!(
            logger.register_device(ISM330DHCX_ADDRESS_HIGH),
            Err(GyroError::SessionActive)
        ));
        assert_eq!(logger.device_count(), 1);

        logger.stop_session().unwrap();
        assert_eq!(logger.register_device(ISM330DHCX_ADDRESS_HIGH).unwrap(), 1);
    }

    #[test]
    fn test_stop_without_session_is_noop() {
        let mut logger = logger_with(&MockBus::new());
        assert!(logger.stop_session().unwrap().is_none());
        assert!(logger.flush().is_ok());
    }

    #[test]
    fn test_restart_does_not_duplicate_headers() {
        let bus = MockBus::new();
        bus.add_sensor(ISM330DHCX_ADDRESS_LOW, 0x6B);
        let mut logger = logger_with(&bus);
        logger.register_device(ISM330DHCX_ADDRESS_LOW).unwrap();
        logger.configure_recording(true, 500).unwrap();

        let dir = tempdir().unwrap();
        logger.start_session(dir.path()).unwrap();
        thread::sleep(Duration::from_millis(10));
        logger.start_session(dir.path()).unwrap();
        thread::sleep(Duration::from_millis(10));
        let summary = logger.stop_session().unwrap().unwrap();
        assert_eq!(summary.addresses, vec![ISM330DHCX_ADDRESS_LOW]);

        let contents = std::fs::read_to_string(sink_path(dir.path(), 0)).unwrap();
        assert_eq!(contents.matches(SINK_HEADER).count(), 1);
        assert!(read_records(sink_path(dir.path(), 0)).unwrap().len() >= 2);
    }

    #[test]
    fn test_unwritable_directory_keeps_registry() {
        let bus = MockBus::new();
        bus.add_sensor(ISM330DHCX_ADDRESS_LOW, 0x6B);
        let mut logger = logger_with(&bus);
        logger.register_device(ISM330DHCX_ADDRESS_LOW).unwrap();

        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        assert!(logger.start_session(blocker.join("out")).is_err());
        assert!(!logger.is_running());
        assert_eq!(logger.addresses(), vec![ISM330DHCX_ADDRESS_LOW]);
    }

    #[test]
    fn test_manual_clock_session_with_recording_disabled() {
        let bus = MockBus::new();
        bus.add_sensor(ISM330DHCX_ADDRESS_LOW, 0x6B);
        let clock = ManualClock::new();
        let mut logger = logger_with(&bus).with_clock(Arc::new(clock));
        logger.register_device(ISM330DHCX_ADDRESS_LOW).unwrap();

        let dir = tempdir().unwrap();
        logger.start_session(dir.path()).unwrap();
        thread::sleep(Duration::from_millis(5));
        assert!(logger.health_check());
        let summary = logger.stop_session().unwrap().unwrap();
        assert_eq!(summary.samples_per_device, vec![0]);
        assert!(read_records(sink_path(dir.path(), 0)).unwrap().is_empty());
    }

    fn wait_for_rows(logger: &GyroLogger, path: &Path, rows: usize) -> usize {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            logger.flush().unwrap();
            let found = read_records(path).unwrap().len();
            if found >= rows || std::time::Instant::now() >= deadline {
                return found;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_one_simulated_second_at_100_hz() {
        let bus = MockBus::new();
        bus.add_sensor(ISM330DHCX_ADDRESS_LOW, 0x6B);
        let clock = ManualClock::new();
        let mut logger = logger_with(&bus).with_clock(Arc::new(clock.clone()));

        assert_eq!(logger.register_device(ISM330DHCX_ADDRESS_LOW).unwrap(), 0);
        assert!(logger.health_check());
        logger.configure_recording(true, 100).unwrap();

        let dir = tempdir().unwrap();
        let path = sink_path(dir.path(), 0);
        logger.start_session(dir.path()).unwrap();
        assert_eq!(wait_for_rows(&logger, &path, 1), 1);

        for step in 1..100 {
            clock.advance(Duration::from_millis(10));
            assert_eq!(wait_for_rows(&logger, &path, step + 1), step + 1);
        }
        clock.advance(Duration::from_millis(9));
        thread::sleep(Duration::from_millis(5));

        let summary = logger.stop_session().unwrap().unwrap();
        let rows = read_records(&path).unwrap().len();
        assert!((99..=101).contains(&rows), "rows = {}", rows);
        assert_eq!(summary.samples_per_device, vec![rows as u64]);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.matches(SINK_HEADER).count(), 1);
    }

    #[test]
    fn test_from_config_with_mock_bus() {
        let config = LoggerConfig {
            bus: BusConfig::Mock {
                identity: 0x6B,
                data_ready: true,
            },
            rate_hz: 42,
            bring_up: BringUpConfig::immediate(),
            ..LoggerConfig::default()
        };
        let mut logger = GyroLogger::from_config(&config).unwrap();
        assert_eq!(logger.target_rate_hz(), 42);
        for &address in &config.addresses {
            logger.register_device(address).unwrap();
        }
        assert_eq!(logger.addresses(), vec![0x6A, 0x6B]);
        assert!(logger.health_check());
    }
}
