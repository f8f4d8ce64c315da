//! Background sampling engine
//!
//! The engine takes the [`DeviceRegistry`] by value, runs a [`SamplingLoop`] on a
//! dedicated `gyro-sampler` thread and hands the registry back from
//! [`SamplingEngine::stop`]. Only the worker touches the bus while a session runs.
//!
//! Each device is sampled at most once per `1 / rate_hz` seconds. The gate is a
//! pure timestamp comparison: a device whose last sample is `elapsed_ns` old is
//! due when `elapsed_ns * rate_hz >= 1e9`.

use crate::clock::Clock;
use crate::error::{GyroError, Result};
use crate::registry::DeviceRegistry;
use crate::sink::{SampleRecord, SinkSet};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Health refresh period while recording is paused
const IDLE_HEALTH_INTERVAL_NS: u64 = 100_000_000;

/// Target rate used until recording is configured
pub const DEFAULT_RATE_HZ: u32 = 300;

/// Worker tuning
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Consecutive missed polls after which a device's interval slot is consumed
    pub max_missed_polls: u32,
    /// Period of the worker's sink flush
    pub flush_interval_ms: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            max_missed_polls: 32,
            flush_interval_ms: 10_000,
        }
    }
}

/// Recording switch and target rate, readable by the worker on every pass
#[derive(Debug)]
pub struct RecordingControl {
    enabled: AtomicBool,
    rate_hz: AtomicU32,
}

impl RecordingControl {
    pub fn new(enabled: bool, rate_hz: u32) -> Result<Self> {
        validate_rate(rate_hz)?;
        Ok(Self {
            enabled: AtomicBool::new(enabled),
            rate_hz: AtomicU32::new(rate_hz),
        })
    }

    /// Update both settings; a zero rate is rejected and nothing changes
    pub fn configure(&self, enabled: bool, rate_hz: u32) -> Result<()> {
        validate_rate(rate_hz)?;
        self.rate_hz.store(rate_hz, Ordering::SeqCst);
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn rate_hz(&self) -> u32 {
        self.rate_hz.load(Ordering::SeqCst)
    }
}

impl Default for RecordingControl {
    /// Recording disabled at [`DEFAULT_RATE_HZ`]
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            rate_hz: AtomicU32::new(DEFAULT_RATE_HZ),
        }
    }
}

fn validate_rate(rate_hz: u32) -> Result<()> {
    if rate_hz == 0 {
        return Err(GyroError::InvalidParameter(
            "target rate must be at least 1 Hz".to_string(),
        ));
    }
    Ok(())
}

/// True when a device last sampled at `last_ns` is due again at `now_ns`
pub fn interval_elapsed(last_ns: Option<u64>, now_ns: u64, rate_hz: u32) -> bool {
    match last_ns {
        None => true,
        Some(last) => {
            let elapsed = now_ns.saturating_sub(last) as u128;
            elapsed * rate_hz as u128 >= NANOS_PER_SEC
        }
    }
}

/// Per-device session bookkeeping
#[derive(Debug, Clone, Default)]
struct DeviceSlot {
    last_sample_ns: Option<u64>,
    missed: u32,
    samples: u64,
}

/// Lock the shared sinks, recovering from a poisoned mutex
fn lock_sinks(sinks: &Mutex<SinkSet>) -> MutexGuard<'_, SinkSet> {
    sinks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One session's worth of sampling state, driven pass by pass
pub struct SamplingLoop {
    registry: DeviceRegistry,
    sinks: Arc<Mutex<SinkSet>>,
    control: Arc<RecordingControl>,
    clock: Arc<dyn Clock>,
    healthy: Arc<AtomicBool>,
    config: SamplingConfig,
    slots: Vec<DeviceSlot>,
    last_flush_ns: u64,
    last_idle_health_ns: Option<u64>,
}

impl SamplingLoop {
    pub fn new(
        registry: DeviceRegistry,
        sinks: Arc<Mutex<SinkSet>>,
        control: Arc<RecordingControl>,
        clock: Arc<dyn Clock>,
        config: SamplingConfig,
    ) -> Self {
        let slots = vec![DeviceSlot::default(); registry.len()];
        let last_flush_ns = clock.now_ns();
        Self {
            registry,
            sinks,
            control,
            clock,
            healthy: Arc::new(AtomicBool::new(false)),
            config,
            slots,
            last_flush_ns,
            last_idle_health_ns: None,
        }
    }

    /// Flag the loop refreshes with the registry's liveness after every pass
    pub fn health_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.healthy)
    }

    /// Visit every device once; returns the number of samples recorded
    ///
    /// `running` is checked before each device, so a stop request is honoured
    /// mid-pass.
    pub fn pass(&mut self, running: &AtomicBool) -> usize {
        if !self.control.is_enabled() {
            self.refresh_health_if_idle();
            return 0;
        }
        self.last_idle_health_ns = None;
        let rate_hz = self.control.rate_hz();
        let max_missed = self.config.max_missed_polls;

        let mut recorded = 0;
        let (bus, devices) = self.registry.parts_mut();
        for (index, (device, slot)) in devices.iter_mut().zip(self.slots.iter_mut()).enumerate() {
            if !running.load(Ordering::SeqCst) {
                break;
            }

            let now = self.clock.now_ns();
            if !interval_elapsed(slot.last_sample_ns, now, rate_hz) {
                continue;
            }

            if !device.is_connected(bus) {
                record_miss(slot, index, now, max_missed);
                continue;
            }

            let reading = match device.gyro_data_ready(bus) {
                Ok(true) => device.read_gyro(bus),
                Ok(false) => {
                    record_miss(slot, index, now, max_missed);
                    continue;
                }
                Err(e) => Err(e),
            };

            match reading {
                Ok(reading) => {
                    let record = SampleRecord {
                        timestamp_ns: self.clock.wall_ns(),
                        reading,
                    };
                    if let Err(e) = lock_sinks(&self.sinks).append(index, &record) {
                        warn!(index, error = %e, "failed to append sample");
                    }
                    trace!(index, x = reading.x, y = reading.y, z = reading.z, "sample");
                    slot.last_sample_ns = Some(now);
                    slot.missed = 0;
                    slot.samples += 1;
                    recorded += 1;
                }
                Err(e) => {
                    debug!(index, error = %e, "gyro read failed");
                    record_miss(slot, index, now, max_missed);
                }
            }
        }

        let healthy = !devices.is_empty() && devices.iter().all(|d| d.last_known_connected());
        self.healthy.store(healthy, Ordering::SeqCst);

        self.flush_if_due();
        recorded
    }

    /// Keep the health flag current while recording is paused
    fn refresh_health_if_idle(&mut self) {
        let now = self.clock.now_ns();
        if let Some(last) = self.last_idle_health_ns {
            if now.saturating_sub(last) < IDLE_HEALTH_INTERVAL_NS {
                return;
            }
        }
        self.last_idle_health_ns = Some(now);
        let (bus, devices) = self.registry.parts_mut();
        let healthy = !devices.is_empty()
            && devices
                .iter_mut()
                .fold(true, |all, device| device.is_connected(bus) && all);
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn flush_if_due(&mut self) {
        let now = self.clock.now_ns();
        let interval_ns = self.config.flush_interval_ms.saturating_mul(1_000_000);
        if now.saturating_sub(self.last_flush_ns) < interval_ns {
            return;
        }
        if let Err(e) = lock_sinks(&self.sinks).flush_all() {
            warn!(error = %e, "periodic flush failed");
        }
        self.last_flush_ns = now;
    }

    /// Run passes until `running` is cleared, then flush the sinks
    pub fn run(&mut self, running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            self.pass(running);
            if !self.control.is_enabled() {
                thread::yield_now();
            }
        }
        if let Err(e) = lock_sinks(&self.sinks).flush_all() {
            warn!(error = %e, "final flush failed");
        }
    }

    /// Samples recorded per device index during this session
    pub fn sample_counts(&self) -> Vec<u64> {
        self.slots.iter().map(|s| s.samples).collect()
    }

    pub fn into_registry(self) -> DeviceRegistry {
        self.registry
    }
}

fn record_miss(slot: &mut DeviceSlot, index: usize, now: u64, max_missed: u32) {
    slot.missed += 1;
    if slot.missed >= max_missed {
        debug!(index, missed = slot.missed, "device stalled; skipping interval");
        slot.last_sample_ns = Some(now);
        slot.missed = 0;
    }
}

/// Outcome of a finished session
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub output_dir: PathBuf,
    /// Bus address per device index
    pub addresses: Vec<u8>,
    pub samples_per_device: Vec<u64>,
    pub elapsed: Duration,
}

impl SessionSummary {
    pub fn total_samples(&self) -> u64 {
        self.samples_per_device.iter().sum()
    }

    /// Average recorded rate per device
    pub fn rates_hz(&self) -> Vec<f64> {
        let secs = self.elapsed.as_secs_f64();
        self.samples_per_device
            .iter()
            .map(|&n| if secs > 0.0 { n as f64 / secs } else { 0.0 })
            .collect()
    }
}

/// A running sampling session
pub struct SamplingEngine {
    running: Arc<AtomicBool>,
    healthy: Arc<AtomicBool>,
    sinks: Arc<Mutex<SinkSet>>,
    handle: JoinHandle<SamplingLoop>,
    output_dir: PathBuf,
    device_count: usize,
    started: Instant,
}

impl SamplingEngine {
    /// Open the sinks in `output_dir` and move `registry` onto the worker thread
    ///
    /// On error the registry is handed back untouched alongside the cause,
    /// except when the thread cannot be spawned, in which case it is lost.
    pub fn start<P: AsRef<Path>>(
        mut registry: DeviceRegistry,
        output_dir: P,
        control: Arc<RecordingControl>,
        clock: Arc<dyn Clock>,
        config: SamplingConfig,
    ) -> std::result::Result<Self, (Option<DeviceRegistry>, GyroError)> {
        let output_dir = output_dir.as_ref().to_path_buf();
        let sinks = match SinkSet::open(&output_dir, registry.len()) {
            Ok(sinks) => Arc::new(Mutex::new(sinks)),
            Err(e) => return Err((Some(registry), e)),
        };

        let device_count = registry.len();
        let initially_healthy = registry.status_check();
        let running = Arc::new(AtomicBool::new(true));
        let mut sampling = SamplingLoop::new(registry, Arc::clone(&sinks), control, clock, config);
        let healthy = sampling.health_flag();
        healthy.store(initially_healthy, Ordering::SeqCst);

        let worker_running = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("gyro-sampler".to_string())
            .spawn(move || {
                sampling.run(&worker_running);
                sampling
            })
            .map_err(|e| (None, GyroError::Io(e)))?;

        info!(
            dir = %output_dir.display(),
            devices = device_count,
            "Sampling session started"
        );
        Ok(Self {
            running,
            healthy,
            sinks,
            handle,
            output_dir,
            device_count,
            started: Instant::now(),
        })
    }

    /// Liveness of every device as last observed by the worker
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// Push buffered rows to disk without stopping the session
    pub fn flush(&self) -> Result<()> {
        lock_sinks(&self.sinks).flush_all()
    }

    /// Signal the worker, wait for it and close the sinks
    pub fn stop(self) -> Result<(DeviceRegistry, SessionSummary)> {
        self.running.store(false, Ordering::SeqCst);
        let joined = self.handle.join();
        let elapsed = self.started.elapsed();

        let close_result = lock_sinks(&self.sinks).close_all();
        let sampling = joined.map_err(|_| GyroError::WorkerPanicked)?;

        let samples_per_device = sampling.sample_counts();
        let registry = sampling.into_registry();
        let summary = SessionSummary {
            output_dir: self.output_dir,
            addresses: registry.addresses(),
            samples_per_device,
            elapsed,
        };
        info!(
            samples = summary.total_samples(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Sampling session stopped"
        );

        if let Err(e) = close_result {
            warn!(error = %e, "failed to close sinks cleanly");
        }
        Ok((registry, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ism330dhcx::{ISM330DHCX_ADDRESS_HIGH, ISM330DHCX_ADDRESS_LOW};
    use crate::registry::BringUpConfig;
    use crate::sink::{read_records, sink_path};
    use crate::transport::mock::MockBus;
    use crate::transport::Transport;
    use tempfile::tempdir;

    struct Harness {
        bus: MockBus,
        clock: ManualClock,
        control: Arc<RecordingControl>,
        sampling: SamplingLoop,
        running: AtomicBool,
        dir: tempfile::TempDir,
    }

    fn harness(addresses: &[u8], rate_hz: u32, config: SamplingConfig) -> Harness {
        let bus = MockBus::new();
        for &address in addresses {
            bus.add_sensor(address, 0x6B);
        }
        let mut registry =
            DeviceRegistry::new(Transport::new(Box::new(bus.clone())), BringUpConfig::immediate());
        for &address in addresses {
            registry.register_device(address).unwrap();
        }

        let dir = tempdir().unwrap();
        let sinks = Arc::new(Mutex::new(SinkSet::open(dir.path(), addresses.len()).unwrap()));
        let clock = ManualClock::new();
        let control = Arc::new(RecordingControl::new(true, rate_hz).unwrap());
        let sampling = SamplingLoop::new(
            registry,
            sinks,
            Arc::clone(&control),
            Arc::new(clock.clone()),
            config,
        );
        Harness {
            bus,
            clock,
            control,
            sampling,
            running: AtomicBool::new(true),
            dir,
        }
    }

    impl Harness {
        fn pass(&mut self) -> usize {
            self.sampling.pass(&self.running)
        }

        fn rows(&self, index: usize) -> usize {
            lock_sinks(&self.sampling.sinks).flush_all().unwrap();
            read_records(sink_path(self.dir.path(), index)).unwrap().len()
        }
    }

    #[test]
    fn test_interval_gate() {
        assert!(interval_elapsed(None, 0, 1));
        assert!(!interval_elapsed(Some(0), 9_999_999, 100));
        assert!(interval_elapsed(Some(0), 10_000_000, 100));
        assert!(!interval_elapsed(Some(5), 3, 100));
        assert!(interval_elapsed(Some(0), u64::MAX, u32::MAX));
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(RecordingControl::new(true, 0).is_err());
        let control = RecordingControl::new(false, 50).unwrap();
        assert!(control.configure(true, 0).is_err());
        assert!(!control.is_enabled());
        assert_eq!(control.rate_hz(), 50);
    }

    #[test]
    fn test_rate_limited_over_one_second() {
        let mut h = harness(&[ISM330DHCX_ADDRESS_LOW], 100, SamplingConfig::default());
        for _ in 0..1000 {
            h.pass();
            h.clock.advance(Duration::from_millis(1));
        }
        assert_eq!(h.sampling.sample_counts(), vec![100]);
        let rows = h.rows(0);
        assert!((99..=101).contains(&rows), "rows = {}", rows);
    }

    #[test]
    fn test_first_pass_is_immediate() {
        let mut h = harness(&[ISM330DHCX_ADDRESS_LOW, ISM330DHCX_ADDRESS_HIGH], 1, SamplingConfig::default());
        h.clock.set_ns(123);
        assert_eq!(h.pass(), 2);
        assert_eq!(h.pass(), 0);
        h.clock.advance(Duration::from_secs(1));
        assert_eq!(h.pass(), 2);
    }

    #[test]
    fn test_not_ready_is_retried_next_pass() {
        let mut h = harness(&[ISM330DHCX_ADDRESS_LOW], 100, SamplingConfig::default());
        h.bus.set_data_ready(false);
        assert_eq!(h.pass(), 0);
        h.bus.set_data_ready(true);
        // No time has passed, but the slot was not consumed by the miss
        assert_eq!(h.pass(), 1);
    }

    #[test]
    fn test_stalled_device_consumes_slot_after_bounded_misses() {
        let config = SamplingConfig {
            max_missed_polls: 3,
            ..SamplingConfig::default()
        };
        let mut h = harness(&[ISM330DHCX_ADDRESS_LOW], 100, config);
        h.bus.set_data_ready(false);
        for _ in 0..3 {
            h.pass();
        }
        h.bus.set_data_ready(true);
        assert_eq!(h.pass(), 0, "slot should be consumed after 3 misses");
        h.clock.advance(Duration::from_millis(10));
        assert_eq!(h.pass(), 1);
    }

    #[test]
    fn test_disconnected_device_does_not_stop_others() {
        let mut h = harness(&[ISM330DHCX_ADDRESS_LOW, ISM330DHCX_ADDRESS_HIGH], 100, SamplingConfig::default());
        h.bus.remove_sensor(ISM330DHCX_ADDRESS_LOW);
        assert_eq!(h.pass(), 1);
        assert_eq!(h.sampling.sample_counts(), vec![0, 1]);
        assert!(!h.sampling.health_flag().load(Ordering::SeqCst));
    }

    #[test]
    fn test_disabled_recording_takes_no_samples() {
        let mut h = harness(&[ISM330DHCX_ADDRESS_LOW], 100, SamplingConfig::default());
        h.control.configure(false, 100).unwrap();
        assert_eq!(h.pass(), 0);
        h.control.configure(true, 100).unwrap();
        assert_eq!(h.pass(), 1);
    }

    #[test]
    fn test_paused_session_keeps_health_current() {
        let mut h = harness(&[ISM330DHCX_ADDRESS_LOW], 100, SamplingConfig::default());
        let health = h.sampling.health_flag();
        h.control.configure(false, 100).unwrap();

        h.pass();
        assert!(health.load(Ordering::SeqCst));

        h.bus.remove_sensor(ISM330DHCX_ADDRESS_LOW);
        h.clock.advance(Duration::from_millis(100));
        h.pass();
        assert!(!health.load(Ordering::SeqCst));

        // Health refreshes are throttled while paused
        h.bus.add_sensor(ISM330DHCX_ADDRESS_LOW, 0x6B);
        h.clock.advance(Duration::from_millis(50));
        h.pass();
        assert!(!health.load(Ordering::SeqCst));

        h.clock.advance(Duration::from_millis(50));
        h.pass();
        assert!(health.load(Ordering::SeqCst));
        assert_eq!(h.sampling.sample_counts(), vec![0]);
    }

    #[test]
    fn test_stop_request_ends_pass() {
        let mut h = harness(&[ISM330DHCX_ADDRESS_LOW, ISM330DHCX_ADDRESS_HIGH], 100, SamplingConfig::default());
        h.running.store(false, Ordering::SeqCst);
        assert_eq!(h.pass(), 0);
    }

    #[test]
    fn test_records_carry_reading_and_wall_time() {
        let mut h = harness(&[ISM330DHCX_ADDRESS_LOW], 100, SamplingConfig::default());
        h.bus.set_gyro(ISM330DHCX_ADDRESS_LOW, [10, -20, 30]);
        h.clock.set_ns(5_000);
        h.pass();
        lock_sinks(&h.sampling.sinks).flush_all().unwrap();
        let records = read_records(sink_path(h.dir.path(), 0)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp_ns, 5_000);
        assert_eq!((records[0].reading.x, records[0].reading.y, records[0].reading.z), (10, -20, 30));
    }

    #[test]
    fn test_periodic_flush() {
        let config = SamplingConfig {
            flush_interval_ms: 100,
            ..SamplingConfig::default()
        };
        let mut h = harness(&[ISM330DHCX_ADDRESS_LOW], 100, config);
        h.pass();
        assert!(read_records(sink_path(h.dir.path(), 0)).unwrap().is_empty());
        h.clock.advance(Duration::from_millis(100));
        h.pass();
        assert_eq!(read_records(sink_path(h.dir.path(), 0)).unwrap().len(), 2);
    }

    #[test]
    fn test_engine_returns_registry() {
        let bus = MockBus::new();
        bus.add_sensor(ISM330DHCX_ADDRESS_LOW, 0x6B);
        let mut registry =
            DeviceRegistry::new(Transport::new(Box::new(bus.clone())), BringUpConfig::immediate());
        registry.register_device(ISM330DHCX_ADDRESS_LOW).unwrap();

        let dir = tempdir().unwrap();
        let control = Arc::new(RecordingControl::new(true, 1000).unwrap());
        let engine = match SamplingEngine::start(
            registry,
            dir.path(),
            control,
            Arc::new(crate::clock::MonotonicClock::new()),
            SamplingConfig::default(),
        ) {
            Ok(engine) => engine,
            Err((_, e)) => panic!("start failed: {}", e),
        };
        assert!(engine.is_healthy());
        thread::sleep(Duration::from_millis(20));
        engine.flush().unwrap();

        let (registry, summary) = engine.stop().unwrap();
        assert_eq!(registry.addresses(), vec![ISM330DHCX_ADDRESS_LOW]);
        assert_eq!(summary.addresses, vec![ISM330DHCX_ADDRESS_LOW]);
        assert!(summary.samples_per_device[0] >= 1);
        let rows = read_records(sink_path(dir.path(), 0)).unwrap().len() as u64;
        assert_eq!(rows, summary.samples_per_device[0]);
    }
}
