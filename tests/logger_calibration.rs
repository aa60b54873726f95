use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ellog::core::{AngleRecord, Clock, LogStore, ManualClock, StoreConfig, WriterLock};
use ellog::logger::{
    disable_z_reset, enable_z_reset, AngleSource, CalibrationPhase, Logger, LoggerConfig,
    SensorError, TickOutcome,
};
use ellog::Shutdown;
use tempfile::tempdir;

/// Replays a fixed list of readings. A pulse scripted with a reading is
/// visible to `poll_z_reset` until the next reading.
#[derive(Default)]
struct Scripted {
    readings: VecDeque<Result<(f64, bool), SensorError>>,
    pulse: bool,
    z_polls: usize,
}

impl Scripted {
    fn push(&mut self, angle: f64, pulse: bool) {
        self.readings.push_back(Ok((angle, pulse)));
    }
}

impl AngleSource for Scripted {
    fn read_angle(&mut self) -> Result<f64, SensorError> {
        let (angle, pulse) = self.readings.pop_front().unwrap_or(Err(SensorError::Timeout))?;
        self.pulse = pulse;
        Ok(angle)
    }

    fn poll_z_reset(&mut self) -> bool {
        self.z_polls += 1;
        std::mem::take(&mut self.pulse)
    }
}

fn config() -> LoggerConfig {
    LoggerConfig {
        sample_period: Duration::from_millis(5),
        lock_retries: 2,
        retry_backoff: Duration::from_millis(1),
        calibration_refresh: Duration::ZERO,
    }
}

#[test]
fn z_reset_flips_records_to_calibrated() {
    let dir = tempdir().expect("tempdir");
    let store = LogStore::open(dir.path()).expect("store open");
    let clock = Arc::new(ManualClock::new(1));

    let mut source = Scripted::default();
    source.push(10.0, false);
    source.push(12.5, false);
    source.push(20.0, true);
    source.push(21.5, false);
    let mut logger =
        Logger::new(store.clone(), source, Arc::clone(&clock), config()).expect("logger");
    assert_eq!(logger.phase(), CalibrationPhase::Disabled);

    logger.tick();
    clock.set(2);
    logger.tick();
    assert_eq!(logger.source_mut().z_polls, 0, "Z line ignored while disabled");

    enable_z_reset(dir.path()).expect("enable");
    clock.set(3);
    assert_eq!(
        logger.tick(),
        TickOutcome::Appended(AngleRecord::new(3, 0.0, true))
    );
    assert_eq!(logger.phase(), CalibrationPhase::Anchored { offset: 20.0 });
    clock.set(4);
    logger.tick();

    assert_eq!(
        store.read_all().expect("read"),
        vec![
            AngleRecord::new(1, 10.0, false),
            AngleRecord::new(2, 12.5, false),
            AngleRecord::new(3, 0.0, true),
            AngleRecord::new(4, 1.5, true),
        ]
    );
}

#[test]
fn records_stay_uncalibrated_until_pulse() {
    let dir = tempdir().expect("tempdir");
    enable_z_reset(dir.path()).expect("enable");
    let store = LogStore::open(dir.path()).expect("store open");

    let mut source = Scripted::default();
    source.push(5.0, false);
    source.push(6.0, false);
    source.push(7.0, true);
    let mut logger =
        Logger::new(store.clone(), source, ManualClock::new(10), config()).expect("logger");
    assert_eq!(logger.phase(), CalibrationPhase::AwaitingZReset);

    logger.tick();
    logger.tick();
    logger.tick();
    let flags: Vec<bool> = store
        .read_all()
        .expect("read")
        .iter()
        .map(|r| r.calibrated)
        .collect();
    assert_eq!(flags, vec![false, false, true]);

    disable_z_reset(dir.path()).expect("disable");
    logger.source_mut().push(8.0, false);
    assert_eq!(
        logger.tick(),
        TickOutcome::Appended(AngleRecord::new(10, 8.0, false))
    );
}

#[test]
fn sensor_error_drops_sample_and_continues() {
    let dir = tempdir().expect("tempdir");
    let store = LogStore::open(dir.path()).expect("store open");
    let mut source = Scripted::default();
    source.readings.push_back(Err(SensorError::Invalid("spike".into())));
    source.push(1.0, false);
    let mut logger =
        Logger::new(store.clone(), source, ManualClock::new(1), config()).expect("logger");

    assert_eq!(logger.tick(), TickOutcome::SensorDropped);
    assert!(matches!(logger.tick(), TickOutcome::Appended(_)));
    let stats = logger.stats();
    assert_eq!(stats.ticks, 2);
    assert_eq!(stats.sensor_errors, 1);
    assert_eq!(stats.appended, 1);
    assert_eq!(store.read_all().expect("read").len(), 1);
}

#[test]
fn busy_lock_drops_sample_after_bounded_retries() {
    let dir = tempdir().expect("tempdir");
    let store = LogStore::open_with_config(
        dir.path(),
        StoreConfig {
            lock_timeout: Duration::from_millis(10),
            ..StoreConfig::default()
        },
    )
    .expect("store open");
    let mut source = Scripted::default();
    source.push(1.0, false);
    source.push(2.0, false);
    let mut logger =
        Logger::new(store.clone(), source, ManualClock::new(1), config()).expect("logger");

    let held = WriterLock::try_acquire(store.lock_path())
        .expect("acquire")
        .expect("lock free");
    assert_eq!(logger.tick(), TickOutcome::LockDropped);
    drop(held);
    assert!(matches!(logger.tick(), TickOutcome::Appended(_)));
    assert_eq!(logger.stats().lock_drops, 1);
    assert_eq!(
        store.read_all().expect("read"),
        vec![AngleRecord::new(1, 2.0, false)]
    );
}

#[test]
fn run_stops_on_shutdown() {
    let dir = tempdir().expect("tempdir");
    let store = LogStore::open(dir.path()).expect("store open");
    let shutdown = Shutdown::new();
    let handle = {
        let shutdown = shutdown.clone();
        let store = store.clone();
        thread::spawn(move || {
            let source = ellog::logger::SimulatedEncoder::default();
            let mut logger = Logger::new(store, source, ellog::core::SystemClock, config())
                .expect("logger");
            logger.run(&shutdown)
        })
    };
    thread::sleep(Duration::from_millis(60));
    shutdown.trigger();
    let stats = handle.join().expect("logger thread");
    assert!(stats.appended > 0);
    assert_eq!(stats.appended as usize, store.read_all().expect("read").len());
    assert!(!store.lock_path().exists());
}

#[test]
fn non_finite_reading_is_a_sensor_error() {
    let dir = tempdir().expect("tempdir");
    let store = LogStore::open(dir.path()).expect("store open");
    let mut source = Scripted::default();
    source.push(f64::NAN, false);
    source.push(f64::INFINITY, false);
    source.push(4.0, false);
    let mut logger =
        Logger::new(store.clone(), source, ManualClock::new(1), config()).expect("logger");

    assert_eq!(logger.tick(), TickOutcome::SensorDropped);
    assert_eq!(logger.tick(), TickOutcome::SensorDropped);
    assert_eq!(
        logger.tick(),
        TickOutcome::Appended(AngleRecord::new(1, 4.0, false))
    );
    let stats = logger.stats();
    assert_eq!(stats.sensor_errors, 2);
    assert_eq!(stats.appended, 1);

    let chunk = store.tail_from(0).expect("tail");
    assert_eq!(chunk.skipped, 0);
    assert_eq!(chunk.records, vec![AngleRecord::new(1, 4.0, false)]);
}

#[test]
fn write_failure_drops_sample_and_recovers() {
    let dir = tempdir().expect("tempdir");
    let store = LogStore::open(dir.path()).expect("store open");
    let mut source = Scripted::default();
    source.push(1.0, false);
    source.push(2.0, false);
    let mut logger =
        Logger::new(store.clone(), source, ManualClock::new(5), config()).expect("logger");

    // A directory where the log belongs makes every open fail.
    std::fs::create_dir(store.log_path()).expect("block log path");
    assert_eq!(logger.tick(), TickOutcome::WriteFailed);
    let stats = logger.stats();
    assert_eq!(stats.write_failures, 1);
    assert_eq!(stats.lock_drops, 0);
    assert_eq!(stats.appended, 0);
    assert!(!store.lock_path().exists());

    std::fs::remove_dir(store.log_path()).expect("unblock log path");
    assert_eq!(
        logger.tick(),
        TickOutcome::Appended(AngleRecord::new(5, 2.0, false))
    );
    assert_eq!(logger.stats().write_failures, 1);
    assert_eq!(
        store.read_all().expect("read"),
        vec![AngleRecord::new(5, 2.0, false)]
    );
}

/// Reports whether the writer lock was held whenever a timestamp was taken.
struct LockWitness {
    lock_path: PathBuf,
    stamps: AtomicU64,
    unlocked_stamps: AtomicU64,
}

impl Clock for LockWitness {
    fn now(&self) -> u64 {
        if !self.lock_path.exists() {
            self.unlocked_stamps.fetch_add(1, Ordering::SeqCst);
        }
        self.stamps.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[test]
fn timestamp_is_taken_under_the_writer_lock() {
    let dir = tempdir().expect("tempdir");
    let store = LogStore::open(dir.path()).expect("store open");
    let clock = Arc::new(LockWitness {
        lock_path: store.lock_path().to_path_buf(),
        stamps: AtomicU64::new(0),
        unlocked_stamps: AtomicU64::new(0),
    });
    let mut source = Scripted::default();
    source.push(1.0, false);
    source.push(2.0, false);
    let mut logger =
        Logger::new(store.clone(), source, Arc::clone(&clock), config()).expect("logger");

    logger.tick();
    logger.tick();
    assert_eq!(clock.stamps.load(Ordering::SeqCst), 2);
    assert_eq!(clock.unlocked_stamps.load(Ordering::SeqCst), 0);
    assert_eq!(
        store.read_all().expect("read"),
        vec![AngleRecord::new(1, 1.0, false), AngleRecord::new(2, 2.0, false)]
    );
}

#[test]
fn competing_loggers_write_timestamps_in_file_order() {
    let dir = tempdir().expect("tempdir");
    let store = LogStore::open_with_config(
        dir.path(),
        StoreConfig {
            lock_timeout: Duration::from_secs(5),
            lock_poll: Duration::from_millis(1),
            sync_each_append: false,
        },
    )
    .expect("store open");

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || {
                let mut source = Scripted::default();
                for i in 0..40 {
                    source.push(i as f64, false);
                }
                let mut logger = Logger::new(store, source, ellog::core::SystemClock, config())
                    .expect("logger");
                for _ in 0..40 {
                    assert!(matches!(logger.tick(), TickOutcome::Appended(_)));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("logger thread");
    }

    let stamps: Vec<u64> = store
        .read_all()
        .expect("read")
        .iter()
        .map(|r| r.timestamp_ns)
        .collect();
    assert_eq!(stamps.len(), 120);
    assert!(stamps.windows(2).all(|pair| pair[0] <= pair[1]));
}
