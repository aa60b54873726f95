//! The writer process: samples the sensor at a fixed period and appends one
//! record per sample.
//!
//! Every fault inside a tick is contained: a failed sensor read, a lock that
//! stays busy, or a failed write drops that sample and the loop carries on
//! with the next tick.

pub mod calibration;
pub mod source;

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::core::{AngleRecord, Clock, Error, LogStore, Result};
use crate::shutdown::Shutdown;

pub use calibration::{
    disable_z_reset, enable_z_reset, load_calibration, CalibrationPhase, CalibrationState,
    CalibrationWatch, Calibrator,
};
pub use source::{AngleSource, EncoderScale, SensorError, SimulatedEncoder};

#[derive(Clone, Copy, Debug)]
pub struct LoggerConfig {
    pub sample_period: Duration,
    /// Extra attempts after a `LockTimeout` before the sample is dropped.
    pub lock_retries: u32,
    /// First retry delay; doubles on every further attempt.
    pub retry_backoff: Duration,
    /// How often the calibration switch is re-read from disk.
    pub calibration_refresh: Duration,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            sample_period: Duration::from_millis(100),
            lock_retries: 3,
            retry_backoff: Duration::from_millis(20),
            calibration_refresh: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TickOutcome {
    Appended(AngleRecord),
    SensorDropped,
    LockDropped,
    WriteFailed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoggerStats {
    pub ticks: u64,
    pub appended: u64,
    pub sensor_errors: u64,
    pub lock_drops: u64,
    pub write_failures: u64,
}

pub struct Logger<S, C> {
    store: LogStore,
    source: S,
    clock: C,
    config: LoggerConfig,
    calibrator: Calibrator,
    watch: CalibrationWatch,
    stats: LoggerStats,
}

/// Readings that cannot be written back as a record count as sensor faults.
fn finite(raw: f64) -> std::result::Result<f64, SensorError> {
    if raw.is_finite() {
        Ok(raw)
    } else {
        Err(SensorError::Invalid(format!("non-finite angle {raw}")))
    }
}

impl<S: AngleSource, C: Clock> Logger<S, C> {
    pub fn new(store: LogStore, source: S, clock: C, config: LoggerConfig) -> Result<Self> {
        if config.sample_period.is_zero() {
            return Err(Error::Config("sample period must be non-zero".into()));
        }
        let mut watch = CalibrationWatch::new(store.dir(), config.calibration_refresh);
        let calibrator = Calibrator::new(watch.current());
        Ok(Self {
            store,
            source,
            clock,
            config,
            calibrator,
            watch,
            stats: LoggerStats::default(),
        })
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.calibrator.phase()
    }

    pub fn stats(&self) -> LoggerStats {
        self.stats
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// One sampling cycle: read, calibrate, append. The timestamp is taken
    /// once the writer lock is held.
    pub fn tick(&mut self) -> TickOutcome {
        self.stats.ticks += 1;
        self.calibrator.set_enabled(self.watch.current());

        let raw = match self.source.read_angle().and_then(finite) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("sensor read failed, sample dropped: {err}");
                self.stats.sensor_errors += 1;
                return TickOutcome::SensorDropped;
            }
        };
        let z_fired = self.calibrator.wants_z_reset() && self.source.poll_z_reset();
        let (angle, calibrated) = self.calibrator.apply(raw, z_fired);

        let outcome = self.append_with_retry(angle, calibrated);
        if matches!(outcome, TickOutcome::Appended(_)) {
            self.stats.appended += 1;
        }
        outcome
    }

    fn append_with_retry(&mut self, angle: f64, calibrated: bool) -> TickOutcome {
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;
        loop {
            let clock = &self.clock;
            let result = self
                .store
                .append_with(|| AngleRecord::new(clock.now(), angle, calibrated));
            match result {
                Ok(record) => return TickOutcome::Appended(record),
                Err(Error::LockTimeout { waited, .. }) if attempt < self.config.lock_retries => {
                    attempt += 1;
                    debug!("writer lock busy for {waited:?}, retry {attempt}");
                    thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                }
                Err(err @ Error::LockTimeout { .. }) => {
                    error!("sample dropped after {} attempts: {err}", attempt + 1);
                    self.stats.lock_drops += 1;
                    return TickOutcome::LockDropped;
                }
                Err(err) => {
                    error!("sample dropped: {err}");
                    self.stats.write_failures += 1;
                    return TickOutcome::WriteFailed;
                }
            }
        }
    }

    /// Ticks every `sample_period` until `shutdown` is requested.
    pub fn run(&mut self, shutdown: &Shutdown) -> LoggerStats {
        info!(
            "logging to {} every {:?}",
            self.store.log_path().display(),
            self.config.sample_period
        );
        let period = self.config.sample_period;
        let mut deadline = Instant::now();
        while !shutdown.is_requested() {
            self.tick();
            deadline += period;
            let now = Instant::now();
            if deadline <= now {
                debug!("tick overran its period by {:?}", now - deadline);
                deadline = now;
            } else if shutdown.sleep(deadline - now) {
                break;
            }
        }
        info!(
            "logger stopped: ticks={} appended={} sensor_errors={} lock_drops={} write_failures={}",
            self.stats.ticks,
            self.stats.appended,
            self.stats.sensor_errors,
            self.stats.lock_drops,
            self.stats.write_failures
        );
        self.stats
    }
}
