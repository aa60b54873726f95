//! Z-reset calibration: the on-disk switch and the per-logger phase machine.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::core::clock::now_ns;
use crate::core::store::CALIBRATION_FILE;
use crate::core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CalibrationState {
    pub z_reset_enabled: bool,
    #[serde(default)]
    pub updated_ns: u64,
}

pub fn calibration_path(dir: &Path) -> PathBuf {
    dir.join(CALIBRATION_FILE)
}

/// Reads the switch, `None` if it was never written.
pub fn load_calibration(dir: &Path) -> Result<Option<CalibrationState>> {
    let data = match std::fs::read(calibration_path(dir)) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(Error::Io(err)),
    };
    let state = serde_json::from_slice(&data)
        .map_err(|err| Error::Config(format!("calibration state: {err}")))?;
    Ok(Some(state))
}

/// Writes the switch atomically via write-then-rename.
pub fn store_calibration(dir: &Path, enabled: bool) -> Result<CalibrationState> {
    std::fs::create_dir_all(dir)?;
    let state = CalibrationState {
        z_reset_enabled: enabled,
        updated_ns: now_ns(),
    };
    let path = calibration_path(dir);
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(&state)
        .map_err(|err| Error::Config(format!("calibration state: {err}")))?;
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, &path)?;
    Ok(state)
}

pub fn enable_z_reset(dir: &Path) -> Result<CalibrationState> {
    store_calibration(dir, true)
}

pub fn disable_z_reset(dir: &Path) -> Result<CalibrationState> {
    store_calibration(dir, false)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationPhase {
    /// Detection off; records carry raw angles.
    Disabled,
    /// Detection on, no Z pulse seen yet.
    AwaitingZReset,
    /// Z pulse seen; angles are relative to the raw angle at that instant.
    Anchored { offset: f64 },
}

#[derive(Debug, Clone, Copy)]
pub struct Calibrator {
    phase: CalibrationPhase,
}

impl Calibrator {
    pub fn new(enabled: bool) -> Self {
        let phase = if enabled {
            CalibrationPhase::AwaitingZReset
        } else {
            CalibrationPhase::Disabled
        };
        Self { phase }
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    /// Disabling drops any anchor; enabling from disabled re-arms detection.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.phase = match (enabled, self.phase) {
            (false, _) => CalibrationPhase::Disabled,
            (true, CalibrationPhase::Disabled) => CalibrationPhase::AwaitingZReset,
            (true, phase) => phase,
        };
    }

    pub fn wants_z_reset(&self) -> bool {
        matches!(self.phase, CalibrationPhase::AwaitingZReset)
    }

    /// Maps a raw sample to `(angle, calibrated)`. `z_fired` anchors the
    /// offset at this very sample when detection is armed.
    pub fn apply(&mut self, raw: f64, z_fired: bool) -> (f64, bool) {
        if z_fired && self.wants_z_reset() {
            info!("Z reset observed, anchoring zero at raw angle {raw}");
            self.phase = CalibrationPhase::Anchored { offset: raw };
        }
        match self.phase {
            CalibrationPhase::Anchored { offset } => (raw - offset, true),
            _ => (raw, false),
        }
    }
}

/// Re-reads the calibration switch at most once per `refresh`.
#[derive(Debug)]
pub struct CalibrationWatch {
    dir: PathBuf,
    refresh: Duration,
    last_check: Option<Instant>,
    enabled: bool,
}

impl CalibrationWatch {
    pub fn new(dir: &Path, refresh: Duration) -> Self {
        Self {
            dir: dir.to_path_buf(),
            refresh,
            last_check: None,
            enabled: false,
        }
    }

    /// Current switch value; a missing or unreadable file keeps the last one.
    pub fn current(&mut self) -> bool {
        let due = self
            .last_check
            .map_or(true, |last| last.elapsed() >= self.refresh);
        if !due {
            return self.enabled;
        }
        self.last_check = Some(Instant::now());
        match load_calibration(&self.dir) {
            Ok(Some(state)) => {
                if state.z_reset_enabled != self.enabled {
                    info!(
                        "Z reset detection {}",
                        if state.z_reset_enabled { "enabled" } else { "disabled" }
                    );
                }
                self.enabled = state.z_reset_enabled;
            }
            Ok(None) => {}
            Err(err) => warn!("keeping calibration state, reload failed: {err}"),
        }
        self.enabled
    }
}
