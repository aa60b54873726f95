//! Sensor abstraction sampled by the logger.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor read timed out")]
    Timeout,
    #[error("sensor io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sensor returned invalid value: {0}")]
    Invalid(String),
}

/// An angle sensor with a Z (index) reference line.
pub trait AngleSource: Send {
    /// Reads the current angle in degrees.
    fn read_angle(&mut self) -> Result<f64, SensorError>;

    /// Returns `true` if the Z line fired on the most recent sample, at most
    /// once per sample.
    fn poll_z_reset(&mut self) -> bool;
}

impl<S: AngleSource + ?Sized> AngleSource for Box<S> {
    fn read_angle(&mut self) -> Result<f64, SensorError> {
        (**self).read_angle()
    }

    fn poll_z_reset(&mut self) -> bool {
        (**self).poll_z_reset()
    }
}

/// Linear conversion from encoder counts to degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EncoderScale {
    pub zero_count: i64,
    pub counts_per_degree: f64,
}

impl Default for EncoderScale {
    // Calibration of the deployed elevation encoder.
    fn default() -> Self {
        Self {
            zero_count: 7062,
            counts_per_degree: 900.0,
        }
    }
}

impl EncoderScale {
    pub fn to_degrees(&self, count: i64) -> f64 {
        (count - self.zero_count) as f64 / self.counts_per_degree
    }
}

/// Encoder that sweeps back and forth between two counts and raises the Z
/// line every `index_every` samples. Stands in for hardware in demos.
#[derive(Debug)]
pub struct SimulatedEncoder {
    scale: EncoderScale,
    count: i64,
    step: i64,
    min_count: i64,
    max_count: i64,
    index_every: u64,
    samples: u64,
    index_latched: bool,
}

impl SimulatedEncoder {
    pub fn new(scale: EncoderScale, index_every: u64) -> Self {
        let min_count = scale.zero_count;
        Self {
            scale,
            count: min_count,
            step: 9,
            min_count,
            max_count: min_count + (90.0 * scale.counts_per_degree) as i64,
            index_every: index_every.max(1),
            samples: 0,
            index_latched: false,
        }
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = step;
        self
    }
}

impl Default for SimulatedEncoder {
    fn default() -> Self {
        Self::new(EncoderScale::default(), 50)
    }
}

impl AngleSource for SimulatedEncoder {
    fn read_angle(&mut self) -> Result<f64, SensorError> {
        let angle = self.scale.to_degrees(self.count);
        self.samples += 1;
        // The index line is only meaningful for the sample it fired on.
        self.index_latched = self.samples % self.index_every == 0;
        let next = self.count + self.step;
        if next > self.max_count || next < self.min_count {
            self.step = -self.step;
        }
        self.count += self.step;
        Ok(angle)
    }

    fn poll_z_reset(&mut self) -> bool {
        std::mem::take(&mut self.index_latched)
    }
}
