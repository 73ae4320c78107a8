use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use crate::config::{SensorBackend, SensorConfig};
use crate::violation_detection::exceeds_threshold;

const SYSFS_GPIO: &str = "/sys/class/gpio";

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("cannot access sensor at {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unexpected sensor value {value:?} at {path:?}")]
    InvalidValue { path: PathBuf, value: String },
    #[error("scripted sensor needs a script_path")]
    MissingScript,
    #[error("sensor has no more readings")]
    Exhausted,
}

/// Source of trigger events.
///
/// `read_speed` returns `Ok(None)` while nothing is passing, otherwise the
/// measured speed in m/s. Digital sensors that only know "too fast" report a
/// fixed nominal speed.
pub trait SensorGate {
    fn read_speed(&mut self) -> Result<Option<f64>, SensorError>;
}

impl<S: SensorGate + ?Sized> SensorGate for Box<S> {
    fn read_speed(&mut self) -> Result<Option<f64>, SensorError> {
        (**self).read_speed()
    }
}

/// Digital overspeed line exposed through the sysfs GPIO interface.
pub struct GpioSensor {
    value_path: PathBuf,
    nominal_speed: f64,
}

impl GpioSensor {
    pub fn open(pin: u32, nominal_speed: f64) -> Result<Self, SensorError> {
        let base = Path::new(SYSFS_GPIO);
        let pin_dir = base.join(format!("gpio{pin}"));
        if !pin_dir.exists() {
            let export = base.join("export");
            fs::write(&export, pin.to_string()).map_err(|source| SensorError::Io {
                path: export.clone(),
                source,
            })?;
        }
        let direction = pin_dir.join("direction");
        fs::write(&direction, "in").map_err(|source| SensorError::Io {
            path: direction.clone(),
            source,
        })?;
        info!("GPIO sensor ready on pin {pin}");
        Ok(Self::from_value_path(pin_dir.join("value"), nominal_speed))
    }

    /// Reads an already configured line, e.g. a value file exported elsewhere.
    pub fn from_value_path(value_path: impl Into<PathBuf>, nominal_speed: f64) -> Self {
        Self {
            value_path: value_path.into(),
            nominal_speed,
        }
    }
}

impl SensorGate for GpioSensor {
    fn read_speed(&mut self) -> Result<Option<f64>, SensorError> {
        let raw = fs::read_to_string(&self.value_path).map_err(|source| SensorError::Io {
            path: self.value_path.clone(),
            source,
        })?;
        match raw.trim() {
            "1" => Ok(Some(self.nominal_speed)),
            "0" => Ok(None),
            other => Err(SensorError::InvalidValue {
                path: self.value_path.clone(),
                value: other.to_string(),
            }),
        }
    }
}

/// Replays a fixed list of readings, one per poll.
///
/// Script files hold one reading per line: a speed in m/s, or an empty line
/// or `-` for an idle poll. Lines starting with `#` are ignored.
pub struct ScriptedSensor {
    readings: VecDeque<Option<f64>>,
}

impl ScriptedSensor {
    pub fn from_readings(readings: impl IntoIterator<Item = Option<f64>>) -> Self {
        Self {
            readings: readings.into_iter().collect(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, SensorError> {
        let contents = fs::read_to_string(path).map_err(|source| SensorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut readings = VecDeque::new();
        for line in contents.lines().map(str::trim) {
            if line.starts_with('#') {
                continue;
            }
            if line.is_empty() || line == "-" {
                readings.push_back(None);
                continue;
            }
            let speed = line
                .parse::<f64>()
                .map_err(|_| SensorError::InvalidValue {
                    path: path.to_path_buf(),
                    value: line.to_string(),
                })?;
            readings.push_back(Some(speed));
        }
        Ok(Self { readings })
    }
}

impl SensorGate for ScriptedSensor {
    fn read_speed(&mut self) -> Result<Option<f64>, SensorError> {
        self.readings.pop_front().ok_or(SensorError::Exhausted)
    }
}

/// Always reports the same speed; non-positive speeds read as idle.
pub struct ConstantSensor {
    speed: f64,
}

impl ConstantSensor {
    pub fn new(speed: f64) -> Self {
        Self { speed }
    }
}

impl SensorGate for ConstantSensor {
    fn read_speed(&mut self) -> Result<Option<f64>, SensorError> {
        if self.speed > 0.0 {
            Ok(Some(self.speed))
        } else {
            Ok(None)
        }
    }
}

/// Suppresses repeated triggers while one vehicle stays in the sensor's view.
///
/// After an above-threshold reading is let through, further above-threshold
/// readings are reported as idle until `window` has elapsed. A zero window
/// disables suppression.
pub struct Cooldown<S> {
    inner: S,
    threshold: f64,
    window: Duration,
    last_trigger: Option<Instant>,
}

impl<S: SensorGate> Cooldown<S> {
    pub fn new(inner: S, threshold: f64, window: Duration) -> Self {
        Self {
            inner,
            threshold,
            window,
            last_trigger: None,
        }
    }
}

impl<S: SensorGate> SensorGate for Cooldown<S> {
    fn read_speed(&mut self) -> Result<Option<f64>, SensorError> {
        let Some(speed) = self.inner.read_speed()? else {
            return Ok(None);
        };
        if !exceeds_threshold(speed, self.threshold) {
            return Ok(Some(speed));
        }

        let now = Instant::now();
        if let Some(last) = self.last_trigger {
            if now.duration_since(last) < self.window {
                debug!("Trigger at {speed:.1} m/s suppressed by cooldown");
                return Ok(None);
            }
        }
        self.last_trigger = Some(now);
        Ok(Some(speed))
    }
}

/// Paces the sensor loop to one poll per interval.
pub struct PollLimiter {
    poll_control: Instant,
    poll_wait: Duration,
}

impl PollLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            poll_control: Instant::now(),
            poll_wait: interval,
        }
    }

    pub fn wait(&mut self) {
        let elapsed = self.poll_control.elapsed();

        if self.poll_wait > elapsed {
            spin_sleep::sleep(self.poll_wait - elapsed);
        }

        self.poll_control = Instant::now();
    }
}

/// Build the configured backend, wrapped in a cooldown.
pub fn sensor_from_config(
    config: &SensorConfig,
    threshold: f64,
) -> Result<Box<dyn SensorGate + Send>, SensorError> {
    let window = Duration::from_millis(config.cooldown_ms);
    let sensor: Box<dyn SensorGate + Send> = match config.backend {
        SensorBackend::Gpio => Box::new(Cooldown::new(
            GpioSensor::open(config.gpio_pin, config.nominal_speed_mps)?,
            threshold,
            window,
        )),
        SensorBackend::Scripted => {
            let path = config
                .script_path
                .as_deref()
                .ok_or(SensorError::MissingScript)?;
            Box::new(Cooldown::new(
                ScriptedSensor::from_path(path)?,
                threshold,
                window,
            ))
        }
        SensorBackend::Constant => Box::new(Cooldown::new(
            ConstantSensor::new(config.constant_speed_mps),
            threshold,
            window,
        )),
    };
    Ok(sensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::thread;

    fn temp_file(contents: &str) -> PathBuf {
        let path = env::temp_dir().join(format!("sensor-{}.txt", uuid::Uuid::new_v4()));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn gpio_line_high_reports_nominal_speed() {
        let path = temp_file("1\n");
        let mut sensor = GpioSensor::from_value_path(&path, 10.0);
        assert_eq!(sensor.read_speed().unwrap(), Some(10.0));

        fs::write(&path, "0\n").unwrap();
        assert_eq!(sensor.read_speed().unwrap(), None);

        fs::write(&path, "x\n").unwrap();
        assert!(matches!(
            sensor.read_speed(),
            Err(SensorError::InvalidValue { .. })
        ));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn script_file_parses_speeds_and_idle_polls() {
        let path = temp_file("# warmup\n-\n12.5\n\n3.0\n");
        let mut sensor = ScriptedSensor::from_path(&path).unwrap();
        assert_eq!(sensor.read_speed().unwrap(), None);
        assert_eq!(sensor.read_speed().unwrap(), Some(12.5));
        assert_eq!(sensor.read_speed().unwrap(), None);
        assert_eq!(sensor.read_speed().unwrap(), Some(3.0));
        assert!(matches!(sensor.read_speed(), Err(SensorError::Exhausted)));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn script_file_rejects_garbage() {
        let path = temp_file("fast\n");
        assert!(matches!(
            ScriptedSensor::from_path(&path),
            Err(SensorError::InvalidValue { .. })
        ));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn cooldown_suppresses_repeated_triggers() {
        let readings = [Some(9.0), Some(9.0), Some(5.0), Some(9.0)];
        let mut sensor = Cooldown::new(
            ScriptedSensor::from_readings(readings),
            7.0,
            Duration::from_secs(60),
        );
        assert_eq!(sensor.read_speed().unwrap(), Some(9.0));
        assert_eq!(sensor.read_speed().unwrap(), None);
        // Below-threshold readings pass through untouched.
        assert_eq!(sensor.read_speed().unwrap(), Some(5.0));
        assert_eq!(sensor.read_speed().unwrap(), None);
    }

    #[test]
    fn cooldown_releases_after_window() {
        let mut sensor = Cooldown::new(
            ScriptedSensor::from_readings([Some(9.0), Some(9.0)]),
            7.0,
            Duration::from_millis(20),
        );
        assert_eq!(sensor.read_speed().unwrap(), Some(9.0));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(sensor.read_speed().unwrap(), Some(9.0));
    }

    #[test]
    fn zero_window_keeps_every_trigger() {
        let mut sensor = Cooldown::new(ConstantSensor::new(8.0), 7.0, Duration::ZERO);
        for _ in 0..3 {
            assert_eq!(sensor.read_speed().unwrap(), Some(8.0));
        }
    }

    #[test]
    fn poll_limiter_waits_for_interval() {
        let mut limiter = PollLimiter::new(Duration::from_millis(30));
        let started = Instant::now();
        limiter.wait();
        limiter.wait();
        assert!(started.elapsed() >= Duration::from_millis(60));
    }
}
