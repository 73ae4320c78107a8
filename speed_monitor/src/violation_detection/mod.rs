pub mod evidence;
pub mod frame_source;
pub mod graph;
pub mod notifier;
pub mod orchestrator;
pub mod plate_locator;
pub mod sensor_gate;
pub mod sqlite_store;
pub mod store;
pub mod text_recognizer;

use chrono::{Local, NaiveDateTime};
use opencv::prelude::Mat;

/// Speeds strictly above this (m/s) are violations.
pub const SPEED_THRESHOLD_MPS: f64 = 7.0;

/// Event time format used for violation records and evidence file names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// `true` only when `speed` is strictly above `threshold`. NaN never triggers.
pub fn exceeds_threshold(speed: f64, threshold: f64) -> bool {
    speed > threshold
}

/// A frame grabbed in response to a trigger, with the speed that caused it.
#[derive(Clone)]
pub struct Capture {
    pub frame: Mat,
    pub speed: f64,
    pub captured_at: NaiveDateTime,
}

impl Capture {
    pub fn now(frame: Mat, speed: f64) -> Self {
        Self {
            frame,
            speed,
            captured_at: Local::now().naive_local(),
        }
    }

    pub fn timestamp(&self) -> String {
        self.captured_at.format(TIMESTAMP_FORMAT).to_string()
    }
}
