//! Logging setup and process-wide pipeline counters.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, Encoder, Histogram, IntCounter, TextEncoder,
};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "speed_monitor=info";

/// Install the fmt subscriber, honouring `RUST_LOG` when set.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

lazy_static! {
    pub static ref TRIGGERS: IntCounter = register_int_counter!(
        "speed_monitor_triggers_total",
        "Sensor readings above the speed threshold"
    )
    .expect("metric can be registered");
    pub static ref CAPTURE_FAILURES: IntCounter = register_int_counter!(
        "speed_monitor_capture_failures_total",
        "Triggers lost because no frame could be captured"
    )
    .expect("metric can be registered");
    pub static ref PLATES_DETECTED: IntCounter = register_int_counter!(
        "speed_monitor_plates_detected_total",
        "Frames where a plate text was recognized"
    )
    .expect("metric can be registered");
    pub static ref VIOLATIONS_RECORDED: IntCounter = register_int_counter!(
        "speed_monitor_violations_recorded_total",
        "Violations persisted for a registered driver"
    )
    .expect("metric can be registered");
    pub static ref VIOLATIONS_DROPPED: IntCounter = register_int_counter!(
        "speed_monitor_violations_dropped_total",
        "Violations discarded because the plate has no registered driver"
    )
    .expect("metric can be registered");
    pub static ref RECORD_FAILURES: IntCounter = register_int_counter!(
        "speed_monitor_record_failures_total",
        "Violations lost to storage or evidence errors"
    )
    .expect("metric can be registered");
    pub static ref NOTIFICATIONS_SENT: IntCounter = register_int_counter!(
        "speed_monitor_notifications_sent_total",
        "Owner notifications handed to the mail transport"
    )
    .expect("metric can be registered");
    pub static ref NOTIFICATION_FAILURES: IntCounter = register_int_counter!(
        "speed_monitor_notification_failures_total",
        "Owner notifications that could not be delivered"
    )
    .expect("metric can be registered");
    pub static ref TRIGGER_SECONDS: Histogram = register_histogram!(
        "speed_monitor_trigger_seconds",
        "Time spent processing one captured trigger"
    )
    .expect("metric can be registered");
}

/// Prometheus text exposition of every registered metric.
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
