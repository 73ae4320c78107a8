pub mod config;
pub mod telemetry;
pub mod violation_detection;
