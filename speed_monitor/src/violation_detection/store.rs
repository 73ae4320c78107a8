//! Persistence interface for drivers and their violations.
//!
//! Every store implements the whole trait; there are no optional operations.
//! Implementations must keep two invariants:
//!
//! - a licence plate identifies at most one driver;
//! - a driver's `violation_count` equals the number of violations that
//!   reference it. Inserting a violation and bumping the count happen in one
//!   atomic unit, so concurrent recordings for one plate never lose an update.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

pub type ViolationId = i64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a driver with plate {0:?} already exists")]
    DuplicatePlate(String),
    #[error("invalid driver field: {0}")]
    InvalidField(&'static str),
    #[error("store lock poisoned")]
    Poisoned,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum RecordError {
    /// No registered driver owns the plate; nothing was persisted.
    #[error("no driver registered for plate {plate:?}")]
    DriverNotFound { plate: String },
    #[error("invalid violation: {0}")]
    InvalidViolation(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for RecordError {
    fn from(err: rusqlite::Error) -> Self {
        RecordError::Store(StoreError::Sqlite(err))
    }
}

/// Canonical plate form shared by registration, lookup and recognition:
/// whitespace removed, uppercased.
pub fn normalize_plate(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Driver {
    pub id: i64,
    pub license_plate: String,
    pub name: String,
    pub email: String,
    pub violation_count: i64,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewDriver {
    pub license_plate: String,
    pub name: String,
    pub email: String,
}

impl NewDriver {
    pub fn new(
        license_plate: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            license_plate: license_plate.into(),
            name: name.into(),
            email: email.into(),
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.license_plate.trim().is_empty() {
            return Err(StoreError::InvalidField("license_plate"));
        }
        if self.name.trim().is_empty() {
            return Err(StoreError::InvalidField("name"));
        }
        if self.email.trim().is_empty() {
            return Err(StoreError::InvalidField("email"));
        }
        Ok(())
    }
}

/// A violation about to be recorded.
#[derive(Debug, Clone)]
pub struct NewViolation {
    pub license_plate: String,
    /// Metres per second.
    pub speed: f64,
    /// `YYYYMMDD_HHMMSS`.
    pub timestamp: String,
    pub image_path: PathBuf,
}

impl NewViolation {
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.speed.is_nan() || self.speed <= 0.0 {
            return Err(RecordError::InvalidViolation("speed must be positive"));
        }
        if self.image_path.as_os_str().is_empty() {
            return Err(RecordError::InvalidViolation("image path is required"));
        }
        Ok(())
    }
}

/// Result of a successful recording: the new row and its owner after the
/// count was incremented.
#[derive(Debug, Clone)]
pub struct RecordedViolation {
    pub violation_id: ViolationId,
    pub driver: Driver,
}

/// Row of the recent-violations listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViolationSummary {
    pub id: ViolationId,
    pub timestamp: String,
    pub speed: f64,
    pub driver_name: String,
    pub license_plate: String,
    pub image_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopViolator {
    pub name: String,
    pub license_plate: String,
    pub violation_count: i64,
}

pub trait ViolationStore: Send + Sync {
    /// Register a driver. Fails with `DuplicatePlate` without touching the
    /// existing row when the plate is taken. Plates are compared in
    /// [`normalize_plate`] form throughout.
    fn add_driver(&self, driver: &NewDriver) -> Result<Driver, StoreError>;

    fn driver(&self, license_plate: &str) -> Result<Option<Driver>, StoreError>;

    /// All drivers, newest first.
    fn drivers(&self) -> Result<Vec<Driver>, StoreError>;

    /// Change name and/or email. Returns `false` when nothing was given or
    /// the plate is unknown.
    fn update_driver(
        &self,
        license_plate: &str,
        name: Option<&str>,
        email: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Remove a driver together with its violations.
    fn delete_driver(&self, license_plate: &str) -> Result<bool, StoreError>;

    /// Resolve the owner, insert the violation and increment the owner's
    /// count as one unit.
    fn record_violation(&self, violation: &NewViolation)
        -> Result<RecordedViolation, RecordError>;

    /// Most recent violations first.
    fn recent_violations(&self, limit: usize) -> Result<Vec<ViolationSummary>, StoreError>;

    fn top_violators(&self, limit: usize) -> Result<Vec<TopViolator>, StoreError>;

    /// Remove one violation and decrement its owner's count.
    fn delete_violation(&self, id: ViolationId) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plate_text_is_stripped_and_uppercased() {
        assert_eq!(normalize_plate(" abc 123\n"), "ABC123");
        assert_eq!(normalize_plate("\n \t"), "");
    }

    #[test]
    fn new_driver_requires_all_fields() {
        assert!(NewDriver::new("ABC123", "Ada", "ada@example.com").validate().is_ok());
        assert!(matches!(
            NewDriver::new(" ", "Ada", "ada@example.com").validate(),
            Err(StoreError::InvalidField("license_plate"))
        ));
        assert!(matches!(
            NewDriver::new("ABC123", "Ada", "").validate(),
            Err(StoreError::InvalidField("email"))
        ));
    }

    #[test]
    fn violation_requires_positive_speed_and_image() {
        let mut violation = NewViolation {
            license_plate: "ABC123".to_string(),
            speed: 12.5,
            timestamp: "20240101_120000".to_string(),
            image_path: PathBuf::from("captured_images/violation_20240101_120000.jpg"),
        };
        assert!(violation.validate().is_ok());

        violation.speed = 0.0;
        assert!(matches!(
            violation.validate(),
            Err(RecordError::InvalidViolation(_))
        ));

        violation.speed = f64::NAN;
        assert!(violation.validate().is_err());

        violation.speed = 12.5;
        violation.image_path = PathBuf::new();
        assert!(violation.validate().is_err());
    }
}
