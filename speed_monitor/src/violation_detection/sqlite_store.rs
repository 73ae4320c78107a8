use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use super::store::{
    normalize_plate, Driver, NewDriver, NewViolation, RecordError, RecordedViolation, StoreError,
    TopViolator, ViolationId, ViolationStore, ViolationSummary,
};

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS drivers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    license_plate TEXT UNIQUE NOT NULL,
    email TEXT NOT NULL,
    violation_count INTEGER NOT NULL DEFAULT 0 CHECK (violation_count >= 0),
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS violations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    driver_id INTEGER NOT NULL REFERENCES drivers (id) ON DELETE CASCADE,
    license_plate TEXT NOT NULL,
    speed REAL NOT NULL CHECK (speed > 0),
    timestamp TEXT NOT NULL,
    image_path TEXT NOT NULL CHECK (image_path <> '')
);

CREATE INDEX IF NOT EXISTS violations_driver_id ON violations (driver_id);
";

const DRIVER_COLUMNS: &str = "id, license_plate, name, email, violation_count, created_at";

/// SQLite-backed store. One connection per store, serialised by a mutex;
/// separate processes sharing the file serialise on SQLite's write lock.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        info!("Opened violation store at {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn driver_from_row(row: &Row<'_>) -> rusqlite::Result<Driver> {
    Ok(Driver {
        id: row.get(0)?,
        license_plate: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        violation_count: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn driver_by_plate(conn: &Connection, license_plate: &str) -> rusqlite::Result<Option<Driver>> {
    conn.query_row(
        &format!("SELECT {DRIVER_COLUMNS} FROM drivers WHERE license_plate = ?1"),
        params![license_plate],
        driver_from_row,
    )
    .optional()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

impl ViolationStore for SqliteStore {
    fn add_driver(&self, driver: &NewDriver) -> Result<Driver, StoreError> {
        driver.validate()?;
        let plate = normalize_plate(&driver.license_plate);
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO drivers (name, license_plate, email) VALUES (?1, ?2, ?3)",
            params![driver.name, plate, driver.email],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::DuplicatePlate(plate));
            }
            Err(err) => return Err(err.into()),
        }
        let id = conn.last_insert_rowid();
        let created = conn.query_row(
            &format!("SELECT {DRIVER_COLUMNS} FROM drivers WHERE id = ?1"),
            params![id],
            driver_from_row,
        )?;
        debug!("Registered driver {} ({})", created.name, created.license_plate);
        Ok(created)
    }

    fn driver(&self, license_plate: &str) -> Result<Option<Driver>, StoreError> {
        let conn = self.lock()?;
        Ok(driver_by_plate(&conn, &normalize_plate(license_plate))?)
    }

    fn drivers(&self) -> Result<Vec<Driver>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DRIVER_COLUMNS} FROM drivers ORDER BY created_at DESC, id DESC"
        ))?;
        let drivers = stmt
            .query_map([], driver_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(drivers)
    }

    fn update_driver(
        &self,
        license_plate: &str,
        name: Option<&str>,
        email: Option<&str>,
    ) -> Result<bool, StoreError> {
        let name = non_blank(name);
        let email = non_blank(email);
        if name.is_none() && email.is_none() {
            return Ok(false);
        }
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE drivers
             SET name = COALESCE(?1, name), email = COALESCE(?2, email)
             WHERE license_plate = ?3",
            params![name, email, normalize_plate(license_plate)],
        )?;
        Ok(updated > 0)
    }

    fn delete_driver(&self, license_plate: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM drivers WHERE license_plate = ?1",
            params![normalize_plate(license_plate)],
        )?;
        Ok(deleted > 0)
    }

    fn record_violation(
        &self,
        violation: &NewViolation,
    ) -> Result<RecordedViolation, RecordError> {
        violation.validate()?;
        let plate = normalize_plate(&violation.license_plate);
        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock up front so the owner lookup and the
        // increment see the same row, also across processes.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(mut driver) = driver_by_plate(&tx, &plate)? else {
            return Err(RecordError::DriverNotFound { plate });
        };

        tx.execute(
            "INSERT INTO violations (driver_id, license_plate, speed, timestamp, image_path)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                driver.id,
                plate,
                violation.speed,
                violation.timestamp,
                violation.image_path.to_string_lossy().into_owned(),
            ],
        )?;
        let violation_id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE drivers SET violation_count = violation_count + 1 WHERE id = ?1",
            params![driver.id],
        )?;
        tx.commit()?;

        driver.violation_count += 1;
        Ok(RecordedViolation {
            violation_id,
            driver,
        })
    }

    fn recent_violations(&self, limit: usize) -> Result<Vec<ViolationSummary>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT v.id, v.timestamp, v.speed, d.name, d.license_plate, v.image_path
             FROM violations v
             JOIN drivers d ON v.driver_id = d.id
             ORDER BY v.timestamp DESC, v.id DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(ViolationSummary {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    speed: row.get(2)?,
                    driver_name: row.get(3)?,
                    license_plate: row.get(4)?,
                    image_path: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn top_violators(&self, limit: usize) -> Result<Vec<TopViolator>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT name, license_plate, violation_count
             FROM drivers
             ORDER BY violation_count DESC, id ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(TopViolator {
                    name: row.get(0)?,
                    license_plate: row.get(1)?,
                    violation_count: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn delete_violation(&self, id: ViolationId) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let driver_id: Option<i64> = tx
            .query_row(
                "SELECT driver_id FROM violations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(driver_id) = driver_id else {
            return Ok(false);
        };
        tx.execute("DELETE FROM violations WHERE id = ?1", params![id])?;
        tx.execute(
            "UPDATE drivers SET violation_count = MAX(violation_count - 1, 0) WHERE id = ?1",
            params![driver_id],
        )?;
        tx.commit()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread;

    fn violation(plate: &str, speed: f64, timestamp: &str) -> NewViolation {
        NewViolation {
            license_plate: plate.to_string(),
            speed,
            timestamp: timestamp.to_string(),
            image_path: PathBuf::from(format!("captured_images/violation_{timestamp}.jpg")),
        }
    }

    fn store_with(drivers: &[(&str, &str, &str)]) -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        for (plate, name, email) in drivers {
            store.add_driver(&NewDriver::new(*plate, *name, *email)).unwrap();
        }
        store
    }

    #[test]
    fn duplicate_plate_fails_without_mutation() {
        let store = store_with(&[("ABC123", "Ada", "ada@example.com")]);
        store.record_violation(&violation("ABC123", 9.0, "20240101_120000")).unwrap();

        let err = store
            .add_driver(&NewDriver::new("ABC123", "Mallory", "mallory@example.com"))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicatePlate(plate) if plate == "ABC123"));

        let driver = store.driver("ABC123").unwrap().unwrap();
        assert_eq!(driver.name, "Ada");
        assert_eq!(driver.email, "ada@example.com");
        assert_eq!(driver.violation_count, 1);
        assert_eq!(store.drivers().unwrap().len(), 1);
    }

    #[test]
    fn record_increments_owner_count() {
        let store = store_with(&[("ABC123", "Ada", "x@y.z")]);
        let recorded = store
            .record_violation(&violation("ABC123", 12.5, "20240101_120000"))
            .unwrap();
        assert_eq!(recorded.driver.violation_count, 1);
        assert_eq!(recorded.driver.email, "x@y.z");

        let listed = store.recent_violations(10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, recorded.violation_id);
        assert_eq!(listed[0].license_plate, "ABC123");
        assert_eq!(listed[0].driver_name, "Ada");
        approx::assert_relative_eq!(listed[0].speed, 12.5);
    }

    #[test]
    fn unknown_plate_persists_nothing() {
        let store = store_with(&[
            ("ABC123", "Ada", "ada@example.com"),
            ("XYZ789", "Bob", "bob@example.com"),
        ]);
        let err = store
            .record_violation(&violation("NOPE42", 15.0, "20240101_120000"))
            .unwrap_err();
        assert!(matches!(err, RecordError::DriverNotFound { plate } if plate == "NOPE42"));

        assert!(store.recent_violations(10).unwrap().is_empty());
        for driver in store.drivers().unwrap() {
            assert_eq!(driver.violation_count, 0);
        }
    }

    #[test]
    fn invalid_violation_is_rejected_before_storage() {
        let store = store_with(&[("ABC123", "Ada", "ada@example.com")]);
        let mut bad = violation("ABC123", 9.0, "20240101_120000");
        bad.image_path = PathBuf::new();
        assert!(matches!(
            store.record_violation(&bad),
            Err(RecordError::InvalidViolation(_))
        ));
        assert_eq!(store.driver("ABC123").unwrap().unwrap().violation_count, 0);
    }

    #[test]
    fn concurrent_records_do_not_lose_updates() {
        let store = Arc::new(store_with(&[("ABC123", "Ada", "ada@example.com")]));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..25 {
                        let ts = format!("20240101_{:02}{:04}", worker, i);
                        store.record_violation(&violation("ABC123", 9.0, &ts)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.driver("ABC123").unwrap().unwrap().violation_count, 200);
        assert_eq!(store.recent_violations(1000).unwrap().len(), 200);
    }

    #[test]
    fn separate_connections_serialise_on_the_file() {
        let path = env::temp_dir().join(format!("store-{}.db", uuid::Uuid::new_v4()));
        SqliteStore::open(&path)
            .unwrap()
            .add_driver(&NewDriver::new("ABC123", "Ada", "ada@example.com"))
            .unwrap();

        let stores: Vec<_> = (0..4).map(|_| SqliteStore::open(&path).unwrap()).collect();
        let handles: Vec<_> = stores
            .into_iter()
            .enumerate()
            .map(|(worker, store)| {
                thread::spawn(move || {
                    for i in 0..10 {
                        let ts = format!("20240101_{:02}{:04}", worker, i);
                        store.record_violation(&violation("ABC123", 9.0, &ts)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.driver("ABC123").unwrap().unwrap().violation_count, 40);
        drop(store);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn plates_match_regardless_of_case_and_spacing() {
        let store = store_with(&[("abc 123", "Ada", "x@y.z")]);
        assert_eq!(store.drivers().unwrap()[0].license_plate, "ABC123");

        let recorded = store
            .record_violation(&violation("ABC123", 12.5, "20240101_120000"))
            .unwrap();
        assert_eq!(recorded.driver.violation_count, 1);
        assert!(store.driver("abc123").unwrap().is_some());

        let err = store
            .add_driver(&NewDriver::new("Abc123", "Mallory", "m@example.com"))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicatePlate(plate) if plate == "ABC123"));

        assert!(store.update_driver("abc123", Some("Ada L"), None).unwrap());
        assert!(store.delete_driver(" abc123 ").unwrap());
    }

    #[test]
    fn update_driver_changes_only_given_fields() {
        let store = store_with(&[("ABC123", "Ada", "ada@example.com")]);
        assert!(!store.update_driver("ABC123", None, Some("  ")).unwrap());
        assert!(store.update_driver("ABC123", None, Some("ada@new.example")).unwrap());
        assert!(!store.update_driver("NOPE42", Some("Bob"), None).unwrap());

        let driver = store.driver("ABC123").unwrap().unwrap();
        assert_eq!(driver.name, "Ada");
        assert_eq!(driver.email, "ada@new.example");
    }

    #[test]
    fn deleting_driver_cascades_to_violations() {
        let store = store_with(&[
            ("ABC123", "Ada", "ada@example.com"),
            ("XYZ789", "Bob", "bob@example.com"),
        ]);
        store.record_violation(&violation("ABC123", 9.0, "20240101_120000")).unwrap();
        store.record_violation(&violation("XYZ789", 9.0, "20240101_120001")).unwrap();

        assert!(store.delete_driver("ABC123").unwrap());
        assert!(!store.delete_driver("ABC123").unwrap());

        let remaining = store.recent_violations(10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].license_plate, "XYZ789");
    }

    #[test]
    fn deleting_violation_keeps_count_in_step() {
        let store = store_with(&[("ABC123", "Ada", "ada@example.com")]);
        let first = store
            .record_violation(&violation("ABC123", 9.0, "20240101_120000"))
            .unwrap();
        store.record_violation(&violation("ABC123", 9.5, "20240101_120100")).unwrap();

        assert!(store.delete_violation(first.violation_id).unwrap());
        assert!(!store.delete_violation(first.violation_id).unwrap());
        assert_eq!(store.driver("ABC123").unwrap().unwrap().violation_count, 1);
    }

    #[test]
    fn listings_are_ordered() {
        let store = store_with(&[
            ("AAA111", "Ada", "ada@example.com"),
            ("BBB222", "Bob", "bob@example.com"),
        ]);
        store.record_violation(&violation("AAA111", 8.0, "20240101_080000")).unwrap();
        store.record_violation(&violation("BBB222", 9.0, "20240101_090000")).unwrap();
        store.record_violation(&violation("BBB222", 10.0, "20240101_100000")).unwrap();

        let recent = store.recent_violations(2).unwrap();
        assert_eq!(
            recent.iter().map(|v| v.timestamp.as_str()).collect::<Vec<_>>(),
            vec!["20240101_100000", "20240101_090000"]
        );

        let top = store.top_violators(5).unwrap();
        assert_eq!(top[0].license_plate, "BBB222");
        assert_eq!(top[0].violation_count, 2);
        assert_eq!(top[1].license_plate, "AAA111");
    }
}
