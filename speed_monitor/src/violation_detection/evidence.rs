use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use opencv::core::Vector;
use opencv::imgcodecs::imwrite;
use opencv::prelude::Mat;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("cannot prepare evidence directory {path:?}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("encoder refused to write {path:?}")]
    NotWritten { path: PathBuf },
    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
}

/// Keeps the captured frame that backs a violation.
pub trait EvidenceStore {
    /// Persist `frame` and return the path the violation record should reference.
    fn save(&mut self, frame: &Mat, timestamp: &str) -> Result<PathBuf, EvidenceError>;
}

impl<E: EvidenceStore + ?Sized> EvidenceStore for Box<E> {
    fn save(&mut self, frame: &Mat, timestamp: &str) -> Result<PathBuf, EvidenceError> {
        (**self).save(frame, timestamp)
    }
}

/// Writes `violation_<timestamp>.jpg` files into one directory.
pub struct JpegEvidenceStore {
    dir: PathBuf,
}

impl JpegEvidenceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, EvidenceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| EvidenceError::Directory {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// First free `violation_<timestamp>[_n].jpg` path in `dir`. Two triggers in
/// the same second must not overwrite each other's evidence.
pub fn evidence_path(dir: &Path, timestamp: &str) -> PathBuf {
    let path = dir.join(format!("violation_{timestamp}.jpg"));
    if !path.exists() {
        return path;
    }
    (1..)
        .map(|n| dir.join(format!("violation_{timestamp}_{n}.jpg")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}

impl EvidenceStore for JpegEvidenceStore {
    fn save(&mut self, frame: &Mat, timestamp: &str) -> Result<PathBuf, EvidenceError> {
        let path = evidence_path(&self.dir, timestamp);
        let written = imwrite(&path.to_string_lossy(), frame, &Vector::new())?;
        if !written {
            return Err(EvidenceError::NotWritten { path });
        }
        debug!("Evidence written to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};
    use std::env;

    fn temp_dir() -> PathBuf {
        env::temp_dir().join(format!("evidence-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn same_second_captures_get_distinct_paths() {
        let dir = temp_dir();
        let mut store = JpegEvidenceStore::new(&dir).unwrap();
        let frame = Mat::new_rows_cols_with_default(48, 64, CV_8UC3, Scalar::all(90.0)).unwrap();

        let first = store.save(&frame, "20240101_120000").unwrap();
        let second = store.save(&frame, "20240101_120000").unwrap();

        assert_eq!(first, dir.join("violation_20240101_120000.jpg"));
        assert_eq!(second, dir.join("violation_20240101_120000_1.jpg"));
        assert!(first.exists() && second.exists());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn empty_frame_is_rejected() {
        let dir = temp_dir();
        let mut store = JpegEvidenceStore::new(&dir).unwrap();
        assert!(store.save(&Mat::default(), "20240101_120000").is_err());
        fs::remove_dir_all(dir).unwrap();
    }
}
