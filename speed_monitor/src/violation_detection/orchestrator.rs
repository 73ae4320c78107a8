//! Per-trigger sequencing of the violation pipeline.
//!
//! `Idle → Triggered → Capturing → Locating → Recognizing → Recording →
//! Notifying → Idle`. Every stage except `Notifying` may fall straight back
//! to `Idle`. Only capture and recording failures are logged as errors; the
//! other early exits are ordinary "nothing to do" outcomes. There is no
//! retry: each trigger gets exactly one pass.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn};

use super::evidence::EvidenceStore;
use super::frame_source::{CaptureError, FrameSource};
use super::notifier::{Delivery, Notifier, ViolationNotice};
use super::plate_locator::PlateLocator;
use super::store::{NewViolation, RecordError, ViolationId, ViolationStore};
use super::text_recognizer::{Recognition, TextRecognizer};
use super::{exceeds_threshold, Capture};
use crate::telemetry::{
    CAPTURE_FAILURES, NOTIFICATIONS_SENT, NOTIFICATION_FAILURES, PLATES_DETECTED,
    RECORD_FAILURES, TRIGGERS, TRIGGER_SECONDS, VIOLATIONS_DROPPED, VIOLATIONS_RECORDED,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Triggered,
    Capturing,
    Locating,
    Recognizing,
    Recording,
    Notifying,
}

/// How one trigger ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    BelowThreshold {
        speed: f64,
    },
    CaptureFailed,
    NoPlateDetected,
    NoTextRecognized,
    EvidenceFailed {
        plate: String,
    },
    /// The plate has no registered owner; the violation was discarded but the
    /// evidence image stays on disk.
    DriverNotFound {
        plate: String,
        image_path: PathBuf,
    },
    RecordFailed {
        plate: String,
    },
    Recorded {
        violation_id: ViolationId,
        plate: String,
        email: String,
        /// `None` when the notification attempt failed.
        delivery: Option<Delivery>,
    },
}

/// Count the trigger and grab a frame for it.
pub fn capture_for_trigger(
    speed: f64,
    source: &mut dyn FrameSource,
) -> Result<Capture, CaptureError> {
    TRIGGERS.inc();
    match source.capture() {
        Ok(frame) => Ok(Capture::now(frame, speed)),
        Err(err) => {
            CAPTURE_FAILURES.inc();
            error!("Capture failed for trigger at {speed:.1} m/s: {err}");
            Err(err)
        }
    }
}

pub struct Orchestrator {
    threshold: f64,
    locator: Box<dyn PlateLocator + Send>,
    recognizer: Box<dyn TextRecognizer + Send>,
    evidence: Box<dyn EvidenceStore + Send>,
    store: Arc<dyn ViolationStore>,
    notifier: Box<dyn Notifier>,
    stage: Stage,
}

impl Orchestrator {
    pub fn new(
        threshold: f64,
        locator: impl PlateLocator + Send + 'static,
        recognizer: impl TextRecognizer + Send + 'static,
        evidence: impl EvidenceStore + Send + 'static,
        store: Arc<dyn ViolationStore>,
        notifier: impl Notifier + 'static,
    ) -> Self {
        Self {
            threshold,
            locator: Box::new(locator),
            recognizer: Box::new(recognizer),
            evidence: Box::new(evidence),
            store,
            notifier: Box::new(notifier),
            stage: Stage::Idle,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn enter(&mut self, stage: Stage) {
        debug!("{:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }

    fn finish(&mut self, outcome: Outcome) -> Outcome {
        self.enter(Stage::Idle);
        outcome
    }

    /// Sequential path: check the speed, capture, then process the frame.
    pub fn run_once(&mut self, speed: f64, source: &mut dyn FrameSource) -> Outcome {
        if !exceeds_threshold(speed, self.threshold) {
            debug!(
                "Speed {speed:.1} m/s within the limit ({:.1} m/s)",
                self.threshold
            );
            return Outcome::BelowThreshold { speed };
        }

        self.enter(Stage::Triggered);
        self.enter(Stage::Capturing);
        match capture_for_trigger(speed, source) {
            Ok(capture) => self.process_capture(capture),
            Err(_) => self.finish(Outcome::CaptureFailed),
        }
    }

    /// Locate, recognise, record and notify for an already captured frame.
    pub fn process_capture(&mut self, capture: Capture) -> Outcome {
        let span = info_span!(
            "trigger",
            speed = capture.speed,
            plate = tracing::field::Empty
        );
        let _span_guard = span.enter();
        let _timer = TRIGGER_SECONDS.start_timer();

        if !exceeds_threshold(capture.speed, self.threshold) {
            return self.finish(Outcome::BelowThreshold {
                speed: capture.speed,
            });
        }

        self.enter(Stage::Locating);
        let candidates = match self.locator.locate(&capture.frame) {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!("Plate localisation failed: {err}");
                return self.finish(Outcome::NoPlateDetected);
            }
        };
        if candidates.is_empty() {
            debug!("No plate-shaped region in frame");
            return self.finish(Outcome::NoPlateDetected);
        }

        self.enter(Stage::Recognizing);
        let Some(recognition) = self.first_reading(&capture, &candidates) else {
            debug!("No text in {} candidate regions", candidates.len());
            return self.finish(Outcome::NoTextRecognized);
        };
        PLATES_DETECTED.inc();
        span.record("plate", recognition.text.as_str());
        info!(
            "Detected license plate {} (confidence {:.0})",
            recognition.text, recognition.confidence
        );
        let plate = recognition.text;

        self.enter(Stage::Recording);
        let timestamp = capture.timestamp();
        let image_path = match self.evidence.save(&capture.frame, &timestamp) {
            Ok(path) => path,
            Err(err) => {
                RECORD_FAILURES.inc();
                error!("Cannot save evidence for {plate}: {err}");
                return self.finish(Outcome::EvidenceFailed { plate });
            }
        };

        let violation = NewViolation {
            license_plate: plate.clone(),
            speed: capture.speed,
            timestamp: timestamp.clone(),
            image_path: image_path.clone(),
        };
        let recorded = match self.store.record_violation(&violation) {
            Ok(recorded) => recorded,
            Err(RecordError::DriverNotFound { plate }) => {
                VIOLATIONS_DROPPED.inc();
                warn!(
                    "No driver registered for {plate}, violation dropped (evidence kept at {})",
                    image_path.display()
                );
                return self.finish(Outcome::DriverNotFound { plate, image_path });
            }
            Err(err) => {
                RECORD_FAILURES.inc();
                error!("Cannot record violation for {plate}: {err}");
                return self.finish(Outcome::RecordFailed { plate });
            }
        };
        VIOLATIONS_RECORDED.inc();
        info!(
            "Violation #{} recorded for {plate}, {} total",
            recorded.violation_id, recorded.driver.violation_count
        );

        self.enter(Stage::Notifying);
        let notice = ViolationNotice {
            email: recorded.driver.email.clone(),
            speed: capture.speed,
            timestamp,
            image_path,
        };
        let delivery = match self.notifier.notify(&notice) {
            Ok(delivery) => {
                if delivery == Delivery::Sent {
                    NOTIFICATIONS_SENT.inc();
                }
                Some(delivery)
            }
            Err(err) => {
                NOTIFICATION_FAILURES.inc();
                warn!("Notification to {} failed: {err}", notice.email);
                None
            }
        };

        self.finish(Outcome::Recorded {
            violation_id: recorded.violation_id,
            plate,
            email: notice.email,
            delivery,
        })
    }

    fn first_reading(
        &mut self,
        capture: &Capture,
        candidates: &[opencv::core::Rect],
    ) -> Option<Recognition> {
        for region in candidates {
            match self.recognizer.recognize(&capture.frame, *region) {
                Ok(Some(recognition)) => return Some(recognition),
                Ok(None) => debug!("No text in region {region:?}"),
                Err(err) => warn!("Text recognition failed on {region:?}: {err}"),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::violation_detection::evidence::EvidenceError;
    use crate::violation_detection::notifier::{DisabledNotifier, NotifyError};
    use crate::violation_detection::sqlite_store::SqliteStore;
    use crate::violation_detection::store::NewDriver;
    use crate::violation_detection::text_recognizer::RecognizeError;
    use opencv::core::Rect;
    use opencv::prelude::Mat;
    use std::path::Path;

    struct OneRegion;
    impl PlateLocator for OneRegion {
        fn locate(&self, _frame: &Mat) -> opencv::Result<Vec<Rect>> {
            Ok(vec![Rect::new(10, 10, 120, 40)])
        }
    }

    struct Reads(&'static str);
    impl TextRecognizer for Reads {
        fn recognize(
            &mut self,
            _frame: &Mat,
            _region: Rect,
        ) -> Result<Option<Recognition>, RecognizeError> {
            Ok(Some(Recognition {
                text: self.0.to_string(),
                confidence: 90.0,
            }))
        }
    }

    struct FixedPath;
    impl EvidenceStore for FixedPath {
        fn save(&mut self, _frame: &Mat, timestamp: &str) -> Result<PathBuf, EvidenceError> {
            Ok(Path::new("captured_images").join(format!("violation_{timestamp}.jpg")))
        }
    }

    struct Failing;
    impl Notifier for Failing {
        fn notify(&self, notice: &ViolationNotice) -> Result<Delivery, NotifyError> {
            Err(NotifyError::Timestamp(notice.timestamp.clone()))
        }
    }

    struct NoFrame;
    impl FrameSource for NoFrame {
        fn capture(&mut self) -> Result<Mat, CaptureError> {
            Err(CaptureError::EmptyFrame)
        }
    }

    fn store() -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .add_driver(&NewDriver::new("ABC123", "Ada", "x@y.z"))
            .unwrap();
        store
    }

    #[test]
    fn capture_failure_returns_to_idle() {
        let mut orchestrator = Orchestrator::new(
            7.0,
            OneRegion,
            Reads("ABC123"),
            FixedPath,
            store(),
            DisabledNotifier,
        );
        assert_eq!(orchestrator.run_once(9.0, &mut NoFrame), Outcome::CaptureFailed);
        assert_eq!(orchestrator.stage(), Stage::Idle);
    }

    #[test]
    fn failed_notification_keeps_violation() {
        let store = store();
        let mut orchestrator = Orchestrator::new(
            7.0,
            OneRegion,
            Reads("ABC123"),
            FixedPath,
            store.clone(),
            Failing,
        );

        let outcome = orchestrator.process_capture(Capture::now(Mat::default(), 9.0));
        assert!(matches!(outcome, Outcome::Recorded { delivery: None, .. }));
        assert_eq!(orchestrator.stage(), Stage::Idle);
        assert_eq!(store.driver("ABC123").unwrap().unwrap().violation_count, 1);
    }

    #[test]
    fn unknown_plate_is_dropped_with_evidence_path() {
        let store = store();
        let mut orchestrator = Orchestrator::new(
            7.0,
            OneRegion,
            Reads("ZZZ999"),
            FixedPath,
            store.clone(),
            DisabledNotifier,
        );

        match orchestrator.process_capture(Capture::now(Mat::default(), 9.0)) {
            Outcome::DriverNotFound { plate, image_path } => {
                assert_eq!(plate, "ZZZ999");
                assert!(image_path.starts_with("captured_images"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(store.recent_violations(10).unwrap().is_empty());
    }
}
