use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use speed_monitor::config::Config;
use speed_monitor::telemetry::init_tracing;
use speed_monitor::violation_detection::evidence::JpegEvidenceStore;
use speed_monitor::violation_detection::frame_source::StillImageSource;
use speed_monitor::violation_detection::notifier::{notifier_from_env, Delivery};
use speed_monitor::violation_detection::orchestrator::{Orchestrator, Outcome};
use speed_monitor::violation_detection::plate_locator::ContourPlateLocator;
use speed_monitor::violation_detection::sqlite_store::SqliteStore;
use speed_monitor::violation_detection::text_recognizer::TesseractRecognizer;

/// Run one still image through the violation pipeline as if the sensor had
/// reported `speed`.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Image of the passing vehicle.
    #[arg(short, long)]
    image: PathBuf,

    /// Measured speed in m/s.
    #[arg(short, long)]
    speed: f64,

    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database file, overrides the configuration.
    #[arg(long)]
    db: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut config = Config::load_or_default(args.config.as_deref())?;
    if let Some(db) = args.db {
        config.storage.database_path = db;
    }

    let store = SqliteStore::open(&config.storage.database_path).with_context(|| {
        format!(
            "cannot open database {}",
            config.storage.database_path.display()
        )
    })?;
    let mut orchestrator = Orchestrator::new(
        config.threshold_mps,
        ContourPlateLocator::from_config(&config.locator),
        TesseractRecognizer::new(&config.ocr)?,
        JpegEvidenceStore::new(&config.storage.evidence_dir)?,
        Arc::new(store),
        notifier_from_env(&config.notification)?,
    );

    println!("Received speed: {:.1} m/s", args.speed);
    let mut source = StillImageSource::new(&args.image);
    match orchestrator.run_once(args.speed, &mut source) {
        Outcome::BelowThreshold { .. } => println!(
            "Speed is within the limit ({:.1} m/s). No action taken.",
            orchestrator.threshold()
        ),
        Outcome::CaptureFailed => {
            println!("Could not read image {}.", args.image.display())
        }
        Outcome::NoPlateDetected | Outcome::NoTextRecognized => {
            println!("No license plate detected.")
        }
        Outcome::EvidenceFailed { plate } | Outcome::RecordFailed { plate } => {
            println!("Detected license plate: {plate}");
            println!("Violation could not be recorded.");
        }
        Outcome::DriverNotFound { plate, .. } => {
            println!("Detected license plate: {plate}");
            println!("Driver not found in database. No email sent.");
        }
        Outcome::Recorded {
            plate,
            email,
            delivery,
            ..
        } => {
            println!("Detected license plate: {plate}");
            match delivery {
                Some(Delivery::Sent) => println!("Violation logged and email sent to {email}"),
                Some(Delivery::Disabled) => {
                    println!("Violation logged. Email disabled, nothing sent to {email}")
                }
                None => println!("Violation logged but the email to {email} failed."),
            }
        }
    }
    Ok(())
}
