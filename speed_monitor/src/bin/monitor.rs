use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pyroscope::PyroscopeAgent;
use pyroscope_pprofrs::{pprof_backend, PprofConfig};
use tracing::{info, warn};

use speed_monitor::config::Config;
use speed_monitor::telemetry::{init_tracing, render_metrics};
use speed_monitor::violation_detection::evidence::JpegEvidenceStore;
use speed_monitor::violation_detection::frame_source::frame_source_from_config;
use speed_monitor::violation_detection::graph::{build_live_graph, TriggerCapture, ViolationSink};
use speed_monitor::violation_detection::notifier::notifier_from_env;
use speed_monitor::violation_detection::orchestrator::Orchestrator;
use speed_monitor::violation_detection::plate_locator::ContourPlateLocator;
use speed_monitor::violation_detection::sensor_gate::sensor_from_config;
use speed_monitor::violation_detection::sqlite_store::SqliteStore;
use speed_monitor::violation_detection::text_recognizer::TesseractRecognizer;

/// Live speed monitoring: sensor → camera → plate → record → notify.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for the sensor to end.
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Pyroscope server URL, overrides the configuration.
    #[arg(long)]
    pyroscope_url: Option<String>,
}

fn build_sink(config: &Config) -> Result<ViolationSink> {
    let store = SqliteStore::open(&config.storage.database_path).with_context(|| {
        format!(
            "cannot open database {}",
            config.storage.database_path.display()
        )
    })?;
    let orchestrator = Orchestrator::new(
        config.threshold_mps,
        ContourPlateLocator::from_config(&config.locator),
        TesseractRecognizer::new(&config.ocr)?,
        JpegEvidenceStore::new(&config.storage.evidence_dir)?,
        Arc::new(store),
        notifier_from_env(&config.notification)?,
    );
    Ok(ViolationSink::new(orchestrator))
}

fn run(config: &Config, duration: Option<Duration>) -> Result<()> {
    let sensor = sensor_from_config(&config.sensor, config.threshold_mps)?;
    let source = frame_source_from_config(&config.camera)?;
    let trigger = TriggerCapture::new(
        sensor,
        source,
        config.threshold_mps,
        Duration::from_millis(config.sensor.poll_interval_ms),
    );
    let sink = build_sink(config)?;

    let (graph, done) = build_live_graph(trigger, sink, config.queue.capacity)?;
    info!(
        "Monitoring started, threshold {:.1} m/s",
        config.threshold_mps
    );

    match duration {
        Some(duration) => {
            if done.recv_timeout(duration).is_err() {
                info!("Run duration of {}s elapsed", duration.as_secs());
            }
        }
        None => {
            let _ = done.recv();
        }
    }

    graph.stop(true, None);
    info!("Monitoring stopped");
    Ok(())
}

fn report_metrics(config: &Config) -> Result<()> {
    let metrics = render_metrics()?;
    info!("Final metrics:\n{metrics}");
    if let Some(path) = &config.telemetry.metrics_path {
        fs::write(path, metrics)
            .with_context(|| format!("cannot write metrics to {}", path.display()))?;
    }
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut config = Config::load_or_default(args.config.as_deref())?;
    if args.pyroscope_url.is_some() {
        config.telemetry.pyroscope_url = args.pyroscope_url;
    }

    let agent = match &config.telemetry.pyroscope_url {
        Some(url) => {
            let agent = PyroscopeAgent::builder(url.clone(), "speed_monitor".to_string())
                .backend(pprof_backend(PprofConfig::new().sample_rate(100)))
                .build()?;
            info!("Profiling to {url}");
            Some(agent.start()?)
        }
        None => None,
    };

    let result = run(&config, args.duration_secs.map(Duration::from_secs));

    if let Some(agent) = agent {
        match agent.stop() {
            Ok(ready) => ready.shutdown(),
            Err(err) => warn!("Cannot stop profiler: {err}"),
        }
    }
    report_metrics(&config)?;
    result
}
