use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use speed_monitor::config::Config;
use speed_monitor::telemetry::init_tracing;
use speed_monitor::violation_detection::sqlite_store::SqliteStore;
use speed_monitor::violation_detection::store::{NewDriver, ViolationId, ViolationStore};

/// Manage registered drivers and recorded violations.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database file, overrides the configuration.
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all drivers, newest first.
    List,
    /// Register a driver; the plate is stored uppercased without spaces.
    Add {
        plate: String,
        name: String,
        email: String,
    },
    /// Change a driver's name and/or email.
    Update {
        plate: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    /// Delete a driver and all of its violations.
    Delete { plate: String },
    /// Most recent violations.
    Recent {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Drivers with the most violations.
    Top {
        #[arg(short, long, default_value_t = 5)]
        limit: usize,
    },
    /// Delete one violation and decrement its driver's count.
    DeleteViolation { id: ViolationId },
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = Config::load_or_default(args.config.as_deref())?;
    let path = args.db.unwrap_or(config.storage.database_path);
    let store = SqliteStore::open(&path)
        .with_context(|| format!("cannot open database {}", path.display()))?;

    match args.command {
        Command::List => {
            for driver in store.drivers()? {
                println!(
                    "{:<12} {:<24} {:<32} {:>4}  {}",
                    driver.license_plate,
                    driver.name,
                    driver.email,
                    driver.violation_count,
                    driver.created_at
                );
            }
        }
        Command::Add { plate, name, email } => {
            let driver = store.add_driver(&NewDriver::new(plate, name, email))?;
            println!("Added driver {} ({})", driver.name, driver.license_plate);
        }
        Command::Update { plate, name, email } => {
            if !store.update_driver(&plate, name.as_deref(), email.as_deref())? {
                bail!("nothing updated for plate {plate}");
            }
            println!("Updated driver {plate}");
        }
        Command::Delete { plate } => {
            if !store.delete_driver(&plate)? {
                bail!("no driver registered for plate {plate}");
            }
            println!("Deleted driver {plate}");
        }
        Command::Recent { limit } => {
            for violation in store.recent_violations(limit)? {
                println!(
                    "#{:<6} {}  {:>6.1} m/s  {:<12} {:<24} {}",
                    violation.id,
                    violation.timestamp,
                    violation.speed,
                    violation.license_plate,
                    violation.driver_name,
                    violation.image_path
                );
            }
        }
        Command::Top { limit } => {
            for violator in store.top_violators(limit)? {
                println!(
                    "{:<12} {:<24} {:>4}",
                    violator.license_plate, violator.name, violator.violation_count
                );
            }
        }
        Command::DeleteViolation { id } => {
            if !store.delete_violation(id)? {
                bail!("no violation with id {id}");
            }
            println!("Deleted violation #{id}");
        }
    }
    Ok(())
}
