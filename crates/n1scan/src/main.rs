use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use n1_scanner::{CallStack, Config, Detector, Error, Notification, QueryEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "n1scan")]
#[command(about = "Fingerprint SQL and find N+1 query patterns in recorded query events.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the structural fingerprint of a query
    Fingerprint {
        query: String,
        /// Data-store driver name; selects the fingerprint strategy
        #[arg(long, default_value = "mysql")]
        driver: String,
    },
    /// Replay a JSON-lines event log through one scan scope
    Scan {
        path: PathBuf,
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Minimum repeats from one call site (overrides config)
        #[arg(long)]
        min_repeat: Option<usize>,
        /// Driver name (overrides config)
        #[arg(long)]
        driver: Option<String>,
        /// Exit with an error when a pattern is found
        #[arg(long)]
        raise: bool,
        /// Print notifications as JSON
        #[arg(long)]
        json: bool,
    },
}

/// One line of the event log.
#[derive(Debug, Deserialize)]
struct EventRecord {
    sql: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    cached: bool,
    #[serde(default)]
    stack: Vec<String>,
}

#[derive(Serialize)]
struct JsonNotification<'a> {
    queries: &'a [String],
    call_stack: &'a [String],
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Fingerprint { query, driver } => {
            let signature = n1_scanner::fingerprint(&driver, &query)?;
            println!("{signature}");
        }
        Command::Scan {
            path,
            config,
            min_repeat,
            driver,
            raise,
            json,
        } => {
            let mut config = match config {
                Some(config_path) => Config::from_file(&config_path).with_context(|| {
                    format!("failed to load config {}", config_path.display())
                })?,
                None => Config::default(),
            };
            if let Some(min_repeat) = min_repeat {
                config.min_repeat = min_repeat;
            }
            if let Some(driver) = driver {
                config.driver = driver;
            }
            config.raise_on_detect |= raise;

            let min_repeat = config.min_repeat;
            let events = read_events(&path)?;
            info!(events = events.len(), path = %path.display(), "replaying event log");

            match replay(&config, &events) {
                Ok(notifications) if notifications.is_empty() => {
                    if json {
                        println!("[]");
                    } else {
                        println!("OK: No N+1 queries detected (min_repeat={min_repeat}).");
                    }
                }
                Ok(notifications) => {
                    if json {
                        print_json(&notifications)?;
                    } else {
                        println!(
                            "CRITICAL: Detected {} N+1 pattern(s) (min_repeat={min_repeat}).",
                            notifications.len()
                        );
                        print!("{}", n1_scanner::render(&notifications, &config.compile()?));
                    }
                }
                Err(Error::Detection(report)) => {
                    println!("CRITICAL: Detected N+1 queries (min_repeat={min_repeat}).");
                    print!("{report}");
                    anyhow::bail!("N+1 queries detected in {}", path.display());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    Ok(())
}

fn read_events(path: &Path) -> anyhow::Result<Vec<EventRecord>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read event log {}", path.display()))?;

    let mut events = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let event: EventRecord = serde_json::from_str(line)
            .with_context(|| format!("invalid event on line {}", index + 1))?;
        events.push(event);
    }
    Ok(events)
}

fn replay(config: &Config, events: &[EventRecord]) -> Result<Vec<Notification>, Error> {
    let detector = Arc::new(Detector::new(config)?.with_sinks(Vec::new()));
    let mut scanner = detector.scanner();

    scanner.scan(|scanner| {
        for record in events {
            let mut event = QueryEvent::new(&record.sql).cached(record.cached);
            if let Some(name) = record.name.as_deref() {
                event = event.named(name);
            }
            scanner.record_query(&event, CallStack::new(record.stack.iter().cloned()));
        }
        debug!("event log replayed");
        scanner.finish()
    })
}

fn print_json(notifications: &[Notification]) -> anyhow::Result<()> {
    let rows: Vec<_> = notifications
        .iter()
        .map(|notification| JsonNotification {
            queries: &notification.queries,
            call_stack: notification.call_stack.frames(),
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}
