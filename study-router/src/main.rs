//! RVU Router - Main entry point
//!
//! Runs the study router as a daemon: polls the reporting applications,
//! classifies completed studies and records them into the current shift.

use chrono::Utc;
use shift_store::{AddOutcome, RecordSink, ShiftStore};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use study_router::{CompletedStudyRecord, Config, RuleSet, StudyRouter};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    rules: Option<PathBuf>,
    db: Option<PathBuf>,
    check_rules: bool,
    help: bool,
}

/// Parse command line arguments
fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => parsed.help = true,
            "--check-rules" => parsed.check_rules = true,
            flag @ ("--config" | "-c" | "--rules" | "--db") => {
                i += 1;
                let value = args
                    .get(i)
                    .map(PathBuf::from)
                    .ok_or_else(|| format!("{} needs a path", flag))?;
                match flag {
                    "--rules" => parsed.rules = Some(value),
                    "--db" => parsed.db = Some(value),
                    _ => parsed.config = Some(value),
                }
            }
            other => return Err(format!("Unknown argument: {}", other)),
        }
        i += 1;
    }

    Ok(parsed)
}

fn print_help() {
    println!("rvu-router - track and classify dictated studies");
    println!();
    println!("USAGE:");
    println!("    rvu-router [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <PATH>   Config file (default: {})", Config::default_config_path().display());
    println!("        --rules <PATH>    Rule table replacing the built-in one");
    println!("        --db <PATH>       Shift database");
    println!("        --check-rules     Validate the rule table and exit");
    println!("    -h, --help            Print this help");
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[cfg(target_os = "windows")]
fn desktop() -> Result<Arc<study_router::platform::windows::UiaDesktop>, study_router::DesktopError> {
    Ok(Arc::new(study_router::platform::windows::UiaDesktop::new()?))
}

#[cfg(not(target_os = "windows"))]
fn desktop() -> Result<Arc<study_router::NullDesktop>, study_router::DesktopError> {
    warn!("No UI automation back end on this platform, no studies will be detected");
    Ok(Arc::new(study_router::NullDesktop))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            eprintln!("Use --help for usage information.");
            std::process::exit(1);
        }
    };
    if args.help {
        print_help();
        return Ok(());
    }

    let config_path = args.config.clone().unwrap_or_else(Config::default_config_path);
    // First pass only picks the log level; the second logs what it loaded
    init_logging(&Config::load_from_path(&config_path).general.log_level);
    info!("Starting RVU Router");

    let mut config = Config::load_from_path(&config_path);
    if let Some(rules) = args.rules {
        config.rules.path = Some(rules);
    }
    if let Some(db) = args.db {
        config.storage.db_path = db;
    }
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    let rules = match RuleSet::load_layered(config.rules.path.as_deref(), &config.rules.overlays) {
        Ok(rules) => rules,
        Err(e) => {
            error!("Invalid rule table: {}", e);
            return Err(e.into());
        }
    };
    if args.check_rules {
        println!(
            "Rule table OK: {} study types, {} labels",
            rules.study_types().len(),
            rules.weights().count()
        );
        return Ok(());
    }

    if !config.general.enabled {
        info!("Router is disabled in configuration, exiting");
        return Ok(());
    }

    // Open the shift store, resuming a shift left open by a previous run
    let mut store = ShiftStore::open(&config.storage.db_path)?;
    let shift = match store.latest_open_shift()? {
        Some(shift) => {
            info!("Resuming {}", shift);
            shift
        }
        None => {
            let shift = store.start_shift(Utc::now())?;
            info!("Started {}", shift);
            shift
        }
    };
    info!("Shift database: {}", config.storage.db_path.display());

    let router = StudyRouter::from_config(&config, desktop()?, Arc::new(rules))?;

    // Setup shutdown signal
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    // Create record channel
    let (record_tx, mut record_rx) = mpsc::channel::<CompletedStudyRecord>(100);

    // Spawn record handler task
    let sink = tokio::spawn(async move {
        while let Some(record) = record_rx.recv().await {
            match store.add_record(shift, &record) {
                Ok(AddOutcome::Inserted) => info!(
                    "Recorded {} '{}' ({} RVU)",
                    record.accession, record.study_type, record.rvu
                ),
                Ok(AddOutcome::Duplicate) => info!("{} already recorded in {}", record.accession, shift),
                Err(e) => error!("Failed to record {}: {}", record.accession, e),
            }
        }
        store
    });

    let worker = study_router::spawn_worker(router, record_tx)?;
    info!("Router running, press Ctrl+C to stop");

    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    info!("Shutting down");
    if let Some(status) = tokio::task::spawn_blocking(move || worker.shutdown()).await? {
        info!(
            "Router stopped: {} completed, {} abandoned",
            status.completed, status.abandoned
        );
    }

    // The worker dropped its sender, so the handler drains and returns
    let mut store = sink.await?;
    store.end_shift(shift, Utc::now())?;
    let summary = store.shift_summary(shift)?;
    info!(
        "Ended {}: {} studies, {:.2} RVU",
        shift, summary.study_count, summary.total_rvu
    );

    Ok(())
}
