//! Command-line front end for the flake scanner.
//!
//! Drives the simulated rig described by the `simulation` config section.
//!
//! ```bash
//! flake_scan scan
//! flake_scan review 241019_14_05
//! flake_scan goto 241019_14_05 113 --objective-50x
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flake_scan::config::{ScanConfig, DEFAULT_CONFIG_PATH};
use flake_scan::hardware::{simulated_rig, CameraController, Rig, StageController};
use flake_scan::review::{goto_flake, Objective, SessionReview};
use flake_scan::scan::homing;
use flake_scan::scan::{EventBus, ScanEvent, ScanOrchestrator};
use flake_scan::session::{DirectoryImageSink, Session};

#[derive(Parser, Debug)]
#[command(name = "flake_scan", version, about = "Grid scan and flake detection")]
struct Cli {
    /// Configuration file (optional; defaults describe the physical setup)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a full grid scan into a new session
    Scan,
    /// Home both stage axes
    Home,
    /// List the flakes of a session, best first
    Review {
        /// Session id under the storage root, or a path
        session: PathBuf,
    },
    /// Centre a capture of a session under the objective
    Goto {
        session: PathBuf,
        index: u64,
        /// Apply the 50x objective offset
        #[arg(long)]
        objective_50x: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ScanConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.application.log_level))
        .context("Invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (rig, stage, camera) = simulated_rig(&config);

    let outcome = match cli.command {
        Command::Scan => run_scan(&config, &rig).await,
        Command::Home => {
            let bus = EventBus::default();
            let observer = log_events(bus.subscribe());
            let result = homing::home(&rig, &config.stage, &bus).await;
            drop(bus);
            join_observer(observer).await;
            result.map_err(Into::into)
        }
        Command::Review { session } => {
            let review = open_review(&config, &session)?;
            print_review(&review);
            Ok(())
        }
        Command::Goto {
            session,
            index,
            objective_50x,
        } => {
            let review = open_review(&config, &session)?;
            let objective = if objective_50x {
                Objective::X50
            } else {
                Objective::X10
            };
            let target = goto_flake(&rig, &review, index, &config, objective).await?;
            info!(index, x = target.x, y = target.y, "Stage centred on capture");
            Ok(())
        }
    };

    let _devices = rig.lease().await;
    if let Err(err) = stage.release().await {
        warn!(%err, "Failed to release stage");
    }
    if let Err(err) = camera.release().await {
        warn!(%err, "Failed to release camera");
    }
    outcome
}

async fn run_scan(config: &ScanConfig, rig: &Rig) -> Result<()> {
    let session = Session::create(&config.storage.root_dir)?;
    let sink = Arc::new(DirectoryImageSink::new(session.clone()));
    let orchestrator = ScanOrchestrator::new(config.clone(), session, sink)?;
    let observer = log_events(orchestrator.subscribe());

    let handle = orchestrator.spawn(rig).await;
    let mut state = handle.state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; stopping after the current position");
            handle.cancel();
        }
        _ = state.wait_for(|s| s.is_terminal()) => {}
    }

    let result = handle.join().await;
    join_observer(observer).await;
    let summary = result?;
    info!(
        session = %summary.session_id,
        captured = summary.captured,
        flakes = ?summary.flakes,
        "Scan finished"
    );
    Ok(())
}

fn open_review(config: &ScanConfig, session: &Path) -> Result<SessionReview> {
    let dir = if session.is_dir() {
        session.to_path_buf()
    } else {
        config.storage.root_dir.join(session)
    };
    let session = Session::open(&dir).with_context(|| format!("No session at {}", dir.display()))?;
    Ok(SessionReview::load(session)?)
}

fn print_review(review: &SessionReview) {
    let flakes = review.ranked_flakes();
    println!(
        "Session {}: {} captures, {} flakes",
        review.session().id(),
        review.entries().len(),
        flakes.len()
    );
    for entry in flakes {
        println!(
            "  #{:<5} score {:>7}  stage ({}, {})  peak ({}, {})",
            entry.index, entry.score, entry.x_pos, entry.y_pos, entry.peak_x, entry.peak_y
        );
    }
}

async fn join_observer(observer: JoinHandle<()>) {
    if let Err(err) = observer.await {
        warn!(%err, "Event observer failed");
    }
}

/// Log every scan event until the publisher goes away.
fn log_events(mut rx: broadcast::Receiver<ScanEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ScanEvent::Progress {
                    completed,
                    total,
                    percent,
                }) => info!("{completed}/{total} ({percent:.1}%)"),
                Ok(ScanEvent::RemainingTime(remaining)) => {
                    let secs = remaining.as_secs();
                    info!("{}m {}s remaining", secs / 60, secs % 60);
                }
                Ok(ScanEvent::FlakeRecorded { index, score }) => {
                    info!(index, score, "New flake");
                }
                Ok(ScanEvent::Started { session_id, total }) => {
                    info!(%session_id, total, "Scan started");
                }
                // Status lines and transitions are already logged by the bus
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event observer lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
