use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::warn;

use place_import::claims::{ClaimRequest, Decision, DecisionRequest};
use place_import::commands::{self, ManualPlaceRequest, ReviewRequest};
use place_import::config::AppConfig;
use place_import::jobs::ImportRequest;
use place_import::{init_tracing, AppState};

#[derive(Parser, Debug)]
#[command(name = "place-import", version, about = "Import places and reconcile ownership claims")]
struct Cli {
    /// Directory holding the catalog database and telemetry buffer
    #[arg(long, env = "PLACE_IMPORT_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search the provider and merge results into the catalog
    Import {
        /// Free-text location or "lat,lng"
        #[arg(long)]
        location: String,
        #[arg(long, default_value_t = 1000)]
        radius: u32,
        #[arg(long)]
        category: Option<String>,
        #[arg(long, default_value_t = 60)]
        max_results: usize,
        #[arg(long)]
        dry_run: bool,
    },
    /// Create a venue by hand (no external id)
    AddPlace {
        #[arg(long)]
        name: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lng: f64,
        #[arg(long)]
        address: Option<String>,
        #[arg(long = "category")]
        categories: Vec<String>,
    },
    /// Submit an ownership claim
    Claim {
        #[arg(long)]
        place_id: i64,
        #[arg(long)]
        email: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        justification: String,
    },
    /// Pick up a claim for review
    Review {
        #[arg(long)]
        place_id: i64,
        #[arg(long)]
        operator: Option<String>,
    },
    /// Verify or reject a claim
    Decide {
        #[arg(long)]
        place_id: i64,
        #[arg(long)]
        operator: String,
        #[arg(long, value_enum)]
        outcome: Outcome,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Show one import job
    Job { id: i64 },
    /// List recent import jobs
    Jobs {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show a catalog place with its claim history
    Place { id: i64 },
    /// Show the claim audit trail of a place
    History { place_id: i64 },
    /// Show paths and effective configuration
    Health,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Outcome {
    Verified,
    Rejected,
}

impl From<Outcome> for Decision {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Verified => Decision::Verified,
            Outcome::Rejected => Decision::Rejected,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let state = AppState::initialize(&cli.data_dir, AppConfig::from_env())
        .with_context(|| format!("failed to open catalog in {}", cli.data_dir.display()))?;

    let outcome = dispatch(&state, cli.command).await;
    state.shutdown();
    outcome
}

async fn dispatch(state: &AppState, command: Command) -> Result<()> {
    match command {
        Command::Import {
            location,
            radius,
            category,
            max_results,
            dry_run,
        } => {
            let cancel = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&cancel);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; cancelling import");
                    flag.store(true, Ordering::SeqCst);
                }
            });
            let request = ImportRequest {
                location,
                radius,
                category,
                max_results,
                dry_run,
            };
            print(commands::run_import(state, request, Some(cancel)).await)
        }
        Command::AddPlace {
            name,
            lat,
            lng,
            address,
            categories,
        } => print(commands::add_place(
            state,
            ManualPlaceRequest {
                name,
                lat,
                lng,
                formatted_address: address,
                categories,
            },
        )),
        Command::Claim {
            place_id,
            email,
            phone,
            justification,
        } => print(commands::submit_claim(
            state,
            ClaimRequest {
                place_id,
                contact_email: email,
                contact_phone: phone,
                justification,
            },
        )),
        Command::Review { place_id, operator } => print(commands::begin_verification(
            state,
            ReviewRequest {
                place_id,
                operator_id: operator,
            },
        )),
        Command::Decide {
            place_id,
            operator,
            outcome,
            notes,
        } => print(commands::decide_claim(
            state,
            DecisionRequest {
                place_id,
                operator_id: operator,
                outcome: outcome.into(),
                notes,
            },
        )),
        Command::Job { id } => print(commands::import_job(state, id)),
        Command::Jobs { limit } => print(commands::recent_jobs(state, limit)),
        Command::Place { id } => print(commands::place_detail(state, id)),
        Command::History { place_id } => print(commands::claim_history(state, place_id)),
        Command::Health => print(commands::engine_health(state)),
    }
}

fn print<T: Serialize>(result: Result<T, String>) -> Result<()> {
    let value = result.map_err(|message| anyhow!(message))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
