use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use std::path::PathBuf;
use std::sync::Arc;

use astrocat::config::Config;
use astrocat::log_setup::setup_logging;
use astrocat::matcher::CatalogMatcher;
use astrocat::orchestrator::{Orchestrator, OrchestratorSettings};
use astrocat::progress::MemoryProgressStore;
use astrocat::solve::{SolveMachine, SolveOutcome, SolveSettings, SubmitOptions};
use astrocat::solver;
use astrocat::state::Library;

#[derive(Parser, Debug)]
#[command(name = "astrocat", version, about = "Plate solve images and match them against sky catalogs")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Catalog database, overrides the configuration
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Solve a single image and wait for the result
    Solve {
        image_id: i64,
        /// Re-solve an image that is already solved
        #[arg(long)]
        force: bool,
        /// Do not send position or scale hints
        #[arg(long)]
        blind: bool,
    },
    /// Solve every eligible image whose path starts with SCOPE
    BulkSolve {
        scope: String,
        /// Include images that are already solved
        #[arg(long)]
        force: bool,
    },
    /// Recompute catalog matches for solved images whose path starts with SCOPE
    Rematch { scope: String },
    /// Fail images stuck with the solver
    Janitor {
        /// Sweep once and exit instead of running until interrupted
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(database) = cli.database {
        config.database = database;
    }
    setup_logging(&config.log_level, config.log_dir.as_deref())?;
    config.validate().context("Invalid configuration")?;

    let library = Arc::new(
        Library::open(&config.database)
            .with_context(|| format!("Failed to open {}", config.database.display()))?,
    );
    let matcher = CatalogMatcher::with_default_radius(library.clone(), config.search_radius);
    let progress = Arc::new(MemoryProgressStore::new(config.progress_ttl));

    let provider = solver::from_config(&config).context("Failed to set up the plate solver")?;

    let machine = SolveMachine::new(
        library.clone(),
        provider,
        matcher,
        SolveSettings::from_config(&config),
    );
    let orchestrator = Orchestrator::new(
        machine.clone(),
        progress,
        OrchestratorSettings::from_config(&config),
    );

    match cli.command {
        Command::Solve {
            image_id,
            force,
            blind,
        } => match machine.solve(image_id, SubmitOptions { force, blind }).await? {
            SolveOutcome::Solved { job_id, matches } => {
                let image = library.image(image_id)?;
                println!(
                    "image {image_id} solved (job {job_id}): ra={:.5} dec={:.5} scale={:.3}\"/px, {} matches",
                    image.ra_center.unwrap_or_default(),
                    image.dec_center.unwrap_or_default(),
                    image.pixel_scale.unwrap_or_default(),
                    matches.map_or_else(|| "no".to_string(), |n| n.to_string())
                );
            }
            SolveOutcome::Failed { reason } => bail!("image {image_id} not solved: {reason}"),
        },
        Command::BulkSolve { scope, force } => {
            let progress = orchestrator.run_bulk_solve(&scope, force).await?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
        Command::Rematch { scope } => {
            let progress = orchestrator.run_bulk_rematch(&scope).await?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
        Command::Janitor { once: true } => {
            let rescued = orchestrator.sweep_stuck(Utc::now())?;
            println!("rescued {} images", rescued.len());
        }
        Command::Janitor { once: false } => {
            info!("Janitor running, press Ctrl-C to stop");
            orchestrator
                .run_janitor(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await;
        }
    }

    Ok(())
}
