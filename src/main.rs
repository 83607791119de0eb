use std::io::Write;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::metadata::LevelFilter;

use wardrobe_gatekeeper::core::{app_state::Gatekeeper, settings::GatekeeperConfig};
use wardrobe_gatekeeper::models::ModelError;

/// Model download and weekly credit gatekeeping.
#[derive(Parser, Debug)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print model state, paths and credit balance as JSON.
    Status,
    /// Repair the model record against files on disk.
    Reconcile,
    /// Download the model, showing progress.
    Download,
    /// Remove the model files and record.
    Delete,
    /// Inspect or change usage credits.
    #[command(subcommand)]
    Credits(CreditsCommand),
}

#[derive(Subcommand, Debug)]
enum CreditsCommand {
    Show,
    /// Apply the weekly reset if due.
    Refresh,
    Consume,
    /// Give back the last consumed credit.
    Refund,
    AddExtra { amount: u32 },
}

fn setup_logging() {
    let filter = std::env::var("GATEKEEPER_LOG")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(LevelFilter::INFO);

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> Result<()> {
    setup_logging();
    let cli = Cli::parse();

    let config = GatekeeperConfig::load()?;
    let gatekeeper = Gatekeeper::from_config(&config)?;
    gatekeeper.start();

    match cli.command {
        Command::Status => print_status(&gatekeeper),
        Command::Reconcile => {
            let state = gatekeeper.models().reconcile();
            println!("{state}");
            Ok(())
        }
        Command::Download => download(&gatekeeper),
        Command::Delete => {
            gatekeeper.models().delete()?;
            println!("deleted {}", gatekeeper.model_root().display());
            Ok(())
        }
        Command::Credits(command) => credits(&gatekeeper, command),
    }
}

fn print_status(gatekeeper: &Gatekeeper) -> Result<()> {
    let models = gatekeeper.models();
    let ledger = gatekeeper.ledger();
    let status = serde_json::json!({
        "model": {
            "state": models.state(),
            "ready": models.is_ready(),
            "info": models.model_info(),
            "installedVersion": models.installed_version(),
            "engineAssets": models.engine_assets(),
        },
        "credits": {
            "balance": ledger.balance(),
            "total": ledger.total_credits(),
            "offline": ledger.is_offline(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn download(gatekeeper: &Gatekeeper) -> Result<()> {
    let handle = gatekeeper.queue_model_download()?;
    let progress = handle.progress().clone();
    let reporter = std::thread::spawn(move || {
        let mut stderr = std::io::stderr();
        for update in progress.iter() {
            let line = match (update.percentage, update.total_mb) {
                (Some(percentage), Some(total)) => {
                    format!("{:.1}/{total:.1} MB ({percentage}%)", update.downloaded_mb)
                }
                _ => format!("{:.1} MB", update.downloaded_mb),
            };
            let _ = write!(stderr, "\r{line}   ");
        }
        let _ = writeln!(stderr);
    });

    let result = handle.wait();
    let _ = reporter.join();
    match result {
        Ok(path) => {
            println!("{}", path.display());
            Ok(())
        }
        Err(ModelError::Cancelled) => bail!("download cancelled"),
        Err(error) => Err(error).context("model download failed"),
    }
}

fn credits(gatekeeper: &Gatekeeper, command: CreditsCommand) -> Result<()> {
    let ledger = gatekeeper.ledger();
    match command {
        CreditsCommand::Show => {}
        CreditsCommand::Refresh => {
            let outcome = ledger.refresh()?;
            tracing::info!(?outcome, "credits refreshed");
        }
        CreditsCommand::Consume => {
            if !ledger.consume()? {
                bail!("no credits left");
            }
        }
        CreditsCommand::Refund => match ledger.refund()? {
            Some(pool) => tracing::info!(%pool, "credit refunded"),
            None => tracing::info!("nothing to refund"),
        },
        CreditsCommand::AddExtra { amount } => {
            ledger.add_extra(amount)?;
        }
    }
    println!("{}", serde_json::to_string_pretty(&ledger.balance())?);
    Ok(())
}
