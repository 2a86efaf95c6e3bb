//! CLI entry point for engagement checkpoint recovery.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use sentinel_checkpoint::CheckpointStore;
use sentinel_core::{EngagementContext, EngagementId};
use sentinel_session::{CommandFailure, CommandHandler, FailureKind, SessionManager, Timeouts};

#[derive(Parser)]
#[command(name = "sentinel-checkpointd")]
#[command(about = "Discover, verify, and restore Sentinel engagement checkpoints")]
struct Cli {
    /// Config file prefix (default: sentinel).
    #[arg(short, long, default_value = "sentinel")]
    config: String,

    /// Override the checkpoint root directory from config.
    #[arg(long)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the checkpoint root and list restorable engagements.
    #[command(alias = "discover")]
    List,
    /// Check a checkpoint file's signature without loading it.
    Verify {
        #[arg(long)]
        path: PathBuf,
    },
    /// Load a checkpoint and rebuild its engagement in the stopped state.
    Restore {
        engagement_id: String,
        /// Restore even if the scope artifact changed since capture.
        #[arg(long)]
        override_scope_drift: bool,
        /// Read from this file instead of the engagement's default location.
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Checkpoint an engagement context exported as JSON and mark it stopped.
    Capture {
        #[arg(long)]
        context: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<CommandFailure>() {
            Some(failure) => {
                tracing::error!(kind = %failure.kind, "{}", failure.message);
                eprintln!("{failure}");
                ExitCode::from(failure.exit_code())
            }
            None => {
                tracing::error!(error = %err, "Command failed");
                eprintln!("{err:#}");
                ExitCode::from(FailureKind::Internal.exit_code())
            }
        },
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = sentinel_core::config::load(&cli.config)?;
    if let Some(root) = cli.root {
        config.root_dir = root;
    }
    tracing::info!(root = %config.root_dir.display(), "Checkpoint root");

    let store = CheckpointStore::new(&config.root_dir)?;
    let handler = CommandHandler::new(SessionManager::new(store), Timeouts::from(&config));

    match cli.command {
        Command::List => {
            let found = handler.discover().await?;
            print_json(&found)?;
        }
        Command::Verify { path } => {
            let verified = handler.verify(&path).await?;
            print_json(&serde_json::json!({
                "path": path,
                "verified": verified,
            }))?;
            if !verified {
                return Err(CommandFailure::new(
                    FailureKind::Integrity,
                    format!("{} failed signature verification", path.display()),
                )
                .into());
            }
        }
        Command::Restore {
            engagement_id,
            override_scope_drift,
            path,
        } => {
            let reply = match path {
                Some(path) => {
                    let id = EngagementId::parse(engagement_id.as_str()).map_err(|e| {
                        CommandFailure::new(FailureKind::InvalidInput, e.to_string())
                    })?;
                    handler.restore_from(&id, path, override_scope_drift).await?
                }
                None => handler.restore(&engagement_id, override_scope_drift).await?,
            };
            if let Some(warning) = &reply.scope_drift_warning {
                tracing::warn!(engagement_id = %reply.engagement_id, "{warning}");
            }
            print_json(&reply)?;
        }
        Command::Capture { context } => {
            let raw = std::fs::read(&context).map_err(|e| {
                CommandFailure::new(FailureKind::Io, format!("{}: {e}", context.display()))
            })?;
            let ctx: EngagementContext = serde_json::from_slice(&raw)
                .map_err(|e| CommandFailure::new(FailureKind::InvalidInput, e.to_string()))?;
            let id = ctx.engagement_id().to_string();
            handler
                .manager()
                .register_running(ctx)
                .map_err(CommandFailure::from)?;
            let reply = handler.stop(&id).await?;
            print_json(&reply)?;
        }
    }

    handler.manager().shutdown();
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
