//! Operator commands for a chronicle Postgres database.
//!
//! ```text
//! chronicle --database-url postgres://... checkpoints
//! chronicle rebuild case_status
//! chronicle verify --all
//! ```

use anyhow::{bail, Result};
use chronicle::{
    projectors, CancellationToken, Checkpoint, PgProjections, ProjectionError, Projections,
};
use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use sqlx::PgPool;

#[derive(Parser)]
#[command(name = "chronicle")]
#[command(about = "Inspect and repair chronicle projections", version)]
struct Args {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending SQL migrations
    Migrate,
    /// List every checkpoint
    Checkpoints,
    /// Stop dispatching to a projector
    Pause { projector: String },
    /// Continue a paused projector from its cursor
    Resume { projector: String },
    /// Move a projector back to cursor 0 / active
    Reset { projector: String },
    /// Clear a projector's tables and replay the whole log
    Rebuild {
        projector: Option<String>,
        #[arg(long, conflicts_with = "projector")]
        all: bool,
    },
    /// Finish a cancelled rebuild
    ResumeRebuild { projector: String },
    /// Rebuild and compare against the live tables
    Verify {
        projector: Option<String>,
        #[arg(long, conflicts_with = "projector")]
        all: bool,
    },
    /// Row counts and checksums of tables
    Snapshot {
        #[arg(required = true)]
        tables: Vec<String>,
        /// Rows to include per table
        #[arg(long)]
        sample: Option<usize>,
    },
    /// Run every dispatcher until Ctrl+C
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chronicle=info".parse()?)
                .add_directive("chronicle_store=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let pool = PgPool::connect(&args.database_url).await?;

    let projections = projectors::install(PgProjections::new(&pool))?;

    if !matches!(args.command, Command::Migrate) {
        projections.init().await?;
    }

    match args.command {
        Command::Migrate => {
            chronicle::migrate(&pool).await?;
            tracing::info!("migrations applied");
        }
        Command::Checkpoints => {
            for checkpoint in projections.checkpoints().await? {
                print_checkpoint(&checkpoint);
            }
        }
        Command::Pause { projector } => print_checkpoint(&projections.pause(&projector).await?),
        Command::Resume { projector } => print_checkpoint(&projections.resume(&projector).await?),
        Command::Reset { projector } => print_checkpoint(&projections.reset(&projector).await?),
        Command::Rebuild { projector, all } => {
            let token = cancel_on_ctrl_c();

            for name in selected(&projections, projector, all)? {
                print_checkpoint(&projections.rebuild(&name, token.clone()).await?);
            }
        }
        Command::ResumeRebuild { projector } => {
            let token = cancel_on_ctrl_c();
            print_checkpoint(&projections.resume_rebuild(&projector, token).await?);
        }
        Command::Verify { projector, all } => {
            let mut failed = Vec::new();

            for name in selected(&projections, projector, all)? {
                let verification = match projections.verify(&name).await {
                    Ok(verification) => verification,
                    Err(err @ ProjectionError::Inactive { .. }) => {
                        tracing::warn!("{err}");
                        failed.push(name);
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };
                println!("{}", serde_json::to_string_pretty(&verification.comparison)?);

                if !verification.is_equal() {
                    failed.push(name);
                }
            }

            if !failed.is_empty() {
                bail!("verification failed for {}", failed.join(", "));
            }
        }
        Command::Snapshot { tables, sample } => {
            let snapshot = projections.snapshot(&tables, sample).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Run => {
            let token = CancellationToken::new();
            let handles = projections.run(token.clone()).await?;

            tokio::signal::ctrl_c().await?;
            tracing::info!("Received Ctrl+C, shutting down...");

            token.cancel();
            join_all(handles).await;
        }
    }

    Ok(())
}

fn selected(projections: &Projections, projector: Option<String>, all: bool) -> Result<Vec<String>> {
    match (projector, all) {
        (Some(name), false) => Ok(vec![name]),
        (None, true) => Ok(projections.names().into_iter().map(ToOwned::to_owned).collect()),
        _ => bail!("pass a projector name or --all"),
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received Ctrl+C, stopping after the current batch...");
            cancel.cancel();
        }
    });

    token
}

fn print_checkpoint(checkpoint: &Checkpoint) {
    let error = match (&checkpoint.last_error, checkpoint.error_position) {
        (Some(error), Some(position)) => format!(" error at {position}: {error}"),
        (Some(error), None) => format!(" error: {error}"),
        _ => String::new(),
    };

    let lease = match checkpoint.leased_by {
        Some(owner) => format!(" leased by {owner}"),
        None => String::new(),
    };

    println!(
        "{:<24} {:<7} cursor={}{}{}",
        checkpoint.projector_name,
        checkpoint.status.to_string(),
        checkpoint.cursor,
        lease,
        error
    );
}
