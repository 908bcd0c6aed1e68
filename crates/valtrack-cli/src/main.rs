use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};
use valtrack_core::{JobStatus, PlayerRef, SubscriberId, TrackedPlayer};
use valtrack_storage::{MatchStore, PgMatchStore};
use valtrack_sync::{TrackerConfig, TrackerPipeline};

#[derive(Debug, Parser)]
#[command(name = "valtrack")]
#[command(about = "Competitive match tracker: poll, dedup, notify")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll every tracked player once and print the execution record.
    Run,
    /// Poll now, then on every cron tick until Ctrl-C.
    Schedule,
    Migrate,
    #[command(subcommand)]
    Track(TrackCommand),
}

#[derive(Debug, Subcommand)]
enum TrackCommand {
    Add {
        /// Riot id, `name#tag`.
        player: PlayerRef,
        #[arg(long)]
        subscriber: SubscriberId,
    },
    Remove {
        player: PlayerRef,
        #[arg(long)]
        subscriber: SubscriberId,
    },
    List {
        #[arg(long)]
        subscriber: SubscriberId,
    },
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

async fn connect_store(config: &TrackerConfig) -> Result<PgMatchStore> {
    PgMatchStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to match store")
}

/// Runs `command` against `store` and closes the store on every path.
async fn track(store: &dyn MatchStore, command: TrackCommand) -> Result<()> {
    let outcome = run_track(store, command).await;
    store.close().await;
    outcome
}

async fn run_track(store: &dyn MatchStore, command: TrackCommand) -> Result<()> {
    match command {
        TrackCommand::Add { player, subscriber } => {
            let tracked = TrackedPlayer::new(player.clone(), subscriber);
            if store.register(&tracked).await? {
                println!("now tracking {player} for {subscriber}");
            } else {
                println!("{player} is already tracked for {subscriber}");
            }
        }
        TrackCommand::Remove { player, subscriber } => {
            if store.unregister(&player, subscriber).await? {
                println!("stopped tracking {player} for {subscriber}");
            } else {
                println!("{player} was not tracked for {subscriber}");
            }
        }
        TrackCommand::List { subscriber } => {
            let subscriptions = store.subscriptions(subscriber).await?;
            if subscriptions.is_empty() {
                println!("no tracked players for {subscriber}");
            }
            for tracked in subscriptions {
                println!("{}", tracked.player());
            }
        }
    }
    Ok(())
}

async fn schedule(pipeline: TrackerPipeline) -> Result<()> {
    let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
        anyhow::bail!("scheduler disabled; set VALTRACK_SCHEDULER_ENABLED=true");
    };

    if let Some(record) = pipeline.tick().await {
        info!(status = %record.status, duration = record.duration_seconds, "initial run finished");
    }
    sched.start().await.context("starting scheduler")?;
    info!(cron = %pipeline.config().cron, "scheduler started; Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down scheduler");
    if let Err(err) = sched.shutdown().await {
        warn!(error = %err, "scheduler did not shut down cleanly");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("valtrack=info,info")?;
    let cli = Cli::parse();
    let config = TrackerConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let record = TrackerPipeline::new(config)?.run_once().await;
            println!("{}", serde_json::to_string_pretty(&record)?);
            if record.status == JobStatus::Failed {
                anyhow::bail!(
                    "tracker run failed: {}",
                    record.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::Schedule => schedule(TrackerPipeline::new(config)?).await?,
        Commands::Migrate => {
            let store = connect_store(&config).await?;
            let migrated = store.migrate().await;
            store.close().await;
            migrated.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Track(command) => {
            let store = connect_store(&config).await?;
            track(&store, command).await?;
        }
    }

    Ok(())
}
