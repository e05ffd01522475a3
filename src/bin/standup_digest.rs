//! CLI binary for standup-digest.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use standup_digest::{
    Clock, DeliveryFn, DigestConfig, DigestPayload, DigestScheduler, ItemsByKind,
    SqliteStandupStore, StandupId, SystemClock,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Timezone-aware standup digest scheduler.
#[derive(Parser)]
#[command(name = "standup-digest", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the database path from the config.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Command,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Show the schedule state of a standup.
    Status {
        /// Standup id.
        id: StandupId,
    },

    /// List pending items of a standup grouped by kind.
    Items {
        /// Standup id.
        id: StandupId,
    },

    /// Send every digest that is due now, then exit.
    SendDue,

    /// Run the scheduler until interrupted.
    Run,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    id: StandupId,
    title: &'a str,
    time_zone: &'a str,
    start_time: String,
    now: String,
    standup_time_today: String,
    next_fire_time: String,
    finished_today: bool,
    due_now: bool,
    last_sent_at: Option<String>,
    pending_items: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(DigestConfig::default_config_path);
    let mut config = if config_path.exists() {
        DigestConfig::from_file(&config_path)?
    } else {
        DigestConfig::default()
    };
    if let Some(db) = cli.db {
        config.store.db_path = db;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let store = Arc::new(SqliteStandupStore::open(&config.store.db_path)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Command::Status { id } => show_status(&store, clock.as_ref(), id),
        Command::Items { id } => list_items(&store, id),
        Command::SendDue => send_due(store, clock, &config),
        Command::Run => run_scheduler(store, clock, &config).await,
    }
}

fn show_status(store: &SqliteStandupStore, clock: &dyn Clock, id: StandupId) -> anyhow::Result<()> {
    let aggregate = store.load_aggregate(id)?;
    let report = StatusReport {
        id,
        title: &aggregate.standup().title,
        time_zone: aggregate.zone().identifier(),
        start_time: aggregate.start_time().to_string(),
        now: aggregate.zone().now(clock).to_rfc3339(),
        standup_time_today: aggregate.standup_time_today(clock).to_rfc3339(),
        next_fire_time: aggregate.next_fire_time(clock).to_rfc3339(),
        finished_today: aggregate.is_finished_today(clock),
        due_now: aggregate.is_due_now(clock),
        last_sent_at: aggregate
            .last_sent_at()
            .map(|t| t.with_timezone(&aggregate.zone().tz()).to_rfc3339()),
        pending_items: aggregate.pending_items_by_kind().len(),
    };
    print_json(&report)
}

fn list_items(store: &SqliteStandupStore, id: StandupId) -> anyhow::Result<()> {
    let pending: ItemsByKind = store.load_aggregate(id)?.pending_items_by_kind();
    print_json(&pending)
}

fn send_due(
    store: Arc<SqliteStandupStore>,
    clock: Arc<dyn Clock>,
    config: &DigestConfig,
) -> anyhow::Result<()> {
    let scheduler = DigestScheduler::new(store, clock, config.scheduler.clone())
        .with_delivery(stdout_delivery());
    let report = scheduler.tick()?;
    info!(
        sent = report.sent,
        delivered = report.delivered,
        failed = report.failed,
        "send-due finished"
    );
    Ok(())
}

async fn run_scheduler(
    store: Arc<SqliteStandupStore>,
    clock: Arc<dyn Clock>,
    config: &DigestConfig,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let handle = DigestScheduler::new(store, clock, config.scheduler.clone())
        .with_delivery(stdout_delivery())
        .run(cancel.clone());

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, stopping scheduler");
    cancel.cancel();
    handle.await?;
    Ok(())
}

/// Delivery that prints each digest as one JSON line on stdout.
fn stdout_delivery() -> DeliveryFn {
    Box::new(|payload: &DigestPayload| {
        let line = serde_json::to_string(payload)
            .map_err(|e| standup_digest::StandupError::Delivery(e.to_string()))?;
        println!("{line}");
        info!(
            standup_id = payload.standup_id,
            to = %payload.to_address,
            items = payload.item_count(),
            "digest delivered to stdout"
        );
        Ok(())
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
