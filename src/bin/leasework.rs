//! leasework CLI: run coordinators and producers, inspect the lease table.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use leasework::clock::{Clock, SystemClock};
use leasework::config::{Config, Role};
use leasework::db::Db;
use leasework::engine::{
    Coordinator, Dispatcher, Producer, RandomSelector, Scheduler, SimulatedWork,
};
use leasework::model::OwnerId;
use leasework::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use tracing::info;

#[derive(Parser)]
#[command(name = "leasework", about = "Lease-based distributed work queue")]
struct Cli {
    /// Optional TOML settings file; environment variables take precedence
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bootstrap the schema and run the configured roles until ctrl-c
    Serve {
        /// Override ROLE (producer, worker, both, none)
        #[arg(long)]
        role: Option<Role>,
        /// Override WORKER_COUNT
        #[arg(long)]
        workers: Option<usize>,
        /// Worker identity; beats WORKER_ID
        #[arg(long)]
        worker_id: Option<String>,
    },
    /// Create tables and seed owners, then exit
    Setup,
    /// Show every owner's lease and high-water mark
    Owners {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Append one work item
    Enqueue {
        owner: i64,
        payload: String,
        /// Item timestamp in ms (defaults to now)
        #[arg(long)]
        mod_time: Option<i64>,
    },
    /// Report items the activity log shows were processed more than once
    Audit {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve {
            role,
            workers,
            worker_id,
        } => {
            if let Some(role) = role {
                config.role = role;
            }
            if let Some(workers) = workers {
                anyhow::ensure!(workers > 0, "--workers must be at least 1");
                config.worker_count = workers;
            }
            cmd_serve(config, worker_id).await
        }
        Command::Setup => {
            let db = open_db(&config).await?;
            db.setup_schema(&config.partitions).await?;
            println!("Schema ready ({} owners).", config.partitions.len());
            Ok(())
        }
        Command::Owners { json } => cmd_owners(&open_db(&config).await?, json).await,
        Command::Enqueue {
            owner,
            payload,
            mod_time,
        } => {
            let db = open_db(&config).await?;
            let mod_time = mod_time.unwrap_or_else(|| SystemClock.now_ms());
            db.append(OwnerId(owner), &payload, mod_time).await?;
            println!("Enqueued owner {owner} @ {mod_time}");
            Ok(())
        }
        Command::Audit { json } => cmd_audit(&open_db(&config).await?, json).await,
    }
}

async fn open_db(config: &Config) -> anyhow::Result<Db> {
    Ok(Db::open(config.database_url.expose_secret(), config.max_connections).await?)
}

async fn cmd_serve(config: Config, worker_id: Option<String>) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "leasework".to_string(),
        log_level: config.log_level.clone(),
    })?;

    info!("distributed work queue processing");
    let db = open_db(&config).await?;
    db.setup_schema(&config.partitions).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let selector = Arc::new(RandomSelector::new(config.partitions.clone())?);
    let mut scheduler = Scheduler::new();

    if config.role.runs_producer() {
        let producer = Arc::new(Producer::new(
            db.clone(),
            selector.clone(),
            clock.clone(),
            config.producer(),
        ));
        info!(interval_ms = config.producer_rate.as_millis() as u64, "producer launched");
        let interval = producer.config().interval;
        scheduler.schedule("producer", interval, move || {
            let producer = Arc::clone(&producer);
            async move { producer.tick().await }
        });
    }

    if config.role.runs_workers() {
        let handler = Arc::new(SimulatedWork::new(config.work_item_duration));
        let dispatcher = Dispatcher::new(db.clone(), handler, clock.clone());
        for index in 0..config.worker_count {
            let settings = config.coordinator(worker_id.as_deref(), index, clock.now_ms());
            let coordinator = Arc::new(Coordinator::new(
                db.clone(),
                dispatcher.clone(),
                selector.clone(),
                clock.clone(),
                settings,
            ));
            info!(worker = %coordinator.worker_id(), "worker launched");
            let task_id = format!("worker-{}", coordinator.worker_id());
            let interval = coordinator.config().tick_interval;
            scheduler.schedule(task_id, interval, move || {
                let coordinator = Arc::clone(&coordinator);
                async move {
                    coordinator.tick().await;
                }
            });
        }
    }

    if scheduler.is_empty() {
        info!(role = %config.role, "no roles to run");
        return Ok(());
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    scheduler.shutdown().await;
    Ok(())
}

async fn cmd_owners(db: &Db, json: bool) -> anyhow::Result<()> {
    let owners = db.owners().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&owners)?);
        return Ok(());
    }
    if owners.is_empty() {
        println!("No owners seeded. Run `leasework setup`.");
        return Ok(());
    }

    println!(
        "{:<6}  {:<24}  {:<16}  HIGH_WATER_MARK",
        "OWNER", "LEASE_HOLDER", "ACQUIRED_AT"
    );
    println!("{}", "-".repeat(70));
    for owner in &owners {
        let (holder, acquired) = match owner.lease() {
            Some(lease) => (lease.holder.to_string(), lease.acquired_at.to_string()),
            None => ("-".to_string(), "-".to_string()),
        };
        println!(
            "{:<6}  {:<24}  {:<16}  {}",
            owner.owner_id, holder, acquired, owner.high_water_mark
        );
    }
    Ok(())
}

async fn cmd_audit(db: &Db, json: bool) -> anyhow::Result<()> {
    let duplicates = db.duplicate_activity().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&duplicates)?);
        return Ok(());
    }
    if duplicates.is_empty() {
        println!("No item was processed more than once.");
        return Ok(());
    }

    println!("{:<6}  {:<16}  TIMES", "OWNER", "MOD_TIME");
    for dup in &duplicates {
        println!(
            "{:<6}  {:<16}  {}",
            dup.owner_id, dup.mod_time, dup.times_processed
        );
    }
    println!("\n{} item(s) processed more than once", duplicates.len());
    Ok(())
}
