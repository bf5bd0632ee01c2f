// ABOUTME: CLI entry point for sheet-sync
// ABOUTME: Parses commands and routes them to the sync engine, scheduler and store

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use sheet_sync::config::AppConfig;
use sheet_sync::model::{Job, JobTarget, SyncConfig};
use sheet_sync::scheduler::{parse_schedule, reaper, JobScheduler, TimeWindow};
use sheet_sync::source::{SheetsClient, SourceRef};
use sheet_sync::store::{JobStore, SqlStore, SyncLogStore};
use sheet_sync::sync::{SyncEngine, SyncOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "sheet-sync")]
#[command(about = "Mirror spreadsheet tabs into PostgreSQL or SQLite tables", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to config.toml (defaults to the per-user config file when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Database holding the synced tables and bookkeeping
    #[arg(long = "database-url", env = "SHEET_SYNC_DATABASE_URL", global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct TargetArgs {
    /// Sync one table
    #[arg(long)]
    table: Option<String>,
    /// Sync every table in a folder
    #[arg(long)]
    folder: Option<String>,
    /// Run a SQL query
    #[arg(long)]
    sql: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the bookkeeping tables
    InitSchema,
    /// Create a table from a sheet's header row and register it for syncing
    AddTable {
        #[arg(long)]
        table: String,
        #[arg(long)]
        spreadsheet: String,
        #[arg(long)]
        sheet: String,
        #[arg(long)]
        folder: Option<String>,
        /// First row of the sheet to read (1-based)
        #[arg(long, default_value_t = 1)]
        start_row: u64,
        /// Last column to read, e.g. "F"
        #[arg(long)]
        end_column: Option<String>,
        /// The first row holds data, not column names
        #[arg(long)]
        no_header: bool,
    },
    /// Drop a synced table and its configuration
    RemoveTable {
        #[arg(long)]
        table: String,
    },
    /// Sync one table now
    Sync {
        #[arg(long)]
        table: String,
        /// Re-import even if the sheet looks unchanged
        #[arg(long)]
        force: bool,
    },
    /// Run a query, optionally materialising the result into a table
    Query {
        #[arg(long)]
        sql: String,
        #[arg(long)]
        destination: Option<String>,
    },
    /// Register a scheduled job
    AddJob {
        #[arg(long)]
        name: String,
        /// Cron expression, 5 or 6 fields
        #[arg(long)]
        schedule: String,
        #[command(flatten)]
        target: TargetArgs,
        /// Table receiving the result of a --sql job
        #[arg(long, requires = "sql")]
        destination: Option<String>,
        /// Start of the daily run window, HH:MM
        #[arg(long, requires = "window_end")]
        window_start: Option<String>,
        /// End of the daily run window, HH:MM
        #[arg(long, requires = "window_start")]
        window_end: Option<String>,
    },
    /// List registered jobs
    Jobs,
    /// Run one job now, through the scheduler's single-flight path
    RunJob {
        #[arg(long)]
        id: String,
    },
    /// Run the scheduler until interrupted
    Schedule,
    /// Run one stuck-state reaper pass
    Reap,
    /// Show recent sync log entries for a table (or job:<name>)
    Logs {
        #[arg(long)]
        table: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<SqlStore>> {
    let db = sheet_sync::db::connect(config.require_database_url()?).await?;
    let store = SqlStore::new(db);
    store
        .ensure_schema()
        .await
        .context("Failed to prepare bookkeeping tables")?;
    Ok(Arc::new(store))
}

fn build_engine(config: &AppConfig, store: Arc<SqlStore>) -> anyhow::Result<Arc<SyncEngine>> {
    let source = SheetsClient::new(config.sheets.clone())?;
    Ok(Arc::new(SyncEngine::new(
        store,
        Arc::new(source),
        config.engine.clone(),
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.database_url {
        config.database_url = Some(url);
    }

    match cli.command {
        Commands::InitSchema => {
            open_store(&config).await?;
            tracing::info!("Bookkeeping tables are ready");
            Ok(())
        }
        Commands::AddTable {
            table,
            spreadsheet,
            sheet,
            folder,
            start_row,
            end_column,
            no_header,
        } => {
            let mut sync_config = SyncConfig::new(&table, SourceRef::new(spreadsheet, sheet))
                .with_start_row(start_row)
                .with_header(!no_header);
            if let Some(folder) = folder {
                sync_config = sync_config.with_folder(folder);
            }
            if let Some(end_column) = end_column {
                sync_config = sync_config.with_end_column(end_column);
            }
            let store = open_store(&config).await?;
            let engine = build_engine(&config, store)?;
            let columns = engine.provision_from_source(&sync_config).await?;
            print_json(&columns)
        }
        Commands::RemoveTable { table } => {
            let store = open_store(&config).await?;
            let engine = build_engine(&config, store)?;
            if !engine.delete_table(&table).await? {
                tracing::warn!("Table '{}' had no sync configuration", table);
            }
            Ok(())
        }
        Commands::Sync { table, force } => {
            let store = open_store(&config).await?;
            let engine = build_engine(&config, store)?;
            let result = engine.perform_sync(&table, force).await;
            print_json(&result)?;
            if result.outcome == SyncOutcome::Error {
                bail!("Sync of '{}' failed", table);
            }
            Ok(())
        }
        Commands::Query { sql, destination } => {
            let store = open_store(&config).await?;
            let engine = build_engine(&config, store)?;
            let result = engine.perform_query_job(&sql, destination.as_deref()).await;
            print_json(&result)?;
            if let Some(error) = result.error {
                bail!("Query failed: {}", error);
            }
            Ok(())
        }
        Commands::AddJob {
            name,
            schedule,
            target,
            destination,
            window_start,
            window_end,
        } => {
            parse_schedule(&schedule)?;
            TimeWindow::from_bounds(window_start.as_deref(), window_end.as_deref())?;

            let target = match (target.table, target.folder, target.sql) {
                (Some(table), _, _) => JobTarget::Table {
                    folder: None,
                    table,
                },
                (_, Some(folder), _) => JobTarget::Folder { folder },
                (_, _, Some(sql)) => JobTarget::Query { sql, destination },
                _ => bail!("One of --table, --folder or --sql is required"),
            };
            let mut job = Job::new(name, target, schedule);
            if let (Some(start), Some(end)) = (window_start, window_end) {
                job = job.with_window(start, end);
            }

            let store = open_store(&config).await?;
            store.upsert_job(&job).await?;
            tracing::info!("Added job '{}' ({})", job.name, job.id);
            print_json(&job)
        }
        Commands::Jobs => {
            let store = open_store(&config).await?;
            print_json(&store.list_jobs().await?)
        }
        Commands::RunJob { id } => {
            let store = open_store(&config).await?;
            let engine = build_engine(&config, store)?;
            let scheduler = JobScheduler::new(engine, config.scheduler.clone());
            print_json(&scheduler.run_now(&id).await)
        }
        Commands::Schedule => {
            let store = open_store(&config).await?;
            let engine = build_engine(&config, store)?;
            let scheduler = JobScheduler::new(engine, config.scheduler.clone());
            let timers = scheduler.initialize().await?;
            tracing::info!("Scheduler running with {} job timers. Press Ctrl+C to stop.", timers);

            let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                }
                tracing::info!("Received shutdown signal");
                let _ = shutdown_tx.send(());
            });

            let mut heartbeat = tokio::time::interval(Duration::from_secs(300));
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => break,
                    _ = heartbeat.tick() => {
                        tracing::debug!("Active job timers: {:?}", scheduler.active_jobs());
                    }
                }
            }

            scheduler.stop_all();
            Ok(())
        }
        Commands::Reap => {
            let store = open_store(&config).await?;
            let report = reaper::run_once(&store, &config.scheduler, chrono::Utc::now()).await;
            print_json(&report)
        }
        Commands::Logs { table, limit } => {
            let store = open_store(&config).await?;
            print_json(&store.recent_logs(&table, limit).await?)
        }
    }
}
