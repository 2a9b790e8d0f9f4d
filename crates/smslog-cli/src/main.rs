use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use smslog_core::{SyncMode, SyncStatus, SyncWindow};
use smslog_storage::{MemoryMessageStore, MessageStore, PgMessageStore};
use smslog_sync::{
    build_laml_client, install_signal_handler, runner_from_config, ConfigError,
    IncrementalScheduler, SyncConfig, SyncError,
};
use smslog_web::AppState;
use tracing::{error, info, warn};

const EXIT_FAILED: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

const POOL_SIZE: u32 = 5;

#[derive(Debug, Parser)]
#[command(name = "smslog")]
#[command(about = "Sync SMS delivery logs into Postgres")]
struct Cli {
    /// Print the (masked) configuration and log at debug level.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull messages from the remote API into the store.
    Sync(SyncArgs),
    /// Check credentials by fetching a small page.
    Test,
    /// Apply database migrations.
    Migrate,
    /// Run the HTTP server.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run incremental syncs on the configured cron schedule.
    Schedule,
}

/// Windows are capped at a century.
#[derive(Debug, Default, Args)]
#[group(multiple = false)]
struct WindowArgs {
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=876_000))]
    hours: Option<u32>,
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=36_500))]
    days: Option<u32>,
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=52_560_000))]
    minutes: Option<u32>,
}

impl WindowArgs {
    fn window(&self) -> SyncWindow {
        match (self.minutes, self.hours, self.days) {
            (Some(n), _, _) => SyncWindow::Minutes(n),
            (_, Some(n), _) => SyncWindow::Hours(n),
            (_, _, Some(n)) => SyncWindow::Days(n),
            _ => SyncWindow::default(),
        }
    }
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[command(flatten)]
    window: WindowArgs,
    /// Split fetching and writing across a bounded queue.
    #[arg(long)]
    queued: bool,
    /// Run against an in-memory store; nothing is written to Postgres.
    #[arg(long)]
    dry_run: bool,
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("smslog={level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG;
    }
    match err.downcast_ref::<SyncError>() {
        Some(
            SyncError::Config(_) | SyncError::InvalidOptions(_) | SyncError::InvalidWindow(_),
        ) => EXIT_CONFIG,
        _ => EXIT_FAILED,
    }
}

fn exit_code_for_status(status: SyncStatus) -> ExitCode {
    match status {
        SyncStatus::Completed => ExitCode::SUCCESS,
        SyncStatus::Failed => ExitCode::from(EXIT_FAILED),
        SyncStatus::Cancelled => ExitCode::from(EXIT_CANCELLED),
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = SyncConfig::from_env().context("loading configuration")?;
    if cli.debug {
        eprintln!("{config}");
    }

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => sync(&config, args).await,
        Commands::Test => test_connection(&config).await,
        Commands::Migrate => {
            let store = connect_store(&config).await?;
            store.close().await;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve { port } => serve(&config, port).await,
        Commands::Schedule => schedule(&config).await,
    }
}

async fn connect_store(config: &SyncConfig) -> Result<PgMessageStore> {
    let store = PgMessageStore::connect(&config.database_url, POOL_SIZE)
        .await
        .context("connecting to the database")?;
    store.migrate().await.context("running migrations")?;
    Ok(store)
}

async fn sync(config: &SyncConfig, args: SyncArgs) -> Result<ExitCode> {
    // Fail on missing credentials before touching the database.
    config.source_credentials()?;

    let window = args.window.window();
    let mode = if args.queued {
        SyncMode::Queued
    } else {
        config.sync_mode
    };

    let (store, pg): (Arc<dyn MessageStore>, Option<PgMessageStore>) = if args.dry_run {
        info!("dry run: writing to an in-memory store");
        (Arc::new(MemoryMessageStore::new()), None)
    } else {
        let pg = connect_store(config).await?;
        (Arc::new(pg.clone()), Some(pg))
    };

    let runner = runner_from_config(config, mode, store)?;
    let cancel = install_signal_handler();
    info!(%window, mode = mode.as_str(), "starting sync");
    let report = runner.run(window, cancel).await?;

    if let Some(pg) = pg {
        pg.close().await;
    }

    println!("{}", report.summary());
    if let Some(failure) = &report.failure {
        if !failure.batch_ids.is_empty() {
            eprintln!("unsaved ids: {}", failure.batch_ids.join(", "));
        }
    }
    Ok(exit_code_for_status(report.status))
}

async fn test_connection(config: &SyncConfig) -> Result<ExitCode> {
    let client = build_laml_client(config)?;
    println!("{config}");
    println!("checking {}", client.messages_url());

    match client.check_connection().await {
        Ok(Some(sample)) => {
            println!("connection ok; latest message:");
            println!("  sid:          {}", sample.sid.as_deref().unwrap_or("-"));
            println!("  status:       {}", sample.status.as_deref().unwrap_or("-"));
            println!(
                "  date_created: {}",
                sample.date_created.as_deref().unwrap_or("-")
            );
            Ok(ExitCode::SUCCESS)
        }
        Ok(None) => {
            println!("connection ok; no messages found");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            eprintln!("connection failed: {err}");
            Ok(ExitCode::from(EXIT_FAILED))
        }
    }
}

async fn serve(config: &SyncConfig, port: Option<u16>) -> Result<ExitCode> {
    let pg = connect_store(config).await?;
    let store: Arc<dyn MessageStore> = Arc::new(pg.clone());
    let cancel = install_signal_handler();

    let state = match runner_from_config(config, SyncMode::Synchronous, store.clone()) {
        Ok(runner) => AppState::new(store).with_runner(runner),
        Err(err) => {
            warn!(error = %err, "sync trigger disabled");
            AppState::new(store).with_runner_unavailable(err.to_string())
        }
    }
    .with_cancel(cancel.clone());

    smslog_web::serve(state, port.unwrap_or(config.web_port), cancel).await?;
    pg.close().await;
    Ok(ExitCode::SUCCESS)
}

async fn schedule(config: &SyncConfig) -> Result<ExitCode> {
    config.source_credentials()?;
    let pg = connect_store(config).await?;
    let store: Arc<dyn MessageStore> = Arc::new(pg.clone());
    let runner = runner_from_config(config, config.sync_mode, store)?;
    let cancel = install_signal_handler();

    let scheduler = IncrementalScheduler::new(
        runner,
        &config.sync_cron,
        config.incremental_window(),
        cancel.clone(),
    )
    .await?;
    scheduler.run_until_cancelled(cancel).await?;
    pg.close().await;
    Ok(ExitCode::SUCCESS)
}
