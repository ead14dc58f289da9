//! Waypoint CLI - Command line interface for the local store and sync engine.
//!
//! Syncs against a directory of JSON fixtures standing in for the backend,
//! and prints what the app's screens would show.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use waypoint_app::{App, AppConfig, Pipeline, SyncIfNecessary};
use waypoint_storage::Database;
use waypoint_sync::{FileRemote, KindOutcome, SyncKind, SyncReport, NEWS_TOPIC, SYNC_TOPIC};

const DEFAULT_CONFIG: &str = "waypoint.json";

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(about = "Waypoint - Local store and sync engine")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file pointing at a database.
    Init {
        /// Database file to use.
        #[arg(short, long)]
        database: PathBuf,
    },

    /// Run a forced sync against a fixtures directory.
    Sync {
        /// Directory holding steps.json and news.json.
        #[arg(short, long)]
        fixtures: PathBuf,
    },

    /// Sync only if a sync is pending or none ever succeeded.
    SyncIfNeeded {
        /// Directory holding steps.json and news.json.
        #[arg(short, long)]
        fixtures: PathBuf,
    },

    /// List steps, or show one step with its links.
    Steps {
        /// Position of a single step.
        #[arg(short, long)]
        position: Option<i32>,
    },

    /// List news items.
    News,

    /// Show sync status and progress.
    Status,

    /// Deliver a push message and run the sync it requests.
    Push {
        /// "sync" or "news".
        #[arg(short, long, default_value = "sync")]
        topic: String,

        /// Message payload.
        #[arg(short, long, default_value = "{}")]
        data: String,

        /// Directory holding steps.json and news.json.
        #[arg(short, long)]
        fixtures: PathBuf,
    },

    /// Register a push token with the backend.
    Register {
        /// Push token.
        #[arg(short, long)]
        token: String,

        /// Directory standing in for the backend.
        #[arg(short, long)]
        fixtures: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { database } => cmd_init(&cli.config, database),
        Commands::Sync { fixtures } => cmd_sync(&cli.config, &fixtures).await,
        Commands::SyncIfNeeded { fixtures } => cmd_sync_if_needed(&cli.config, &fixtures).await,
        Commands::Steps { position } => cmd_steps(&cli.config, position),
        Commands::News => cmd_news(&cli.config),
        Commands::Status => cmd_status(&cli.config),
        Commands::Push {
            topic,
            data,
            fixtures,
        } => cmd_push(&cli.config, &topic, &data, &fixtures).await,
        Commands::Register { token, fixtures } => {
            cmd_register(&cli.config, &token, &fixtures).await
        }
    }
}

/// Load the configuration, falling back to defaults when the file is absent.
fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        info!("No config at {}; using defaults", path.display());
        return Ok(AppConfig::default());
    }
    AppConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn open_database(config_path: &Path) -> Result<Database> {
    let config = load_config(config_path)?;
    Database::open(&config.store_config()).context("Failed to open database")
}

fn open_app(config_path: &Path, fixtures: &Path) -> Result<App> {
    let config = load_config(config_path)?;
    let remote = Arc::new(FileRemote::new(fixtures));
    App::open(config, remote).context("Failed to open app")
}

fn cmd_init(config_path: &Path, database: PathBuf) -> Result<()> {
    let config = AppConfig::with_database(database);
    config
        .save(config_path)
        .context("Failed to write config")?;

    // Creates the schema up front.
    Database::open(&config.store_config()).context("Failed to create database")?;

    println!("Config written to {}", config_path.display());
    Ok(())
}

async fn cmd_sync(config_path: &Path, fixtures: &Path) -> Result<()> {
    let app = open_app(config_path, fixtures)?;
    let report = app.sync_now().await;
    print_report(&report);
    if !report.is_success() {
        anyhow::bail!("Sync did not complete");
    }
    Ok(())
}

async fn cmd_sync_if_needed(config_path: &Path, fixtures: &Path) -> Result<()> {
    let app = open_app(config_path, fixtures)?;
    let runs_before = app.engine().stats().await.runs;

    let requested = Pipeline::<SyncIfNecessary>::first(&app.sync_if_necessary_now())
        .await
        .context("Failed to check sync state")?
        .unwrap_or(false);

    if !requested {
        println!("Up to date.");
        return Ok(());
    }

    wait_for_run(&app, runs_before).await?;
    println!("Sync requested and finished.");
    Ok(())
}

fn cmd_steps(config_path: &Path, position: Option<i32>) -> Result<()> {
    let db = open_database(config_path)?;

    if let Some(position) = position {
        let combined = db
            .step_with_links_by_position(position)
            .context("Failed to read step")?;
        let Some(step) = combined.step else {
            anyhow::bail!("No step at position {}", position);
        };

        println!("{}. {}", step.position, step.title);
        if !step.description.is_empty() {
            println!("   {}", step.description);
        }
        if !step.possible_date.is_empty() {
            println!("   Possible date: {}", step.possible_date);
        }
        for link in combined.links {
            println!("   - {} <{}>", link.title, link.url);
        }
        return Ok(());
    }

    let steps = db.steps().all().context("Failed to read steps")?;
    if steps.is_empty() {
        println!("No steps. Run a sync first.");
    }
    for step in steps {
        let mark = if step.completed { "x" } else { " " };
        println!("[{}] {}. {}", mark, step.position, step.title);
    }
    Ok(())
}

fn cmd_news(config_path: &Path) -> Result<()> {
    let db = open_database(config_path)?;
    let news = db.news().all().context("Failed to read news")?;

    if news.is_empty() {
        println!("No news.");
    }
    for item in news {
        println!("{}  {}", item.date.format("%Y-%m-%d"), item.title);
        if let Some(tldr) = item.tldr {
            println!("            {}", tldr);
        }
        println!("            {}", item.url);
    }
    Ok(())
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let db = open_database(config_path)?;

    let completed = db.steps().count_completed()?;
    let total = db.steps().all()?.len();
    let pending = db.syncs().pending()?.len();

    println!("Steps completed: {}/{}", completed, total);
    println!("Pending syncs:   {}", pending);
    match db.syncs().last_successful()? {
        Some(sync) => {
            let when = sync
                .time_synced
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            println!("Last sync:       {}", when);
        }
        None => println!("Last sync:       never"),
    }
    Ok(())
}

async fn cmd_push(config_path: &Path, topic: &str, data: &str, fixtures: &Path) -> Result<()> {
    let topic = match topic {
        "sync" => SYNC_TOPIC,
        "news" => NEWS_TOPIC,
        other => other,
    };

    let app = open_app(config_path, fixtures)?;
    let runs_before = app.engine().stats().await.runs;
    let message = app
        .on_push_message(topic, data)
        .context("Failed to handle push message")?;
    println!("Stored {} message", message.message_type);

    wait_for_run(&app, runs_before).await?;
    println!("Sync finished.");
    Ok(())
}

async fn cmd_register(config_path: &Path, token: &str, fixtures: &Path) -> Result<()> {
    let app = open_app(config_path, fixtures)?;
    let runs_before = app.engine().stats().await.runs;

    let registered = app
        .register(token)
        .await
        .context("Failed to register token")?;

    if registered {
        println!("Token registered.");
        wait_for_run(&app, runs_before).await?;
    } else {
        println!("Token already registered.");
    }
    Ok(())
}

/// Wait until the engine has finished more runs than `runs_before`.
async fn wait_for_run(app: &App, runs_before: u64) -> Result<()> {
    let limit = app.config().sync.replace_timeout * 2 + Duration::from_secs(30);
    let mut phase = app.engine().phase();

    let report = tokio::time::timeout(limit, async {
        loop {
            let stats = app.engine().stats().await;
            if stats.runs > runs_before {
                return stats.last_report;
            }
            // Either the phase moves or we look again shortly.
            let _ = tokio::time::timeout(Duration::from_millis(50), phase.changed()).await;
        }
    })
    .await
    .context("Timed out waiting for sync")?;

    if let Some(report) = report {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!(
        "Sync {} in {} ms",
        if report.is_success() { "succeeded" } else { "failed" },
        report.duration.as_millis()
    );
    for kind in [SyncKind::Steps, SyncKind::News] {
        let line = match report.outcome(kind) {
            KindOutcome::Replaced { count } => format!("{} replaced", count),
            KindOutcome::NetworkFailed(e) => format!("network failure: {}", e),
            KindOutcome::PersistenceFailed(e) => format!("store failure: {}", e),
            KindOutcome::TimedOut => "timed out".to_string(),
        };
        println!("  {:<6} {}", kind, line);
    }
    if !report.finalized.is_empty() {
        println!("  Finalized {} pending sync(s)", report.finalized.len());
    }
    if let Some(delay) = report.retry_after {
        println!("  Retry scheduled in {} s", delay.as_secs());
    }
}
