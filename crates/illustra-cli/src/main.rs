//! illustra - drive the illustration scheduler from the command line.
//!
//! - `demo`: create a simulated story and illustrate it end to end
//! - `tasks`: list persisted tasks from a task database
//! - `prune`: delete old Ready/Failed tasks

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use illustra_core::config::{load_config, load_config_from_path};
use illustra_core::domain::{PersistedTaskRecord, StoryId};
use illustra_core::impls::{InMemoryPageStore, LocalArtifactStore, SimulatedGenerator};
use illustra_core::ports::TaskStore;
use illustra_core::store::{InMemoryTaskStore, SqliteTaskStore};
use illustra_core::{Coordinator, CoordinatorBuilder, SchedulerConfig};

#[derive(Parser, Debug)]
#[command(
    name = "illustra",
    version,
    about = "Background illustration scheduler",
    long_about = None
)]
struct Cli {
    /// Config file (defaults to ./illustra.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Illustrate a simulated story with a fake generator.
    Demo {
        /// Number of pages in the story.
        #[arg(long, default_value_t = 6)]
        pages: u32,

        /// Probability that a generation call fails transiently.
        #[arg(long, default_value_t = 0.2)]
        fail_rate: f64,

        /// Simulated latency per generation call, in milliseconds.
        #[arg(long, default_value_t = 200)]
        latency_ms: u64,

        /// Also generate a character reference image first.
        #[arg(long)]
        reference: Option<String>,

        /// Persist tasks in this SQLite file instead of memory.
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// List persisted tasks (non-terminal ones, or every task of a story).
    Tasks {
        #[arg(long)]
        db: Option<PathBuf>,

        #[arg(long)]
        story: Option<String>,

        /// One JSON object per line.
        #[arg(long)]
        json: bool,
    },
    /// Delete Ready/Failed tasks older than the given age.
    Prune {
        #[arg(long)]
        db: Option<PathBuf>,

        /// Age in hours (defaults to `prune_after_hours`).
        #[arg(long)]
        hours: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config_from_path(path),
        None => load_config(),
    }
    .context("loading configuration")?;

    match cli.command {
        Commands::Demo {
            pages,
            fail_rate,
            latency_ms,
            reference,
            db,
        } => {
            let generator = SimulatedGenerator::new(fail_rate, Duration::from_millis(latency_ms));
            info!(fail_rate = generator.fail_rate(), latency_ms, "simulated generator");
            run_demo(config, pages, generator, reference, db).await
        }
        Commands::Tasks { db, story, json } => {
            let store = open_store(db.as_deref().unwrap_or(&config.database_path)).await?;
            list_tasks(&store, story.as_deref(), json).await
        }
        Commands::Prune { db, hours } => {
            let store = open_store(db.as_deref().unwrap_or(&config.database_path)).await?;
            let hours = hours.unwrap_or(config.prune_after_hours);
            let age = i64::try_from(hours)
                .ok()
                .and_then(chrono::Duration::try_hours)
                .context("--hours is out of range")?;
            let cutoff = Utc::now() - age;
            let pruned = store.prune_terminal(cutoff).await?;
            println!("pruned {pruned} task(s) last updated before {cutoff}");
            Ok(())
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("illustra=info,illustra_core=info,warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_store(path: &Path) -> Result<SqliteTaskStore> {
    SqliteTaskStore::open(path)
        .await
        .with_context(|| format!("opening task database {}", path.display()))
}

async fn run_demo(
    config: SchedulerConfig,
    page_count: u32,
    generator: SimulatedGenerator,
    reference: Option<String>,
    db: Option<PathBuf>,
) -> Result<()> {
    let tasks: Arc<dyn TaskStore> = match &db {
        Some(path) => Arc::new(open_store(path).await?),
        None => Arc::new(InMemoryTaskStore::new()),
    };
    let pages = Arc::new(InMemoryPageStore::new());
    let coordinator = CoordinatorBuilder::new(config.clone())
        .task_store(tasks)
        .page_store(pages.clone())
        .generator(Arc::new(generator))
        .artifact_store(Arc::new(LocalArtifactStore::new(&config.artifact_dir)))
        .build()?;

    let story = StoryId::generate();
    let descriptions: Vec<String> = (1..=page_count)
        .map(|n| format!("page {n} of a bedtime story about a curious fox"))
        .collect();
    pages.add_story(story, descriptions).await;
    info!(%story, pages = page_count, "story created");

    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let target = event
                .page_id
                .map(|p| p.to_string())
                .unwrap_or_else(|| "reference".into());
            println!("{:<34} {}", target, event.status);
        }
    });

    if let Some(description) = reference.as_deref() {
        coordinator.enqueue_global_reference(story, description).await?;
    }
    coordinator.enqueue_for_story(story).await?;
    if config.background_enabled {
        coordinator.start().await?;
    } else {
        warn!("background generation disabled; tasks stay queued");
        return Ok(());
    }

    tokio::select! {
        result = wait_until_settled(&coordinator, story) => result?,
        _ = tokio::signal::ctrl_c() => warn!("interrupted, waiting for in-flight tasks"),
    }
    coordinator.stop().await?;

    println!();
    for page in pages.pages_for_story(story).await {
        println!(
            "page {:>3}/{:<3} {:<10} {}",
            page.page_number,
            page.total_pages,
            page.illustration_status,
            page.illustration_path.as_deref().unwrap_or("-")
        );
    }
    let status = coordinator.story_status(story).await?;
    println!(
        "\n{} ready, {} failed, {} unfinished",
        status.ready,
        status.failed,
        status.total() - status.ready - status.failed
    );
    Ok(())
}

/// Returns once no task of the story is left to run. A story with no tasks
/// at all (zero pages, no reference) is settled from the start.
async fn wait_until_settled(coordinator: &Coordinator, story: StoryId) -> Result<()> {
    loop {
        let status = coordinator.story_status(story).await?;
        if status.is_settled() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn list_tasks(store: &SqliteTaskStore, story: Option<&str>, json: bool) -> Result<()> {
    let records: Vec<PersistedTaskRecord> = match story {
        Some(raw) => {
            let story_id = StoryId::parse(raw).with_context(|| format!("invalid story id {raw}"))?;
            store.get_for_story(story_id).await?
        }
        None => store.get_all_pending().await?,
    };

    for record in &records {
        if json {
            println!("{}", serde_json::to_string(record)?);
            continue;
        }
        let target = match record.task.page_id() {
            Some(page_id) => format!("page {} ({page_id})", record.context.page_number),
            None => "reference".to_string(),
        };
        println!(
            "{}  {:<8}  {:<22}  attempts={}  {}",
            record.task.id,
            record.task.priority,
            record.task.status.to_string(),
            record.task.attempt_count,
            target
        );
    }
    if !json {
        println!("{} task(s)", records.len());
    }
    Ok(())
}
