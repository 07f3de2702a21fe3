//! Operator tool for Batchwork.
//!
//! Usage:
//!   batchwork demo --json
//!   batchwork demo --config batchwork.toml --snapshot ./state.json
//!   batchwork inspect ./state.json

use anyhow::{Context, Result, bail};
use batchwork::{
    BatchScheduler, BatchSnapshot, BatchworkError, FileSnapshotStore, InMemoryStatsCollector,
    JobDefinition, JobPriority, JobStatus, LockManager, LoggingConfig, RuntimeJob,
    SchedulerConfig, SnapshotStore, telemetry::init_logging, work::work_fn,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "batchwork")]
#[command(about = "Run and inspect Batchwork batch schedules")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,

    #[arg(long, global = true, help = "Emit logs as JSON lines")]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run a small dependency chain with one transient failure")]
    Demo {
        #[arg(long, help = "Scheduler configuration file (TOML)", value_name = "FILE")]
        config: Option<PathBuf>,

        #[arg(long, help = "Persist the job table to this file", value_name = "FILE")]
        snapshot: Option<PathBuf>,

        #[arg(long, help = "Print the final snapshot as JSON")]
        json: bool,

        #[arg(
            long,
            default_value = "30",
            help = "Give up waiting after this many seconds"
        )]
        timeout_secs: u64,
    },

    #[command(about = "Summarise a persisted snapshot file")]
    Inspect {
        #[arg(help = "Snapshot file written by the scheduler", value_name = "FILE")]
        path: PathBuf,

        #[arg(long, help = "Print the summary as JSON")]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging = LoggingConfig {
        level: if cli.verbose { "debug" } else { "warn" }.to_string(),
        json_format: cli.log_json,
        include_location: false,
    };
    init_logging(&logging)?;

    match cli.command {
        Commands::Demo {
            config,
            snapshot,
            json,
            timeout_secs,
        } => run_demo(config, snapshot, json, Duration::from_secs(timeout_secs)).await,
        Commands::Inspect { path, json } => inspect(path, json).await,
    }
}

async fn run_demo(
    config_path: Option<PathBuf>,
    snapshot_path: Option<PathBuf>,
    json: bool,
    timeout: Duration,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => SchedulerConfig::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SchedulerConfig::development()
            .with_max_concurrent(2)
            .with_class_limit("io", 1)
            .with_max_backoff(Duration::from_millis(500)),
    };
    if let Some(path) = snapshot_path {
        config = config.with_snapshot_path(path);
    }

    // An external holder keeps the staging area busy for the first moments.
    let locks = Arc::new(LockManager::new());
    locks.acquire("staging", Duration::from_millis(300))?;

    let stats = Arc::new(InMemoryStatsCollector::new_default());
    let scheduler = BatchScheduler::builder(config)
        .with_metrics(stats.clone())
        .with_lock_authority(locks.clone())
        .build()?;
    scheduler.wait_until_recovered().await;

    let stage_attempts = Arc::new(AtomicU32::new(0));
    let flaky_stage = {
        let stage_attempts = stage_attempts.clone();
        work_fn(move |job: RuntimeJob| {
            let attempt = stage_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if attempt == 1 {
                    return Err(BatchworkError::Processing(format!(
                        "{}: staging area not ready",
                        job.id()
                    )));
                }
                Ok(())
            }
        })
    };

    let definitions = vec![
        JobDefinition::new("prep")
            .with_description("Collect input files")
            .with_class("io")
            .with_priority(JobPriority::HIGHEST)
            .with_payload(json!({"source": "inbox"})),
        JobDefinition::new("stage")
            .with_description("Load inputs into the staging area")
            .with_class("io")
            .depends_on("prep")
            .with_max_retries(2)
            .with_retry_backoff(Duration::from_millis(50))
            .with_resource_tag("staging")
            .with_work(flaky_stage),
        JobDefinition::new("audit")
            .with_description("Independent consistency audit")
            .with_priority(JobPriority::LOWEST)
            .with_aging(Duration::from_secs(1))
            .with_resource_tag("staging"),
        JobDefinition::new("confirm")
            .with_description("Publish the batch")
            .depends_on("stage")
            .depends_on("audit"),
    ];

    for definition in definitions {
        if scheduler.get(&definition.id).is_some() {
            info!(job_id = %definition.id, "Job restored from snapshot, not resubmitting");
            continue;
        }
        scheduler.submit(definition)?;
    }

    let idle = scheduler.wait_for_idle(timeout).await;
    let snapshot = scheduler.snapshot();
    scheduler.shutdown().await?;

    if json {
        let output = json!({
            "idle": idle,
            "snapshot": snapshot,
            "statistics": stats.all_statistics(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_snapshot(&snapshot);
        println!();
        for stats in stats.all_statistics() {
            println!(
                "class {:<10} started {:>2}  succeeded {:>2}  retried {:>2}  failed {:>2}  avg {:.1}ms",
                stats.class,
                stats.started,
                stats.succeeded,
                stats.retried,
                stats.failed,
                stats.avg_processing_time_ms
            );
        }
    }

    if !idle {
        bail!("jobs still pending after {}s", timeout.as_secs());
    }
    Ok(())
}

async fn inspect(path: PathBuf, json: bool) -> Result<()> {
    if !path.exists() {
        bail!("snapshot file {} does not exist", path.display());
    }

    let store = FileSnapshotStore::new(&path);
    let jobs = store.load().await;
    let snapshot = BatchSnapshot::from_jobs(Utc::now(), &jobs, &BTreeMap::new());

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!("{}: {} jobs", path.display(), snapshot.total());
        print_snapshot(&snapshot);
    }
    Ok(())
}

fn print_snapshot(snapshot: &BatchSnapshot) {
    for status in JobStatus::ALL {
        let jobs = snapshot.bucket(status);
        if jobs.is_empty() {
            continue;
        }
        println!("{:<10} {}", status, jobs.len());
        for job in jobs {
            let reason = job
                .failure_reason
                .as_deref()
                .map(|reason| format!("  ({})", reason))
                .unwrap_or_default();
            println!(
                "  {:<12} class={:<8} priority={} attempts={}{}",
                job.id(),
                job.class(),
                job.priority(),
                job.attempts,
                reason
            );
        }
    }

    for (class, counts) in &snapshot.per_class {
        let limit = counts
            .concurrency_limit
            .map(|limit| limit.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "class {:<10} running {}  queued {}  limit {}",
            class, counts.running, counts.queued, limit
        );
    }
}
