//! Kiln Worker - serverless entry point for training jobs
//!
//! Reads one invocation payload, runs it through the job handler and prints
//! the structured result as JSON on stdout. Logs go to stderr.

mod config;

use anyhow::Context;
use clap::Parser;
use config::WorkerConfig;
use kiln_storage::{HttpCallbackNotifier, LocalObjectStore, ObjectStore, SupabaseStorage};
use kiln_training::{JobHandler, JobResult, JobSettings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable carrying the invocation payload when `--input` is absent.
const INPUT_ENV: &str = "KILN_JOB_INPUT";

const LOG_TARGETS: [&str; 4] = ["kiln_worker", "kiln_training", "kiln_storage", "trainer"];

/// Kiln Worker - run one LoRA training job
#[derive(Parser, Debug)]
#[command(name = "kiln-worker", author, version, about = "Run one serverless training job")]
struct Args {
    /// Invocation payload file (`-` for stdin). Defaults to KILN_JOB_INPUT, then stdin.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Worker configuration file (overrides KILN_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long)]
    log_level: Option<String>,

    /// Report environment checks instead of running a job
    #[arg(long)]
    diagnose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = WorkerConfig::load(args.config.as_deref());

    let level = args
        .log_level
        .clone()
        .or_else(|| config.as_ref().ok().and_then(|c| c.log_level.clone()));
    init_tracing(level.as_deref());

    let result = match config {
        Ok(config) => run(&args, config).await,
        Err(e) => {
            error!(error = %e, "failed to load worker configuration");
            JobResult::error(format!("worker configuration error: {e}"))
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn init_tracing(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level.unwrap_or("info");
        EnvFilter::new(LOG_TARGETS.iter().map(|t| format!("{t}={level}")).collect::<Vec<_>>().join(","))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(args: &Args, config: WorkerConfig) -> JobResult {
    let handler = match build_handler(config.settings) {
        Ok(handler) => handler,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to initialize worker");
            return JobResult::error(format!("{e:#}"));
        }
    };

    if args.diagnose {
        return handler.diagnose();
    }

    let payload = match read_payload(args.input.as_deref()).await {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to read job input");
            return JobResult::error(format!("{e:#}"));
        }
    };

    // A panic inside the handler still yields a structured result.
    let task = tokio::spawn(async move { handler.handle(&payload).await });
    match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            error!("training handler panicked");
            JobResult::error("training handler panicked")
        }
        Err(e) => JobResult::error(format!("training handler aborted: {e}")),
    }
}

fn build_handler(settings: JobSettings) -> anyhow::Result<JobHandler> {
    let store: Option<Arc<dyn ObjectStore>> =
        match SupabaseStorage::from_env().context("failed to configure Supabase storage")? {
            Some(supabase) => Some(Arc::new(supabase)),
            None => settings.storage.local_root.clone().map(|root| {
                let local = LocalObjectStore::new(root);
                info!(root = %local.root().display(), "using local object store");
                Arc::new(local) as Arc<dyn ObjectStore>
            }),
        };

    match &store {
        Some(store) => info!(backend = store.id(), "object storage configured"),
        None => warn!("no object storage configured; dataset fetch and uploads will be skipped"),
    }

    let notifier =
        HttpCallbackNotifier::new(settings.callback.timeout()).context("failed to create callback client")?;

    let mut handler = JobHandler::new(settings).with_notifier(Arc::new(notifier));
    if let Some(store) = store {
        handler = handler.with_store(store);
    }
    Ok(handler)
}

async fn read_payload(input: Option<&Path>) -> anyhow::Result<serde_json::Value> {
    let text = match input {
        Some(path) if path == Path::new("-") => read_stdin().await?,
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read job input {}", path.display()))?,
        None => match std::env::var(INPUT_ENV) {
            Ok(value) if !value.trim().is_empty() => value,
            _ => read_stdin().await?,
        },
    };

    serde_json::from_str(&text).context("job input is not valid JSON")
}

async fn read_stdin() -> anyhow::Result<String> {
    let mut text = String::new();
    tokio::io::stdin()
        .read_to_string(&mut text)
        .await
        .context("failed to read job input from stdin")?;
    Ok(text)
}
