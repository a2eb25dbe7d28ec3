use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use newsledger_mapping::load_raw_batch;
use newsledger_storage::{MasterStore, StoreError};
use newsledger_sync::{
    build_scheduler, render_run_lines, KeywordTagEnrichment, LedgerConfig, LedgerPipeline,
    SourceRegistry, SourceRunSummary,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status when the source master handed to `merge-unified` does not exist.
const EXIT_SOURCE_MISSING: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "newsledger")]
#[command(about = "Canonicalize news batches and maintain per-source and unified masters")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full run for one source: map, delta, enrich, merge both masters.
    Run {
        #[arg(long)]
        source: String,
        /// Raw batch (.csv or .json); defaults to the registry entry or data/raw/<source>/.
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Every enabled source in the registry, one after another.
    RunAll,
    /// Print how many batch rows are new to the source master.
    Delta {
        #[arg(long)]
        source: String,
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Fold an existing source master into the unified master.
    MergeUnified {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        master: PathBuf,
    },
    /// Run each enabled source on its cron until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = LedgerConfig::from_env();

    match cli.command {
        Commands::Run { source, input } => {
            let pipeline = build_pipeline(config)?;
            let input = resolve_input(&pipeline, &source, input)?;
            let summary = pipeline.run_source_from_path(&source, &input).await?;
            let report_dir = pipeline.write_report(&summary).await?;
            print_summary(&summary);
            println!("report: {}", report_dir.display());
        }
        Commands::RunAll => {
            let pipeline = build_pipeline(config)?;
            let registry = SourceRegistry::load(&pipeline.config().sources_path)?;
            let outcome = pipeline.run_all(&registry).await;
            for summary in &outcome.runs {
                if let Err(err) = pipeline.write_report(summary).await {
                    warn!(source_id = %summary.source_id, error = %format!("{err:#}"), "writing run report failed");
                }
                print_summary(summary);
            }
            for (source_id, err) in &outcome.failures {
                eprintln!("{source_id}: {err:#}");
            }
            if !outcome.failures.is_empty() {
                anyhow::bail!("{} source run(s) failed", outcome.failures.len());
            }
        }
        Commands::Delta { source, input } => {
            let pipeline = build_pipeline(config)?;
            let input = resolve_input(&pipeline, &source, input)?;
            let raw_rows = load_raw_batch(&input)?;
            let (_, delta) = pipeline.compute_source_delta(&source, &raw_rows).await?;
            println!("{}", delta.records.len());
        }
        Commands::MergeUnified { source, master } => {
            let lock_policy = config.lock_policy()?;
            let source_store = MasterStore::new(&source)
                .with_lock_policy(lock_policy)
                .with_json_mirror(config.json_mirror);
            let unified = MasterStore::new(&master)
                .with_lock_policy(lock_policy)
                .with_json_mirror(config.json_mirror);
            match unified.merge_from_master(&source_store).await {
                Ok(report) => {
                    info!(new_rows = report.new_rows, final_rows = report.final_rows, "unified master merged");
                    println!("{}", report.path.display());
                }
                Err(StoreError::SourceMasterMissing { path }) => {
                    eprintln!("source master not found: {}", path.display());
                    return Ok(ExitCode::from(EXIT_SOURCE_MISSING));
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("merging {} into {}", source.display(), master.display()));
                }
            }
        }
        Commands::Schedule => {
            let config = LedgerConfig {
                scheduler_enabled: true,
                ..config
            };
            let registry = SourceRegistry::load(&config.sources_path)?;
            let pipeline = Arc::new(build_pipeline(config)?);
            let Some(mut sched) = build_scheduler(Arc::clone(&pipeline), &registry).await? else {
                anyhow::bail!("scheduler disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn build_pipeline(config: LedgerConfig) -> Result<LedgerPipeline> {
    let tags_path = config.workspace_root.join("rules").join("tags.yaml");
    let pipeline = LedgerPipeline::from_config(config)?;
    if tags_path.exists() {
        let hook = KeywordTagEnrichment::from_path(&tags_path)?;
        return Ok(pipeline.with_enrichment(Box::new(hook)));
    }
    Ok(pipeline)
}

fn resolve_input(pipeline: &LedgerPipeline, source_id: &str, input: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = input {
        return Ok(path);
    }
    let registry = SourceRegistry::load(&pipeline.config().sources_path)?;
    let source = registry
        .find(source_id)
        .with_context(|| format!("source {source_id} is not in {}", pipeline.config().sources_path.display()))?;
    Ok(pipeline.config().raw_input_path(source))
}

fn print_summary(summary: &SourceRunSummary) {
    for line in render_run_lines(summary) {
        println!("{line}");
    }
}
