use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use appraisal_pipeline::config;
use appraisal_pipeline::db;
use appraisal_pipeline::model::Step;
use appraisal_pipeline::pipeline::{Engine, PipelineRequest};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Re-run the appraisal pipeline for one record, starting at a given step"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Record id (row number in the pending sheet)
    #[arg(long)]
    id: u32,

    /// Step to start from, e.g. BUILD_ARTIFACT
    #[arg(long, default_value = "SET_VALUE")]
    from_step: String,

    /// Appraisal value; defaults to the value stored on the record
    #[arg(long)]
    value: Option<String>,

    /// Appraiser description; defaults to the stored one
    #[arg(long)]
    description: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let step = Step::parse_step(&args.from_step)
        .ok_or_else(|| anyhow!("unknown step {:?}", args.from_step))?;

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.app.default_database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let engine = Engine::from_config(&cfg, pool)?;
    let mut req = PipelineRequest::new(args.id, "cli");
    req.appraisal_value = args.value.filter(|v| !v.trim().is_empty());
    req.description = args.description.filter(|v| !v.trim().is_empty());

    match engine.process_from_step(req, step).await {
        Ok(report) => {
            for log in &report.steps {
                info!(step = %log.step, outcome = log.outcome.as_str(), elapsed_ms = log.elapsed_ms, "step");
            }
            info!(run_id = %report.run_id, "reprocess finished");
            Ok(())
        }
        Err(failure) => {
            for log in &failure.trail {
                info!(step = %log.step, outcome = log.outcome.as_str(), detail = ?log.detail, "step");
            }
            error!(error = %failure, "reprocess failed");
            Err(failure.into())
        }
    }
}
