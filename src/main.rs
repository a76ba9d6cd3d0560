use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use appraisal_pipeline::api::{self, AppState};
use appraisal_pipeline::config;
use appraisal_pipeline::db;
use appraisal_pipeline::pipeline::Engine;
use appraisal_pipeline::queue::{self, MessageHandler, Queue};
use appraisal_pipeline::worker::PipelineWorker;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.app.default_database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let engine = Engine::from_config(&cfg, pool.clone())?;
    let queue = Queue::from_config(pool.clone(), &cfg.app);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Per-record ordering is enforced by the queue, so workers may run in parallel.
    let handler: Arc<dyn MessageHandler> = Arc::new(PipelineWorker::new(engine.clone()));
    let workers: Vec<_> = (0..cfg.app.workers)
        .map(|_| {
            tokio::spawn(queue::run_subscriber(
                queue.clone(),
                cfg.queue.topic.clone(),
                handler.clone(),
                cfg.app.poll_interval(),
                shutdown_rx.clone(),
            ))
        })
        .collect();

    let app = api::router(AppState {
        engine,
        queue,
        topic: cfg.queue.topic.clone(),
        shared_secret: cfg.intake.shared_secret.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&cfg.app.listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.app.listen))?;
    info!(listen = %cfg.app.listen, workers = cfg.app.workers, "starting appraisal pipeline");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(?err, "failed to listen for shutdown signal");
            }
            info!("shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for res in futures::future::join_all(workers).await {
        if let Err(err) = res {
            error!(?err, "queue worker panicked");
        }
    }
    pool.close().await;
    Ok(())
}
