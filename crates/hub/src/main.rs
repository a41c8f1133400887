mod config;

use anyhow::Context;
use builder_manager::BuilderManager;
use clap::Parser;
use command_table::CommandTable;
use config::HubConfig;
use job_manager::{JobManager, JobManagerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use store::{MongoSourceBackend, MongoTargetBackend, SourceBackend, TargetBackend};

/// The data integration hub: merge engine, job control plane, and the
/// command surface an operator shell or API front end would sit behind.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the hub's YAML configuration file.
    #[clap(long = "config", env = "HUB_CONFIG", default_value = "hub.yaml")]
    config: PathBuf,
}

fn main() -> Result<(), anyhow::Error> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(!matches!(std::env::var("NO_COLOR"), Ok(v) if v == "1"))
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(?args, "started!");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let task = runtime.spawn(async move { async_main(args).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result?
}

async fn async_main(args: Args) -> Result<(), anyhow::Error> {
    let config = HubConfig::load(&args.config).context("loading hub configuration")?;

    let source_client = mongodb::Client::with_uri_str(&config.source_db_uri)
        .await
        .context("connecting to source database")?;
    let target_client = if config.target_db_uri.is_some() {
        mongodb::Client::with_uri_str(config.target_db_uri())
            .await
            .context("connecting to target database")?
    } else {
        source_client.clone()
    };

    let source_db_name = config.source_db_name.clone();
    let source_uri = config.source_db_uri.clone();
    let source_client_for_factory = source_client.clone();
    let source_backend_factory: Arc<dyn Fn() -> Arc<dyn SourceBackend> + Send + Sync> =
        Arc::new(move || {
            let db = source_client_for_factory.database(&source_db_name);
            Arc::new(MongoSourceBackend::new(db.clone(), db, source_uri.clone()))
                as Arc<dyn SourceBackend>
        });

    let target_db_name = config.target_db_name().to_string();
    let target_uri = config.target_db_uri().to_string();
    let target_client_for_factory = target_client.clone();
    let target_backend_factory: Arc<dyn Fn() -> Arc<dyn TargetBackend> + Send + Sync> =
        Arc::new(move || {
            let db = target_client_for_factory.database(&target_db_name);
            Arc::new(MongoTargetBackend::new(db, target_uri.clone())) as Arc<dyn TargetBackend>
        });

    let job_manager = Arc::new(
        JobManager::new(JobManagerConfig {
            num_workers: config.num_workers,
            max_memory_usage: config.max_memory_usage,
            worker_binary: config.worker_binary.clone(),
        })
        .await
        .context("starting job manager")?,
    );

    let builder_manager = Arc::new(BuilderManager::new(
        source_backend_factory,
        target_backend_factory,
        job_manager,
        config.builder_config(),
        config.poll_schedule.clone(),
    ));
    builder_manager.sync().await.context("syncing build configurations")?;

    // Constructed here so a future SSH/HTTP front end has something to
    // bind to; this binary itself drives the poll loop directly.
    let _command_table = Arc::new(CommandTable::new(builder_manager.clone()));

    let scheduler = if config.poll_schedule.is_some() {
        Some(
            builder_manager
                .clone()
                .spawn_poll_scheduler()
                .await
                .context("starting poll scheduler")?,
        )
    } else {
        tracing::info!("no poll_schedule configured, scheduler not started");
        None
    };

    tracing::info!("hub is running");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");

    if let Some(mut scheduler) = scheduler {
        let _ = scheduler.shutdown().await;
    }

    Ok(())
}
