//! Bifrost runtime binary.
//!
//! Run modes:
//! - `bifrost-server consumer` — consume the workflow-execution queue and
//!   drive executions through the process pool
//! - `bifrost-server worker <execution-id>` — worker process entry, spawned
//!   by the pool for one execution
//! - `bifrost-server poison` — dead-letter processor (arrival-driven plus
//!   the five-minute backup sweep)
//! - `bifrost-server cleanup` — time out executions stuck in Pending or
//!   Running
//! - `bifrost-server scan` — validate the workspace tree and print the
//!   report

mod builtin;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use bifrost_core::broadcast::NoopBroadcaster;
use bifrost_core::exec::{
    EmptyConfigSource, PoisonQueueProcessor, ProcessPool, ProcessPoolConfig, QueueConsumer,
    StuckExecutionSweeper,
};
use bifrost_core::repository::{ExecutionLogRepository, ExecutionRecorder, ExecutionRepository};
use bifrost_core::storage::{MemoryTableStore, TableStore};
use bifrost_core::{Engine, Settings, WorkflowRegistry, WorkspaceScanner};
use bifrost_db::{FsBlobStore, LapinWorkQueue, PgTableStore, RedisHandshakeStore, TableName};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();
    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(String::as_str).unwrap_or("consumer");

    match mode {
        "consumer" => run_consumer(settings).await,
        "worker" => {
            let execution_id: Uuid = args
                .get(2)
                .context("usage: bifrost-server worker <execution-id>")?
                .parse()
                .context("execution id must be a UUID")?;
            run_worker(settings, execution_id).await
        }
        "poison" => run_poison(settings).await,
        "cleanup" => run_cleanup(settings).await,
        "scan" => run_scan(settings),
        other => {
            bail!("unknown mode '{other}' (expected consumer, worker, poison, cleanup or scan)")
        }
    }
}

/// Open the three tables, preferring Postgres and falling back to
/// process-local memory for development.
async fn open_tables(
    settings: &Settings,
) -> Result<(Arc<dyn TableStore>, Arc<dyn TableStore>, Option<Arc<dyn TableStore>>)> {
    if let Some(database_url) = &settings.database_url {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("failed to connect to database")?;
        let entities = PgTableStore::open(pool.clone(), TableName::Entities).await?;
        let relationships = PgTableStore::open(pool.clone(), TableName::Relationships).await?;
        let logs = PgTableStore::open(pool, TableName::ExecutionLogs).await?;
        Ok((
            Arc::new(entities),
            Arc::new(relationships),
            Some(Arc::new(logs)),
        ))
    } else {
        warn!("DATABASE_URL not set, using in-memory tables (records do not survive restarts)");
        Ok((
            Arc::new(MemoryTableStore::new()),
            Arc::new(MemoryTableStore::new()),
            None,
        ))
    }
}

fn build_registry(settings: &Settings) -> Result<Arc<WorkflowRegistry>> {
    let registry = Arc::new(WorkflowRegistry::new());
    builtin::register_builtin(&registry)?;
    if settings.workspace_dir.is_dir() {
        let scanner = WorkspaceScanner::new(&settings.workspace_dir);
        let reports = registry.load_workspace(&scanner);
        info!(
            scripts = reports.len(),
            workflows = registry.workflow_names().len(),
            "Workspace scan complete"
        );
    } else {
        info!(
            workspace = %settings.workspace_dir.display(),
            "Workspace directory missing, starting with an empty registry"
        );
    }
    Ok(registry)
}

fn build_recorder(
    settings: &Settings,
    entities: Arc<dyn TableStore>,
    relationships: Arc<dyn TableStore>,
) -> ExecutionRecorder {
    ExecutionRecorder::new(
        ExecutionRepository::new(entities, relationships),
        Arc::new(FsBlobStore::new(&settings.blob_root)),
        Arc::new(NoopBroadcaster),
    )
}

async fn run_consumer(settings: Settings) -> Result<()> {
    info!(queue = %settings.queue_name, "Starting workflow-execution consumer");

    let (entities, relationships, _) = open_tables(&settings).await?;
    let recorder = build_recorder(&settings, entities, relationships);
    let registry = build_registry(&settings)?;

    let handshake = RedisHandshakeStore::connect(&settings.redis_url)
        .await
        .context("failed to connect to Redis")?;
    let pool_config = ProcessPoolConfig {
        worker_program: std::env::current_exe()?,
        graceful_shutdown_seconds: settings.graceful_shutdown_seconds,
        cancel_check_interval_ms: settings.cancel_check_interval_ms,
    };
    let pool = Arc::new(ProcessPool::new(Arc::new(handshake), pool_config));

    let queue = LapinWorkQueue::connect(
        &settings.amqp_url,
        &settings.queue_name,
        &settings.poison_queue_name,
    )
    .await
    .context("failed to connect to broker")?;

    let consumer = QueueConsumer::new(
        Arc::new(queue),
        recorder,
        registry,
        pool,
        Arc::new(EmptyConfigSource),
    );

    consumer.run().await?;
    Ok(())
}

async fn run_worker(settings: Settings, execution_id: Uuid) -> Result<()> {
    let registry = build_registry(&settings)?;

    let handshake = Arc::new(
        RedisHandshakeStore::connect(&settings.redis_url)
            .await
            .context("failed to connect to Redis")?,
    );

    let mut engine = Engine::new(registry);
    if settings.database_url.is_some() {
        let (_, _, logs) = open_tables(&settings).await?;
        if let Some(logs) = logs {
            engine = engine.with_log_repository(ExecutionLogRepository::new(logs));
        }
    }

    bifrost_core::exec::run_worker(execution_id, Arc::new(engine), handshake).await?;
    Ok(())
}

async fn run_poison(settings: Settings) -> Result<()> {
    info!(queue = %settings.poison_queue_name, "Starting poison queue processor");

    let (entities, relationships, _) = open_tables(&settings).await?;
    let recorder = build_recorder(&settings, entities, relationships);

    let arrival_queue = Arc::new(
        LapinWorkQueue::connect_poison(&settings.amqp_url, &settings.poison_queue_name)
            .await
            .context("failed to connect to broker")?,
    );
    let sweep_queue = Arc::new(
        LapinWorkQueue::connect_poison(&settings.amqp_url, &settings.poison_queue_name)
            .await
            .context("failed to connect to broker")?,
    );

    let arrival = PoisonQueueProcessor::new(arrival_queue, recorder.clone());
    let timer = PoisonQueueProcessor::new(sweep_queue, recorder);

    tokio::select! {
        result = arrival.run() => result?,
        result = timer.run_timer() => result?,
    }
    Ok(())
}

async fn run_cleanup(settings: Settings) -> Result<()> {
    let (entities, relationships, _) = open_tables(&settings).await?;
    let recorder = build_recorder(&settings, entities, relationships);

    let sweeper = StuckExecutionSweeper::new(recorder).with_timeouts(
        settings.pending_timeout_minutes,
        settings.running_timeout_minutes,
    );
    let report = sweeper.cleanup().await?;
    println!(
        "cleaned {} stuck executions ({} pending, {} running, {} failed)",
        report.cleaned, report.pending, report.running, report.failed
    );
    Ok(())
}

fn run_scan(settings: Settings) -> Result<()> {
    let scanner = WorkspaceScanner::new(&settings.workspace_dir);
    let reports = scanner.scan();
    if reports.is_empty() {
        println!(
            "No scripts found under {}",
            settings.workspace_dir.display()
        );
        return Ok(());
    }
    for (path, report) in reports {
        let verdict = if report.valid { "ok" } else { "INVALID" };
        println!("{verdict:8} {}", path.display());
        for issue in report.issues {
            match issue.line {
                Some(line) => println!("         line {line}: {}", issue.message),
                None => println!("         {}", issue.message),
            }
        }
    }
    Ok(())
}
