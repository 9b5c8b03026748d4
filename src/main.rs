//! crm-sync - submit a file of operations through the batch core

use anyhow::Context;
use clap::Parser;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crm_sync::{config::Args, logging, Operation, ProcessRequest, SyncRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    logging::init(&args.log_level, args.json_logs());

    let config = match args.to_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!("======================================");
    info!("  crm-sync - batch execution core");
    info!("======================================");
    info!("API: {}", config.remote.api_base());
    info!("Batch size: {}", config.batch.max_operations);
    info!("Concurrent batches: {}", config.gate.max_concurrent_batches);
    info!(
        "Attempts: {} (backoff {}s..{}s)",
        config.retry.max_attempts,
        config.retry.initial_backoff.as_secs(),
        config.retry.max_backoff.as_secs()
    );
    info!("Write mode: {:?}", config.batch.mode);
    info!(
        "Distributed store: {}",
        if config.cache.redis_url.is_some() { "redis" } else { "in-process" }
    );
    info!("======================================");

    let Some(input) = args.input.as_deref() else {
        error!("No input file given");
        std::process::exit(2);
    };
    let request = read_request(input)?.with_mode(config.batch.mode);
    info!(
        groups = request.groups.len(),
        operations = request.operation_count(),
        "Loaded {}",
        input.display()
    );

    let runtime = SyncRuntime::connect(&config).await?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            ctrl_c.cancel();
        }
    });

    let report = runtime
        .processor()
        .process(request, runtime.routing(), &cancel)
        .await;
    runtime.shutdown();

    match report.and_then(|r| r.into_result()) {
        Ok(report) => {
            info!(
                batches = report.batches.len(),
                operations = report.succeeded_operations(),
                warmed = report.warmed,
                "Sync completed"
            );
            Ok(())
        }
        Err(e) => {
            error!(retryable = e.is_retryable(), "Sync failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Accept either a full request object or a bare array of operations
fn read_request(path: &Path) -> anyhow::Result<ProcessRequest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    if let Ok(request) = serde_json::from_str::<ProcessRequest>(&raw) {
        return Ok(request);
    }
    let operations: Vec<Operation> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {} as operations", path.display()))?;
    Ok(ProcessRequest::from_operations(operations))
}
