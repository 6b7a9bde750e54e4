use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use judge_core::checker::CheckerEngine;
use judge_core::config::EvalConfig;
use judge_core::protocol::serve_with_shutdown;
use judge_core::sandbox::{ensure_cgroups_available, IsolateFactory};
use judge_core::{BoxScheduler, LocalEvaluator};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("judge_core=info".parse()?),
        )
        .init();

    let config = EvalConfig::from_env()?;

    match std::env::args().nth(1).as_deref() {
        None | Some("serve") => serve(config).await,
        Some(other) => bail!("Unknown command {:?} (expected `serve`)", other),
    }
}

async fn serve(config: EvalConfig) -> Result<()> {
    info!("Starting evaluation worker...");

    let languages = Arc::new(config.load_languages()?);
    match &config.languages_config {
        Some(path) => info!("Loaded language configurations from {}", path.display()),
        None => info!("Using built-in language configurations"),
    }
    let testlib = config.load_testlib()?;

    ensure_cgroups_available().await?;
    info!("Cgroups available, memory limits use --cg-mem");

    let store = config.artifact_store();
    tokio::fs::create_dir_all(store.checker_cache_dir())
        .await
        .with_context(|| format!("Failed to create {}", store.checker_cache_dir().display()))?;

    let factory = IsolateFactory::new(true, config.kill_grace);
    let scheduler = BoxScheduler::new(config.scheduler.clone(), Arc::new(factory));
    info!(
        "Box scheduler: {} boxes starting at id {}",
        config.scheduler.num_boxes, config.scheduler.first_box_id
    );

    let checkers = CheckerEngine::new(
        scheduler.clone(),
        languages.clone(),
        store.clone(),
        testlib,
        config.checker.clone(),
    );
    let evaluator = LocalEvaluator::new(
        scheduler.clone(),
        languages,
        store,
        config.compile.clone(),
    )
    .with_run_processes(config.run_processes)
    .with_checker_lock(checkers.compile_lock().clone());

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    // SIGUSR1 purges the checker cache
    let mut purge_requests = signal(SignalKind::user_defined1())?;
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C, shutting down");
    };
    let server = serve_with_shutdown(listener, Arc::new(evaluator), shutdown);
    tokio::pin!(server);

    loop {
        tokio::select! {
            result = &mut server => {
                result?;
                break;
            }
            Some(()) = purge_requests.recv() => purge_checkers(&checkers).await,
        }
    }

    scheduler.shutdown();
    Ok(())
}

async fn purge_checkers(checkers: &CheckerEngine) {
    info!("Purging checker cache");
    match checkers.purge_cache().await {
        Ok(report) => {
            if !report.warnings.is_empty() {
                warn!("{} files could not be removed", report.warnings.len());
            }
            match serde_json::to_string(&report) {
                Ok(json) => info!("Purge report: {}", json),
                Err(e) => warn!("Couldn't serialize purge report: {}", e),
            }
        }
        Err(e) => error!("Checker cache purge failed: {}", e),
    }
}
