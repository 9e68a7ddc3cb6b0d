//! Search sync service entry point.

use std::process;

use search_sync::health;
use search_sync::{Dependencies, Settings, SyncError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolves on ctrl-c or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

async fn run(settings: Settings) -> Result<(), SyncError> {
    let deps = Dependencies::new(&settings).await?;
    let orchestrator = deps.orchestrator.clone();

    tokio::spawn(health::log_state_changes(
        orchestrator.subscribe_state(),
        orchestrator.config().degraded_threshold,
    ));

    let state = orchestrator.initialize().await?;
    info!(
        queue = state.is_connected_to_queue,
        search = state.is_connected_to_search_engine,
        "Orchestrator initialized"
    );

    if settings.run_migration_on_start {
        let migrator = orchestrator.clone();
        tokio::spawn(async move {
            match migrator.initial_data_migration().await {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    migrated = report.total_migrated,
                    failed = report.total_failed,
                    "Startup migration finished"
                ),
                Err(e) => warn!(error = %e, "Startup migration did not complete"),
            }
        });
    }

    orchestrator.start_tailing().await?;
    deps.queue_processor
        .start_processing(settings.queue_processor_interval)
        .await?;
    info!("Search sync running");

    shutdown_signal().await;

    // The orchestrator drains within `shutdown_timeout`; this only fires if
    // the drain itself hangs.
    let bound = settings.hard_exit_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(bound).await;
        error!(timeout_ms = bound.as_millis() as u64, "Graceful shutdown stalled, exiting");
        process::exit(1);
    });

    deps.queue_processor.stop_processing().await;
    orchestrator.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    init_tracing();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            process::exit(2);
        }
    };

    if let Err(e) = run(settings).await {
        error!(error = %e, "Search sync exited with error");
        process::exit(1);
    }

    info!("Search sync stopped");
}
