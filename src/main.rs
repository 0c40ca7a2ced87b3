use std::process::ExitCode;

use anyhow::Result;
use axum::Router;
use tracing::{error, info, warn};

use gridpilot::api;
use gridpilot::config::AppConfig;
use gridpilot::coordinator::{self, AppState, FatalRuntime};
use gridpilot::telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let cfg = match AppConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "configuration unreadable");
            return ExitCode::from(1);
        }
    };

    let state = match AppState::new(cfg.clone()).await {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "fatal init failure");
            return ExitCode::from(1);
        }
    };

    match run(state, cfg).await {
        Ok(()) => {
            warn!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            if e.downcast_ref::<FatalRuntime>().is_some() {
                error!(error = %e, "fatal runtime failure");
                ExitCode::from(2)
            } else {
                error!(error = %e, "unexpected exit");
                ExitCode::from(1)
            }
        }
    }
}

async fn run(state: AppState, cfg: AppConfig) -> Result<()> {
    let app: Router = api::router(state.clone());

    let addr = cfg.server.socket_addr()?;
    info!(%addr, "starting gridpilot");

    let runtime = coordinator::spawn_coordinator_tasks(state.clone());

    // The server stops on SIGTERM/SIGINT or when the coordinator dies of a
    // fatal runtime condition, so the exit code can surface either way.
    let coordinator_down = state.coordinator.cancelled();
    let shutdown = async move {
        tokio::select! {
            _ = telemetry::shutdown_signal() => {}
            _ = coordinator_down => {}
        }
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    // The HTTP server is down; stop the control loop and flush sessions.
    state.coordinator.shutdown().await;
    runtime.join().await
}
