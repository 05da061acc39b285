//! Long-running process commands: orchestrate, executor, evaluator.
//!
//! Each installs a ctrl-c handler that cancels the shared token; the
//! runtimes drain in-flight work before returning.

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use graft_core::config::CoreConfig;
use graft_core::evaluator::{Evaluator, EvaluatorConfig};
use graft_core::executor::{Executor, ExecutorConfig};
use graft_core::handler::HandlerRegistry;
use graft_core::oracle::Planner;
use graft_core::orchestrator::{Orchestrator, OrchestratorConfig};
use graft_fabric::Fabric;

/// Cancellation token wired to ctrl-c (SIGINT) and, on Unix, SIGTERM.
pub fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        trigger.cancel();
    });
    cancel
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Run the orchestrator (dispatch + supervision loops) until interrupted.
pub async fn run_orchestrate(
    pool: PgPool,
    fabric: Arc<dyn Fabric>,
    planner: Arc<dyn Planner>,
    core: &CoreConfig,
    evaluator_config: EvaluatorConfig,
) -> Result<()> {
    let orchestrator = Orchestrator::new(
        pool,
        fabric,
        planner,
        OrchestratorConfig::from_core(core),
        evaluator_config,
    );
    orchestrator.run(shutdown_token()).await
}

/// Run an executor with the built-in handler registry until interrupted.
pub async fn run_executor(
    pool: PgPool,
    fabric: Arc<dyn Fabric>,
    registry: Arc<HandlerRegistry>,
    config: ExecutorConfig,
) -> Result<()> {
    let executor = Executor::new(pool, fabric, registry, config);
    executor.run(shutdown_token()).await
}

/// Run an evaluator until interrupted.
pub async fn run_evaluator(
    pool: PgPool,
    fabric: Arc<dyn Fabric>,
    config: EvaluatorConfig,
) -> Result<()> {
    let evaluator = Evaluator::new(pool, fabric, config);
    evaluator.run(shutdown_token()).await
}
