use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::DeployHookConfig;
use crate::deploy::{self, DeployLog, DeployQueue};
use crate::request_logging;

mod api_types;
pub mod branch_gate;
mod handlers;
pub mod payload;
pub mod signature;


pub use branch_gate::{AllowedBranchSet, BranchGate, GateDecision};
pub use signature::{SignatureStatus, SignatureVerifier};

pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct WebhookState {
    pub verifier: SignatureVerifier,
    pub gate: Arc<BranchGate>,
    pub queue: DeployQueue,
    pub log: DeployLog,
}

#[must_use]
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook", post(handlers::receive_webhook))
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(request_logging::log_webhook_request))
        .with_state(state)
}

/// Serves the listener until SIGINT or SIGTERM, then waits for the in-flight deploy.
///
/// # Errors
/// Returns an error if the configuration is incomplete, the collaborators cannot be built,
/// or the listen address cannot be bound.
pub async fn run(config: &DeployHookConfig) -> Result<()> {
    let secret = config
        .webhook_secret()
        .context("webhook_secret is not configured")?;
    let verifier = SignatureVerifier::new(&secret)?;
    let gate = BranchGate::new(AllowedBranchSet::new(config.allowed_branches()));

    let runner = Arc::new(deploy::build_runner(config)?);
    let log = runner.log().clone();
    let (queue, worker) = DeployQueue::spawn(runner);

    let allowed = gate.allowed().iter().collect::<Vec<_>>().join(",");
    let app = router(WebhookState {
        verifier,
        gate: Arc::new(gate),
        queue: queue.clone(),
        log,
    });

    let bind_address = config.bind_address();
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;

    info!(%bind_address, %allowed, "webhook listener started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("webhook listener failed")?;

    info!("listener stopped; waiting for the in-flight deploy to finish");
    queue.shutdown().await;
    if let Err(join_error) = worker.await {
        error!(error = %join_error, "deploy worker ended abnormally");
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
                    _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
                }
            }
            Err(signal_error) => {
                error!(error = %signal_error, "cannot listen for SIGTERM; only Ctrl+C stops the listener");
                wait_for_ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl+C received, shutting down"),
        Err(signal_error) => {
            error!(error = %signal_error, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}
