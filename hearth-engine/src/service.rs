//! Process wiring: bind, load the model, serve until shutdown.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hearth_resilience::HealthMonitor;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState};
use crate::config::ServiceConfig;
use crate::error::EngineError;
use crate::gate::RequestGate;
use crate::models::ModelHandle;

/// Run the service until SIGINT/SIGTERM, or until the model fails to load
/// and the configuration says not to stay up.
///
/// The listener is bound before the model loads so the health endpoint
/// reports `loading` for the whole load.
pub async fn run(config: ServiceConfig) -> Result<()> {
    let health = Arc::new(HealthMonitor::new(config.health));
    let state = AppState::new(
        Arc::clone(&health),
        config.model.name.clone(),
        config.default_generation.clone(),
    );
    let shutdown = CancellationToken::new();

    let address = config.bind_address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    tracing::info!(address = %address, "hearth-engine listening");

    let loader = tokio::spawn(load_and_install(
        config.clone(),
        state.clone(),
        shutdown.clone(),
    ));

    let drain = {
        let token = shutdown.clone();
        let state = state.clone();
        async move {
            shutdown_signal(token).await;
            // Queued requests fail now; the running call is left to finish.
            if let Some(gate) = state.gate() {
                gate.shutdown();
            }
        }
    };
    let mut server = tokio::spawn(
        axum::serve(listener, api::router(state.clone()))
            .with_graceful_shutdown(drain)
            .into_future(),
    );

    let grace = config.shutdown_grace;
    let served = tokio::select! {
        joined = &mut server => joined.context("server task failed")?,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!(grace_secs = grace.as_secs(), "Shutdown grace elapsed; dropping open connections");
            server.abort();
            Ok(())
        }
    };
    shutdown.cancel();

    if let Some(gate) = state.gate() {
        gate.shutdown();
    }

    let loaded = if loader.is_finished() {
        loader.await.context("model loader task failed")?
    } else {
        tracing::info!("Shutdown requested while the model was still loading");
        loader.abort();
        Ok(())
    };

    served.context("server error")?;
    loaded?;
    tracing::info!("hearth-engine stopped");
    Ok(())
}

/// Load the model off the async runtime and, on success, open the gate.
async fn load_and_install(
    config: ServiceConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    let spec = config.model.clone();
    tracing::info!(model = %spec.name, path = %spec.path.display(), "Loading model");

    let gate = tokio::task::spawn_blocking(move || ModelHandle::load(&spec))
        .await
        .unwrap_or_else(|e| Err(EngineError::Load(format!("loader panicked: {e}"))))
        .and_then(|handle| RequestGate::start(handle, Arc::clone(state.health()), config.gate.clone()));

    let gate = match gate {
        Ok(gate) => Arc::new(gate),
        Err(e) => {
            state.health().mark_load_failed(e.to_string());
            if config.stay_up_on_load_failure {
                tracing::error!(error = %e, "Model load failed; serving unhealthy status");
                return Ok(());
            }
            tracing::error!(error = %e, "Model load failed; shutting down");
            shutdown.cancel();
            return Err(e).context("model load failed");
        }
    };

    state.install_gate(Arc::clone(&gate));
    state.health().mark_ready();
    tracing::info!(
        queue_capacity = config.gate.queue_capacity,
        default_timeout_secs = config.gate.default_timeout.as_secs(),
        "Ready to serve requests"
    );

    tokio::spawn(evaluate_load_periodically(
        gate,
        config.overload_eval_interval,
        shutdown,
    ));
    Ok(())
}

/// Re-evaluate the rejection window on a timer so `Overloaded` recovers once
/// traffic stops arriving.
pub async fn evaluate_load_periodically(
    gate: Arc<RequestGate>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let state = gate.evaluate_load();
                tracing::trace!(%state, "Load re-evaluated");
            }
        }
    }
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Interrupt received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
        _ = token.cancelled() => {}
    }
    token.cancel();
}
