//! pulsed
//!
//! Receives platform signals over HTTP, distributes them as events to the
//! billing and lifecycle watchers, and escalates unpaid resources through
//! the skew ladder.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use pulse_billing::{api, config, service::BillingService, state::AppState};
use pulse_events::EventManager;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to PULSE_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting pulsed");
    info!(
        listen_addr = %config.listen_addr,
        dev_mode = config.dev_mode,
        piggybanks = ?config.piggybanks,
        "Configuration loaded"
    );

    let service = match BillingService::from_config(&config) {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, "Failed to build billing service");
            return Err(e);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let manager = Arc::new(EventManager::new(config.events.clone()));
    let watcher_handles = service.start(Arc::clone(&manager), shutdown_rx.clone()).await?;

    let state = AppState::new(
        Arc::clone(&manager),
        service.provider_names(),
        service.notifier_names(),
    );
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for signals");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for watchers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);
    for handle in watcher_handles {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Watcher did not shut down in time");
        }
    }

    info!("pulsed shutdown complete");
    Ok(())
}
