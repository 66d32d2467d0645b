//! Payment router HTTP entrypoint.
//!
//! Launches the Axum server exposing the metered-call surface
//! (`POST /v1/router/{agentId}`) and the permit admin surface (`/permits`).
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control the binding address
//! - `ADMIN_PKEY` / `ADMIN_ADDRESS` configure the admin signer
//! - `RPC_URL_{chainId}` per supported chain
//! - `ATTESTATION_API_URL`, `STORE_PATH`, and timeout overrides per
//!   [`permit_router::config`]

use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tower_http::cors;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use permit_router::attestation::AttestationClient;
use permit_router::chain::ChainClients;
use permit_router::config::Config;
use permit_router::handlers;
use permit_router::network::ChainRegistry;
use permit_router::router::PaymentRouter;
use permit_router::store::{MemoryStore, Store};
use permit_router::submitter::PermitSubmitter;
use permit_router::transfer::TransferEngine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(format!("info,{}=debug", env!("CARGO_CRATE_NAME")))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let registry = Arc::new(
        ChainRegistry::new(config.rpc_urls.clone())
            .with_token_overrides(config.token_overrides.clone()),
    );
    let signer = config.admin_key.signer()?;
    let clients = Arc::new(ChainClients::connect(
        &registry,
        &signer,
        config.receipt_timeout,
    )?);

    let store: Arc<dyn Store> = match &config.store_path {
        Some(path) => Arc::new(MemoryStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };

    let attestation = AttestationClient::new(
        config.attestation_api_url.clone(),
        config.attestation_timeout,
    )?;
    let engine = TransferEngine::new(
        Arc::clone(&clients),
        Arc::clone(&registry),
        Arc::clone(&store),
        attestation,
    );
    let submitter = PermitSubmitter::new(Arc::clone(&clients), Arc::clone(&registry));

    let shutdown = CancellationToken::new();
    let router = PaymentRouter::new(
        store,
        registry,
        clients,
        engine,
        submitter,
        config.admin_address,
        config.publisher_timeout,
        shutdown.clone(),
    )?;

    let http_endpoints = handlers::routes(Arc::new(router))
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!(admin = %config.admin_address, "starting server at http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    spawn_signal_handler(shutdown.clone())?;
    let graceful = shutdown.clone();
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await?;

    Ok(())
}

/// Cancel the token on SIGTERM or SIGINT. In-flight attestation polls observe
/// the cancellation and exit cleanly, leaving their payment records pending.
fn spawn_signal_handler(token: CancellationToken) -> Result<(), std::io::Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
        tracing::info!("shutdown signal received");
        token.cancel();
    });
    Ok(())
}
