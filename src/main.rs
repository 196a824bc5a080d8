//! Product ledger HTTP entrypoint.
//!
//! This binary launches an Axum-based HTTP server that exposes a product
//! catalog stored in an EVM smart contract, plus a websocket relay that lets
//! clients notify each other of catalog changes.
//!
//! Endpoints:
//! - `GET /health` – Ledger connection status
//! - `POST /auth/login` – Verify a signature token
//! - `GET|POST /productos` – List or create products
//! - `GET|PUT|DELETE /productos/{id}` – Read, update or delete a product
//! - `POST /productos/eliminar` – Delete several products
//! - `POST /productos/consultar-gas` – Estimate the gas of an operation
//! - `GET /socket` – Change notification relay
//! - `GET /uploads/*` – Stored product images, when `images.public_url` is a path
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `APP_ENV`, `PROVIDER`, `PROJECT_ID`, `CONTRACT_ADDRESS`, `PRIVATE_KEY`
//!   select the ledger deployment
//! - `ESTIMATE_GAS`, `GAS_PRICE` set the gas defaults
//! - `HOST`, `PORT` control binding address

use axum::Router;
use axum::http::{HeaderName, Method};
use dotenvy::dotenv;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors;
use tower_http::services::ServeDir;

use product_ledger::auth::TOKEN_HEADER;
use product_ledger::catalog::Catalog;
use product_ledger::chain::evm::WsConnector;
use product_ledger::config::AppConfig;
use product_ledger::connection::ConnectionManager;
use product_ledger::encoder::CallEncoder;
use product_ledger::from_env::{self, GasDefaults};
use product_ledger::handlers::{self, AppState};
use product_ledger::images::DiskImageStore;
use product_ledger::network::Deployment;
use product_ledger::sig_down::SigDown;
use product_ledger::socket::Relay;
use product_ledger::telemetry::Telemetry;

/// Initializes the product ledger server.
///
/// - Loads `.env` variables.
/// - Initializes tracing.
/// - Resolves the contract deployment and starts the ledger connection.
/// - Starts an Axum HTTP server with the catalog handlers.
///
/// Binds to the address specified by the `HOST` and `PORT` env vars.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env variables
    dotenv().ok();

    let telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    // Load configuration
    let app_config = match AppConfig::from_env() {
        Ok(config) => {
            tracing::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            tracing::info!("Using default configuration");
            AppConfig::default()
        }
    };

    let deployment = Deployment::from_env();
    // Abort if the deployment is incomplete
    let resolved = deployment
        .endpoint(&app_config.ledger)
        .and_then(|endpoint| {
            let contract = deployment.resolve_contract(&app_config.ledger)?;
            let identity = from_env::signing_identity(deployment)?;
            let gas = GasDefaults::from_env()?;
            Ok((endpoint, contract, identity, gas))
        });
    let (endpoint, contract, identity, gas) = match resolved {
        Ok(resolved) => resolved,
        Err(e) => {
            tracing::error!("Failed to resolve the {} deployment: {}", deployment, e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        %deployment,
        endpoint = %endpoint,
        contract = %contract.address,
        gas_limit = gas.gas_limit,
        gas_price_gwei = gas.gas_price_gwei,
        "Ledger deployment resolved"
    );

    let manager = ConnectionManager::new(
        WsConnector::new(endpoint, contract.clone()),
        identity,
        app_config.ledger.reconnect_interval(),
    );
    manager.start();

    let catalog = Catalog::new(
        manager.binding_slot(),
        CallEncoder::new(Arc::clone(&contract.descriptor)),
        gas.gas_limit,
    );
    let axum_state = Arc::new(AppState {
        catalog,
        images: Arc::new(DiskImageStore::new(
            &app_config.images.dir,
            &app_config.images.public_url,
        )),
        relay: Arc::new(Relay::default()),
        limits: app_config.catalog.clone(),
        gas,
        connection: manager.subscribe(),
    });

    // Configure CORS
    let methods = [Method::GET, Method::POST, Method::PUT, Method::DELETE];
    let exposed = [HeaderName::from_static(TOKEN_HEADER)];
    let cors_layer = if app_config.cors.allowed_origins.is_empty() {
        tracing::info!("CORS: Allowing all origins (*)");
        cors::CorsLayer::new()
            .allow_origin(cors::Any)
            .allow_methods(methods)
            .allow_headers(cors::Any)
            .expose_headers(exposed)
    } else {
        tracing::info!("CORS: Restricting to {:?}", app_config.cors.allowed_origins);
        let origins: Vec<_> = app_config
            .cors
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        cors::CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(cors::Any)
            .expose_headers(exposed)
    };

    let mut http_endpoints = Router::new().merge(handlers::routes(axum_state));
    let images_path = app_config.images.public_url.trim_end_matches('/');
    if images_path.starts_with('/') && images_path.len() > 1 {
        tracing::info!("Serving images from {:?} at {}", app_config.images.dir, images_path);
        http_endpoints =
            http_endpoints.nest_service(images_path, ServeDir::new(&app_config.images.dir));
    }
    if let Some(static_dir) = &app_config.server.static_dir {
        tracing::info!("Serving static files from {:?}", static_dir);
        http_endpoints = http_endpoints.fallback_service(ServeDir::new(static_dir));
    }
    let http_endpoints = http_endpoints
        .layer(tower_http::limit::RequestBodyLimitLayer::new(
            app_config.request.max_body_size_bytes,
        ))
        .layer(CompressionLayer::new())
        .layer(telemetry.http_tracing())
        .layer(cors_layer);

    let addr = match from_env::listen_addr() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("Invalid listen address: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    let sig_down = SigDown::try_new()?;
    let axum_cancellation_token = sig_down.cancellation_token();
    let axum_graceful_shutdown = async move { axum_cancellation_token.cancelled().await };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(axum_graceful_shutdown)
        .await?;

    tracing::info!("Closing ledger connection");
    manager.shutdown().await;

    Ok(())
}
