pub mod admission;
pub mod api;
pub mod app_state;
pub mod config;
pub mod fetcher;
pub mod range;
pub mod reassembly;
pub mod token;

use anyhow::Context;
use axum::Router;
use axum::body::Body;
use axum::extract::Extension;
use axum::http::Request;
use axum::routing::{get, post};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span};

//
// Re-export
//
pub use admission::{AdmissionController, AdmissionSlot, ServerBusy};
pub use api::{GatewayError, TokenBucket, create_link, log_request_errors, status, stream_resource};
pub use app_state::AppState;
pub use config::Config;
pub use fetcher::{FetchError, MemoryFetcher, OpendalFetcher, ResourceFetcher};
pub use range::{ByteWindow, RangeError, resolve_window};
pub use reassembly::{ChunkReassembler, ChunkStream, FetchSettings, StreamError};
pub use token::{CapabilityToken, IssuedLink, LinkIssuer, SignatureScope, TokenCodec, TokenError};

/// Serve both APIs over `fetcher` until one of the listeners fails.
pub async fn serve(config: Config, fetcher: Arc<dyn ResourceFetcher>) -> anyhow::Result<()> {
    let state = AppState::new(&config, fetcher)?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    // Spans carry the path only; the query holds the link token
    let trace = TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
        info_span!("request", method = %req.method(), path = %req.uri().path())
    });

    // External routes (token-protected)
    let external_app = Router::new()
        .route("/stream", get(stream_resource))
        .layer(axum::middleware::from_fn(log_request_errors))
        .layer(trace.clone())
        .layer(cors.clone())
        .layer(Extension(state.clone()));

    // Internal routes (never exposed to clients)
    let internal_app = Router::new()
        .route("/links", post(create_link))
        .route("/status", get(status))
        .layer(axum::middleware::from_fn(log_request_errors))
        .layer(trace)
        .layer(cors)
        .layer(Extension(state));

    let external_addr = format!("0.0.0.0:{}", config.listen_on_port);
    let external_listener = TcpListener::bind(&external_addr)
        .await
        .with_context(|| format!("Failed to bind external API on {external_addr}"))?;
    info!("External API listening on {external_addr}");

    let internal_addr = format!("0.0.0.0:{}", config.internal_port);
    let internal_listener = TcpListener::bind(&internal_addr)
        .await
        .with_context(|| format!("Failed to bind internal API on {internal_addr}"))?;
    info!("Internal API listening on {internal_addr}");

    tokio::select! {
        result = axum::serve(external_listener, external_app) => {
            result.context("External API server error")?;
        }
        result = axum::serve(internal_listener, internal_app) => {
            result.context("Internal API server error")?;
        }
    }
    Ok(())
}

/// Serve both APIs over the configured storage backend.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let fetcher = OpendalFetcher::from_config(&config)?;
    serve(config, Arc::new(fetcher)).await
}
