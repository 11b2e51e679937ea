use axum::extract::Query;
use axum::http::{StatusCode, Uri};
use axum::{body::Body, http::Request, middleware::Next, response::Response};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{error, warn};

#[derive(Deserialize)]
struct ResourceQuery {
    resource_id: Option<String>,
}

/// The `resource_id` of a stream link, if the query carries one. The rest of
/// the query is never logged.
fn resource_of(uri: &Uri) -> Option<String> {
    Query::<ResourceQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(query)| query.resource_id)
        .filter(|id| !id.is_empty())
}

/// Logs failed requests by path and resource. Busy rejections are logged at
/// warn.
pub async fn log_request_errors(req: Request<Body>, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let resource_id = resource_of(req.uri());
    let method = req.method().clone();
    let started = Instant::now();

    let response = next.run(req).await;
    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let resource_id = resource_id.as_deref().unwrap_or("-");

    if status == StatusCode::SERVICE_UNAVAILABLE {
        warn!(
            method = %method,
            path = %path,
            resource_id,
            elapsed_ms,
            "Request rejected, server busy"
        );
    } else if status.is_client_error() {
        warn!(
            method = %method,
            path = %path,
            resource_id,
            status = %status,
            elapsed_ms,
            "Client error"
        );
    } else if status.is_server_error() {
        error!(
            method = %method,
            path = %path,
            resource_id,
            status = %status,
            elapsed_ms,
            "Server error"
        );
    }

    response
}
