use crate::api::error::GatewayError;
use crate::api::token_bucket::TokenBucket;
use crate::range::{ByteWindow, resolve_window};
use crate::reassembly::{ChunkStream, StreamError};
use crate::token::{IssuedLink, fingerprint};
use crate::AppState;
use axum::body::Body;
use axum::extract::{Extension, Query};
use axum::http::{HeaderMap, Response, StatusCode, header};
use axum::response::Json;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use mime_guess::from_path;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// RFC 5987 `filename*` value: unreserved punctuation stays literal.
const FILENAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

/// Query of a stream link. Every field is optional so that a mangled link is
/// answered as an invalid link rather than a malformed request.
#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    pub resource_id: Option<String>,
    pub size: Option<String>,
    pub token: Option<String>,
    pub exp: Option<String>,
    /// Display file name, unsigned
    pub name: Option<String>,
    /// `1` asks for an attachment disposition
    pub download: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateLinkRequest {
    pub resource_id: String,
    /// Looked up from the upstream when omitted
    pub size: Option<u64>,
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub active_streams: usize,
    pub max_concurrent_streams: usize,
}

/// Serve a byte window of a resource behind a signed link.
pub async fn stream_resource(
    Extension(state): Extension<AppState>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Result<Response<Body>, GatewayError> {
    let (resource_id, size) = verify_link(&state, &params)?;

    let range = headers.get(header::RANGE).and_then(|value| value.to_str().ok());
    let window = resolve_window(range, size).inspect_err(|_| {
        debug!(%resource_id, size, ?range, "Range not satisfiable");
    })?;

    let slot = state.admission.try_acquire().inspect_err(|busy| {
        warn!(%resource_id, capacity = busy.capacity, "Stream rejected, all slots in use");
    })?;
    debug!(
        %resource_id,
        start = window.start,
        end = window.end,
        active = state.admission.active(),
        "Stream admitted"
    );

    let chunks = state.reassembler.stream(resource_id.clone(), window, slot);
    let bucket = TokenBucket::new(state.token_rate);
    let log = DeliveryLog::new(resource_id, window);
    let body = Body::from_stream(delivery_stream(chunks, bucket, log));

    let name = params.name.as_deref().filter(|name| !name.is_empty());
    let attachment = params.download.as_deref() == Some("1");

    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_RANGE, window.content_range(size))
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, window.len())
        .header(header::CONTENT_TYPE, content_type_for(name, &state.content_type))
        .header(header::CACHE_CONTROL, "private, max-age=0")
        .header(header::CONTENT_DISPOSITION, content_disposition(name, attachment))
        .body(body)
        .map_err(|error| GatewayError::Internal(error.to_string()))
}

/// Mint a stream link for a resource.
pub async fn create_link(
    Extension(state): Extension<AppState>,
    Json(request): Json<CreateLinkRequest>,
) -> Result<Json<IssuedLink>, GatewayError> {
    if request.resource_id.is_empty() {
        warn!("resource_id is empty");
        return Err(GatewayError::BadRequest("resource_id is required".into()));
    }

    let size = match request.size {
        Some(size) => size,
        None => state
            .fetcher
            .content_length(&request.resource_id)
            .await?
            .ok_or_else(|| {
                GatewayError::NotFound(format!("Unknown size for {}", request.resource_id))
            })?,
    };

    let link = state
        .issuer
        .issue_named_link(&request.resource_id, size, request.name.as_deref());
    info!(
        resource_id = %request.resource_id,
        size,
        expires_at = link.expires_at,
        token = %fingerprint(&link.token),
        "Link issued"
    );
    Ok(Json(link))
}

pub async fn status(Extension(state): Extension<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        active_streams: state.admission.active(),
        max_concurrent_streams: state.admission.capacity(),
    })
}

fn verify_link(state: &AppState, params: &StreamParams) -> Result<(String, u64), GatewayError> {
    let (Some(resource_id), Some(size), Some(token), Some(exp)) = (
        params.resource_id.as_deref(),
        params.size.as_deref(),
        params.token.as_deref(),
        params.exp.as_deref(),
    ) else {
        warn!("Stream link is missing fields");
        return Err(GatewayError::InvalidToken);
    };

    let (Ok(size), Ok(expiry)) = (size.parse::<u64>(), exp.parse::<u64>()) else {
        warn!(resource_id, "Stream link has non-numeric size or expiry");
        return Err(GatewayError::InvalidToken);
    };

    state
        .issuer
        .codec()
        .check(resource_id, size, expiry, token)
        .map_err(|error| {
            warn!(
                resource_id,
                token = %fingerprint(token),
                %error,
                "Stream link rejected"
            );
            GatewayError::InvalidToken
        })?;

    Ok((resource_id.to_string(), size))
}

fn content_type_for(name: Option<&str>, fallback: &str) -> String {
    name.and_then(|name| from_path(name).first())
        .map(|mime| mime.to_string())
        .unwrap_or_else(|| fallback.to_string())
}

fn content_disposition(name: Option<&str>, attachment: bool) -> String {
    let kind = if attachment { "attachment" } else { "inline" };
    match name {
        Some(name) => format!(
            "{kind}; filename*=UTF-8''{}",
            utf8_percent_encode(name, FILENAME)
        ),
        None => kind.to_string(),
    }
}

/// Outcome bookkeeping for one response body.
///
/// The body is usually dropped right after its last byte is written, without
/// being polled to the end, so completion is decided on drop.
struct DeliveryLog {
    resource_id: String,
    window: ByteWindow,
    delivered: u64,
    settled: bool,
}

impl DeliveryLog {
    fn new(resource_id: String, window: ByteWindow) -> Self {
        Self {
            resource_id,
            window,
            delivered: 0,
            settled: false,
        }
    }

    fn fail(&mut self, error: &StreamError) {
        self.settled = true;
        match error {
            StreamError::UpstreamExhausted { .. } => warn!(
                resource_id = %self.resource_id,
                start = self.window.start,
                end = self.window.end,
                %error,
                "Stream ended short"
            ),
            _ => error!(
                resource_id = %self.resource_id,
                start = self.window.start,
                end = self.window.end,
                delivered = self.delivered,
                %error,
                "Stream aborted by upstream failure"
            ),
        }
    }
}

impl Drop for DeliveryLog {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.delivered == self.window.len() {
            info!(
                resource_id = %self.resource_id,
                start = self.window.start,
                end = self.window.end,
                bytes = self.delivered,
                "Stream completed"
            );
        } else {
            info!(
                resource_id = %self.resource_id,
                delivered = self.delivered,
                expected = self.window.len(),
                "Stream aborted by client"
            );
        }
    }
}

/// Throttles the engine's chunks and records how the body ended. An engine
/// error is passed through so the connection is cut short.
fn delivery_stream(
    mut chunks: ChunkStream,
    bucket: TokenBucket,
    mut log: DeliveryLog,
) -> impl Stream<Item = Result<Bytes, StreamError>> + Send {
    async_stream::stream! {
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    bucket.consume(chunk.len()).await;
                    log.delivered += chunk.len() as u64;
                    yield Ok(chunk);
                }
                Err(error) => {
                    log.fail(&error);
                    yield Err(error);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::fetcher::MemoryFetcher;
    use crate::reassembly::{ChunkReassembler, FetchSettings};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_content_type_from_name() {
        assert_eq!(content_type_for(Some("clip.webm"), "video/mp4"), "video/webm");
        assert_eq!(content_type_for(Some("notes.pdf"), "video/mp4"), "application/pdf");
        assert_eq!(content_type_for(Some("no-extension"), "video/mp4"), "video/mp4");
        assert_eq!(content_type_for(None, "audio/mpeg"), "audio/mpeg");
    }

    #[test]
    fn test_content_disposition() {
        assert_eq!(content_disposition(None, false), "inline");
        assert_eq!(content_disposition(None, true), "attachment");
        assert_eq!(
            content_disposition(Some("My Movie.mkv"), true),
            "attachment; filename*=UTF-8''My%20Movie.mkv"
        );
        assert_eq!(
            content_disposition(Some("été_v2~final-cut.mp4"), false),
            "inline; filename*=UTF-8''%C3%A9t%C3%A9_v2~final-cut.mp4"
        );
    }

    fn throttled_body(
        size: usize,
        bytes_per_sec: f64,
        admission: &AdmissionController,
    ) -> impl Stream<Item = Result<Bytes, StreamError>> + Send {
        let fetcher = MemoryFetcher::new(1).with_object("obj", vec![7u8; size]);
        let settings = FetchSettings {
            alignment: 1,
            block_size: size,
            fetch_timeout: Duration::from_secs(5),
            fetch_retries: 0,
        };
        let window = ByteWindow {
            start: 0,
            end: size as u64 - 1,
        };
        let slot = admission.try_acquire().unwrap();
        let chunks = ChunkReassembler::new(Arc::new(fetcher), settings).stream("obj".into(), window, slot);
        delivery_stream(
            chunks,
            TokenBucket::new(bytes_per_sec),
            DeliveryLog::new("obj".into(), window),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_held_while_final_chunk_is_throttled() {
        let admission = AdmissionController::new(1);
        let mut body = Box::pin(throttled_body(3000, 1000.0, &admission));

        // One second of burst, then two seconds of refill for a 3000 byte chunk
        let early = timeout(Duration::from_millis(500), body.next()).await;
        assert!(early.is_err());
        assert_eq!(admission.active(), 1);
        assert!(admission.try_acquire().is_err());

        let chunk = body.next().await.unwrap().unwrap();
        assert_eq!(chunk.len(), 3000);
        assert_eq!(admission.active(), 1);

        // Dropped once the last byte is written, as the server does
        drop(body);
        assert_eq!(admission.active(), 0);
    }

    #[tokio::test]
    async fn test_body_polled_to_end_releases_slot() {
        let admission = AdmissionController::new(1);
        let mut body = Box::pin(throttled_body(100, 0.0, &admission));

        assert_eq!(body.next().await.unwrap().unwrap().len(), 100);
        assert!(body.next().await.is_none());
        assert_eq!(admission.active(), 0);
    }
}
