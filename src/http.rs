//! HTTP front end
//!
//! | Method  | Path   | Body                      | Success                |
//! |---------|--------|---------------------------|------------------------|
//! | GET     | /info  |                           | 200 JSON status report |
//! | POST    | /seed  | seed, single media type   | 204                    |
//! | POST    | /hash  | input, single media type  | 200 encoded hash       |
//! | POST    | /batch | inputs, batch media type  | 200 encoded hashes     |
//! | OPTIONS | /seed, /hash, /batch | preflight   | 204 or 403             |
//!
//! Error responses carry a status code and an empty body.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Bytes, HttpBody};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{
    ACCEPT, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, CONTENT_TYPE, ORIGIN, REFERER,
};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::codec::{self, CodecError, Encoding, Framing};
use crate::error::ServiceError;
use crate::service::{Service, ServiceState};

/// Request header carrying the fingerprint the caller expects
pub const FINGERPRINT_HEADER: &str = "UHash-Fingerprint";

const CORS_ALLOW_HEADERS: &str = "Accept, Content-Type, UHash-Fingerprint";
const CORS_MAX_AGE: &str = "120";

impl ServiceError {
    /// HTTP status reported for this error
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Codec(e) => match e {
                CodecError::MissingContentType | CodecError::UnsupportedContentType(_) => {
                    StatusCode::UNSUPPORTED_MEDIA_TYPE
                }
                CodecError::MalformedHex
                | CodecError::InvalidEntryLength(_)
                | CodecError::TruncatedEntry { .. }
                | CodecError::EmptyBatch => StatusCode::BAD_REQUEST,
                CodecError::BatchTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            },
            ServiceError::SeedTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::NotSeeded => StatusCode::FORBIDDEN,
            ServiceError::FingerprintMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::PoolClosed => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Context(_) | ServiceError::Spawn(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            debug!(error = %self, %status, "request rejected");
        }
        status.into_response()
    }
}

/// Build the router
pub fn create_router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/info", get(info))
        .route("/seed", post(seed).options(preflight))
        .route("/hash", post(hash).options(preflight))
        .route("/batch", post(batch).options(preflight))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&service),
            log_request,
        ))
        .with_state(service)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, service: Arc<Service>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(service);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn info(State(service): State<Arc<Service>>, headers: HeaderMap) -> Response {
    let cors = cors_headers(service.state(), &headers, "GET").unwrap_or_default();
    let report = service.status().await.map(Json);
    (cors, report).into_response()
}

async fn seed(State(service): State<Arc<Service>>, headers: HeaderMap, body: Bytes) -> Response {
    let cors = cors_headers(service.state(), &headers, "POST").unwrap_or_default();
    (cors, reseed(&service, &headers, &body).await).into_response()
}

async fn hash(State(service): State<Arc<Service>>, headers: HeaderMap, body: Bytes) -> Response {
    let cors = cors_headers(service.state(), &headers, "POST").unwrap_or_default();
    (cors, hash_one(&service, &headers, &body).await).into_response()
}

async fn batch(State(service): State<Arc<Service>>, headers: HeaderMap, body: Bytes) -> Response {
    let cors = cors_headers(service.state(), &headers, "POST").unwrap_or_default();
    (cors, hash_many(&service, &headers, &body).await).into_response()
}

async fn preflight(State(service): State<Arc<Service>>, headers: HeaderMap) -> Response {
    match cors_headers(service.state(), &headers, "POST") {
        Some(cors) => (StatusCode::NO_CONTENT, cors).into_response(),
        None => StatusCode::FORBIDDEN.into_response(),
    }
}

async fn reseed(
    service: &Service,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StatusCode, ServiceError> {
    let encoding = Encoding::from_content_type(content_type(headers), Framing::Single)?;
    let seed = codec::decode_single(encoding, body)?;
    service.reseed(seed).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn hash_one(
    service: &Service,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ServiceError> {
    service.state().ensure_initialized()?;
    let encoding = Encoding::from_content_type(content_type(headers), Framing::Single)?;
    let input = codec::decode_single(encoding, body)?;
    let expected = expected_fingerprint(headers);
    service.state().check_fingerprint(expected.as_deref())?;

    let hash = service.hash(input, expected).await?;

    let output = Encoding::negotiate(accept(headers), Framing::Single);
    Ok((
        [(CONTENT_TYPE, output.media_type(Framing::Single))],
        codec::encode_single(output, &hash),
    )
        .into_response())
}

async fn hash_many(
    service: &Service,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ServiceError> {
    service.state().ensure_initialized()?;
    let encoding = Encoding::from_content_type(content_type(headers), Framing::Batch)?;
    let inputs = codec::decode_batch(encoding, body)?;
    let expected = expected_fingerprint(headers);
    service.state().check_fingerprint(expected.as_deref())?;

    let hashes = service.batch(inputs, expected).await?;

    let output = Encoding::negotiate(accept(headers), Framing::Batch);
    Ok((
        [(CONTENT_TYPE, output.media_type(Framing::Batch))],
        codec::encode_batch(output, &hashes),
    )
        .into_response())
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
}

fn accept(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
}

fn expected_fingerprint(headers: &HeaderMap) -> Option<String> {
    headers
        .get(FINGERPRINT_HEADER)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).trim().to_string())
}

/// CORS response headers, `None` when the origin is not allowed
fn cors_headers(state: &ServiceState, headers: &HeaderMap, method: &'static str) -> Option<HeaderMap> {
    let origin = headers.get(ORIGIN)?;
    if !state.allows_origin(origin.to_str().ok()?) {
        return None;
    }

    let mut cors = HeaderMap::new();
    cors.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    cors.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(method));
    cors.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    cors.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(CORS_MAX_AGE));
    Some(cors)
}

/// Access log line per request when request logging is enabled
async fn log_request(State(service): State<Arc<Service>>, request: Request, next: Next) -> Response {
    if !service.state().log_requests() {
        return next.run(request).await;
    }

    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let referer = request
        .headers()
        .get(REFERER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let response = next.run(request).await;

    let length = response.body().size_hint().exact().unwrap_or(0);
    info!(
        "{} \"{} {}\" {} {} \"{}\"",
        remote,
        method,
        path,
        response.status().as_u16(),
        length,
        referer
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ServiceError::from(CodecError::MissingContentType), 415),
            (ServiceError::from(CodecError::MalformedHex), 400),
            (ServiceError::from(CodecError::InvalidEntryLength(200)), 400),
            (ServiceError::from(CodecError::EmptyBatch), 400),
            (ServiceError::from(CodecError::BatchTooLarge(300)), 413),
            (ServiceError::SeedTooLarge(61), 413),
            (ServiceError::NotSeeded, 403),
            (
                ServiceError::FingerprintMismatch {
                    expected: "a".into(),
                    active: "b".into(),
                },
                422,
            ),
            (ServiceError::PoolClosed, 503),
        ];

        for (error, status) in cases {
            assert_eq!(error.status().as_u16(), status, "{}", error);
        }
    }

    #[test]
    fn test_cors_requires_configured_origin() {
        let state = ServiceState::new(1, crate::context::Flags::NONE, None, false);
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, HeaderValue::from_static("https://miner.example"));
        assert!(cors_headers(&state, &headers, "POST").is_none());

        state.set_origin(Some("https://miner.example".to_string()));
        let cors = cors_headers(&state, &headers, "POST").unwrap();
        assert_eq!(cors[ACCESS_CONTROL_ALLOW_ORIGIN], "https://miner.example");
        assert_eq!(cors[ACCESS_CONTROL_ALLOW_METHODS], "POST");
        assert_eq!(cors[ACCESS_CONTROL_MAX_AGE], "120");

        assert!(cors_headers(&state, &HeaderMap::new(), "POST").is_none());
    }
}
