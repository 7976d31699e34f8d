//! The HTTP broker pipeline
//!
//! One endpoint: `POST /` with an identity mapping body. A request walks
//! Received -> Correlated -> Decoded -> SourceValid -> Authorized -> Minted ->
//! Responded; every terminal state echoes the correlation token in
//! `x-request-id`, reusing the caller's header when present. The success body
//! is the minted credential bag as a bare JSON object, no envelope.
//!
//! The body is decoded by hand (rather than through the `Json` extractor) so
//! that even a 400 carries the correlation header.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::identity::IdentityMapping;
use crate::policy::MappingStore;
use crate::provider::ProviderRegistry;

/// Correlation header name, on requests and responses alike
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared state for the broker pipeline
#[derive(Clone)]
pub struct AppState {
    /// Current policy snapshot view
    pub mappings: Arc<MappingStore>,
    /// Provider capability dispatch table
    pub providers: Arc<ProviderRegistry>,
}

/// Build the broker router
pub fn router(state: AppState) -> Router {
    Router::new().route("/", post(broker_handler)).with_state(state)
}

/// Reuse the caller's correlation token, or make a fresh one
fn correlation_token(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Attach the correlation header to any response
fn correlated(response: impl IntoResponse, request_id: &str) -> Response {
    let mut response = response.into_response();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn broker_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = correlation_token(&headers);

    // Decoded
    let mut request: IdentityMapping = match serde_json::from_slice(&body) {
        Ok(mapping) => mapping,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "request body did not decode");
            return correlated(Error::malformed(e.to_string()), &request_id);
        }
    };
    request.correlate(&request_id);

    info!(
        request_id = %request_id,
        source_provider = %request.source.provider,
        source = %request.source.id,
        target_provider = %request.target.provider,
        target = %request.target.id,
        "identity request received"
    );

    // SourceValid
    if !state.providers.verify(&request.source).await {
        warn!(request_id = %request_id, stage = "verify", "source identity rejected");
        return correlated(Error::Unverified, &request_id);
    }

    // Authorized
    let Some(grant) = state.mappings.find(&request) else {
        warn!(request_id = %request_id, stage = "authorize", "no mapping permits the assumption");
        return correlated(Error::Unauthorized, &request_id);
    };

    // The stored grant is the authoritative target descriptor; the caller's
    // just-verified source credentials are preserved alongside it.
    let mut target = grant.target.clone();
    target.request_id = request_id.clone();

    // Minted
    let credentials = match state.providers.mint(&target).await {
        Ok(bag) => bag,
        Err(e) => {
            warn!(request_id = %request_id, stage = "mint", error = %e, "minting target credentials failed");
            return correlated(e, &request_id);
        }
    };

    // Responded
    let body = match serde_json::to_vec(&credentials) {
        Ok(body) => body,
        Err(e) => {
            warn!(request_id = %request_id, stage = "respond", error = %e, "credential serialization failed");
            return correlated(Error::internal(e.to_string()), &request_id);
        }
    };

    info!(request_id = %request_id, target = %target.id, "credentials issued");
    correlated(
        (
            StatusCode::OK,
            [("content-type", "application/json")],
            body,
        ),
        &request_id,
    )
}
