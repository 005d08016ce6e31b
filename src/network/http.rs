//! Body and response helpers shared by the proxy paths

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::{HeaderMap, Response, StatusCode};
use tracing::{error, info, warn};

use crate::TapedeckError;

use super::{BoxError, ProxyBody};

/// Headers that describe one hop and are never forwarded or stored
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Box an in-memory body
pub fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| -> BoxError { match never {} })
        .boxed()
}

/// Box an inbound hyper body
pub fn incoming(body: Incoming) -> ProxyBody {
    body.map_err(|err| -> BoxError { Box::new(err) }).boxed()
}

/// Plain-text response with the given status
pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut response = Response::new(full(message.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Status code an error is reported with
#[must_use]
pub fn error_status(error: &TapedeckError) -> StatusCode {
    match error {
        TapedeckError::NotFound { .. } | TapedeckError::IncompleteRecording { .. } => {
            StatusCode::FAILED_DEPENDENCY
        }
        TapedeckError::Upstream(_) => StatusCode::BAD_GATEWAY,
        TapedeckError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Turn an error into a diagnostic response, logging it at a fitting level
#[must_use]
pub fn error_response(error: &TapedeckError) -> Response<ProxyBody> {
    let status = error_status(error);
    if error.is_replay_miss() {
        info!("Replay miss: {}", error);
    } else if status.is_server_error() {
        error!("Request failed: {}", error);
    } else {
        warn!("Request rejected: {}", error);
    }
    text_response(status, error.to_string())
}

/// Remove hop-by-hop headers, including any listed in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}
