//! One streaming HTTP forward attempt against a preview upstream.

use axum::{
    body::Body,
    http::{header::HeaderName, HeaderMap, Method, StatusCode},
    response::Response,
};
use futures::TryStreamExt;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Hop-by-hop headers are never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Why a forward attempt failed.
#[derive(Debug)]
pub(crate) enum AttemptError {
    /// The upstream could not be dialed (connect/read failure).
    Dial(String),

    /// The upstream answered with a gateway failure status.
    Gateway(StatusCode),
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Forwards one request and streams the response back.
///
/// The caller buffers the request body so a failed attempt can be retried
/// against a promoted upstream. Response bodies stream through unbuffered.
pub(crate) async fn forward(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    headers: &HeaderMap,
    body: bytes::Bytes,
) -> Result<Response, AttemptError> {
    let mut request = client.request(method, url).body(body);
    for (name, value) in headers {
        if is_forwardable(name) && name.as_str() != "host" && name.as_str() != "content-length" {
            request = request.header(name, value);
        }
    }

    let upstream = request
        .send()
        .await
        .map_err(|e| AttemptError::Dial(e.to_string()))?;

    let status = upstream.status();
    if status == StatusCode::BAD_GATEWAY || status == StatusCode::SERVICE_UNAVAILABLE {
        return Err(AttemptError::Gateway(status));
    }

    let mut response = Response::builder().status(status);
    if let Some(out_headers) = response.headers_mut() {
        for (name, value) in upstream.headers() {
            if is_forwardable(name) && name.as_str() != "content-length" {
                out_headers.insert(name.clone(), value.clone());
            }
        }
    }

    let body = Body::from_stream(upstream.bytes_stream().map_err(std::io::Error::other));
    response
        .body(body)
        .map_err(|e| AttemptError::Dial(e.to_string()))
}

/// Whether a header survives proxying.
pub(crate) fn is_forwardable(name: &HeaderName) -> bool {
    !HOP_BY_HOP.contains(&name.as_str())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_headers_filtered() {
        assert!(!is_forwardable(&HeaderName::from_static("connection")));
        assert!(!is_forwardable(&HeaderName::from_static("upgrade")));
        assert!(!is_forwardable(&HeaderName::from_static(
            "transfer-encoding"
        )));
        assert!(is_forwardable(&HeaderName::from_static("content-type")));
        assert!(is_forwardable(&HeaderName::from_static("x-request-id")));
    }
}
