//! Response helpers and body plumbing shared by the proxy and the HTTP front door

use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE};
use hyper::{Response, StatusCode};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Streaming body used on both sides of the proxy
pub type ProxyBody = http_body_util::combinators::UnsyncBoxBody<Bytes, BoxError>;

/// Erase a body's concrete type without buffering it
pub fn box_body<B>(body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

/// A fully buffered body, for locally generated responses
pub fn full(body: impl Into<Bytes>) -> ProxyBody {
    box_body(Full::new(body.into()))
}

/// Create a plain-text response
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Create a 503 Service Unavailable response
pub fn service_unavailable_response(reason: &str) -> Response<ProxyBody> {
    text_response(
        StatusCode::SERVICE_UNAVAILABLE,
        format!("Service Unavailable: {}\n", reason),
    )
}

/// Create a 404 Not Found response
pub fn not_found_response(reason: &str) -> Response<ProxyBody> {
    text_response(StatusCode::NOT_FOUND, format!("Not Found: {}\n", reason))
}

/// Check if header is hop-by-hop (should not be forwarded)
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Remove hop-by-hop headers, returning how many were dropped
///
/// Headers listed in `Connection` are hop-by-hop for this message too.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) -> usize {
    let mut hop_by_hop: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    hop_by_hop.extend(
        headers
            .keys()
            .filter(|k| is_hop_by_hop_header(k.as_str()))
            .cloned(),
    );

    hop_by_hop
        .iter()
        .filter(|name| headers.remove(*name).is_some())
        .count()
}
