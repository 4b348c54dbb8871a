//! Detection of live-reload WebSocket upgrades.
//!
//! Upgrades are not tunnelled. The router answers 101 and logs where the
//! dev server lives; the dev server's own HMR client script reconnects to
//! that address directly.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, CONNECTION, UPGRADE};
use hyper::{Response, StatusCode};

/// Response header naming the dev server the client should reconnect to
pub const X_DEV_SERVER: &str = "x-dev-server";

/// True iff `Upgrade` contains "websocket" and `Connection` contains
/// "upgrade", both case-insensitive
pub fn is_hmr_upgrade(headers: &HeaderMap) -> bool {
    header_contains(headers, UPGRADE, "websocket") && header_contains(headers, CONNECTION, "upgrade")
}

fn header_contains(headers: &HeaderMap, name: hyper::header::HeaderName, needle: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains(needle))
}

/// Build the 101 reply for an HMR upgrade
pub fn switching_protocols_response(dev_server_url: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    if let Ok(value) = hyper::header::HeaderValue::from_str(dev_server_url) {
        builder = builder.header(X_DEV_SERVER, value);
    }
    builder
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}
