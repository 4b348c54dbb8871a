//! Error taxonomy for the supervisor and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Reasons `ProcessSupervisor::start` can fail.
///
/// None of these are fatal to the host process; the supervisor settles in
/// a well-defined state and the proxy reports 503 afterwards.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// Something else already accepts connections on the dev server port
    #[error("port {host}:{port} is already in use by another process")]
    AlreadyInUse { host: String, port: u16 },

    /// The frontend working directory is absent
    #[error("working directory does not exist: {}", .0.display())]
    MissingWorkingDir(PathBuf),

    /// No readiness signal within the configured window
    #[error("dev server did not become ready within {} seconds", .0.as_secs())]
    StartTimeout(Duration),

    /// The OS refused to create the process, or the command is invalid
    #[error("failed to spawn dev server: {0}")]
    SpawnFailure(#[source] std::io::Error),

    /// The child closed its output before signalling readiness
    #[error("dev server exited before becoming ready")]
    ProcessExited,

    /// A concurrent stop() won the race while starting
    #[error("dev server start was cancelled by a stop request")]
    Cancelled,

    /// Integration or auto-start switched off in configuration
    #[error("dev server integration is disabled")]
    Disabled,
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Not running in development mode
    NotDevelopment,
    /// Path belongs to the backend, never to the dev server
    ExcludedPath,
    /// The dev server is not running
    UpstreamUnavailable,
    /// Network failure while talking to the dev server
    UpstreamTransportError,
    /// The dev server did not answer within the request timeout
    UpstreamTimeout,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NotDevelopment => StatusCode::NOT_FOUND,
            ProxyErrorCode::ExcludedPath => StatusCode::NOT_FOUND,
            ProxyErrorCode::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamTransportError => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpstreamTimeout => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NotDevelopment => "NOT_DEVELOPMENT",
            ProxyErrorCode::ExcludedPath => "EXCLUDED_PATH",
            ProxyErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ProxyErrorCode::UpstreamTransportError => "UPSTREAM_TRANSPORT_ERROR",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
        }
    }
}

/// Diagnostic body of a declined or failed proxy request
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
    /// Correlates the reply with the proxy's log lines
    pub request_id: String,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>, request_id: &str) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
            request_id: request_id.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing a plain struct of strings and integers cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// JSON error reply carrying `X-Proxy-Error` and `X-Request-Id`
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
    request_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, message, request_id).to_json();

    let mut builder = Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value());
    if let Ok(value) = hyper::header::HeaderValue::from_str(request_id) {
        builder = builder.header("X-Request-Id", value);
    }
    builder
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and checked headers")
}
