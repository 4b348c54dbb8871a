use crate::error::{json_error_response, ProxyErrorCode};
use crate::mode::ModeDetector;
use crate::pool::UpstreamError;
use crate::process::ProcessSupervisor;
use crate::upgrade::{is_hmr_upgrade, switching_protocols_response};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::service::service_fn;
use hyper::{Request, Response, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Body type flowing through the router in both directions
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Connection- and framing-specific headers never copied across the hop
pub static EXCLUDED_HEADERS: [HeaderName; 4] = [HOST, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING];

/// Where forwarded requests go. The pooled client is the real
/// implementation; tests substitute doubles.
pub trait Upstream: Send + Sync + 'static {
    fn send(
        &self,
        req: Request<ProxyBody>,
    ) -> impl Future<Output = Result<Response<ProxyBody>, UpstreamError>> + Send;
}

/// What to do with one inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyDecision {
    /// Forward to this absolute dev server URL
    Forward(Uri),
    /// Answer locally with the error's status
    Decline(ProxyErrorCode),
    /// Live-reload socket; answer 101 without tunnelling
    Upgrade,
}

/// Routes inbound requests to the supervised dev server.
///
/// Stateless per request: it only reads the supervisor's state.
pub struct ReverseProxyRouter<U> {
    supervisor: Arc<ProcessSupervisor>,
    mode: ModeDetector,
    excluded_prefixes: Vec<String>,
    upstream: U,
    request_timeout: Duration,
}

impl<U: Upstream> ReverseProxyRouter<U> {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        mode: ModeDetector,
        excluded_prefixes: Vec<String>,
        upstream: U,
        request_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            mode,
            excluded_prefixes,
            upstream,
            request_timeout,
        }
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Classify a request: mode, excluded prefix, HMR upgrade, liveness
    pub fn decide<B>(&self, req: &Request<B>) -> ProxyDecision {
        if !self.mode.is_development() {
            return ProxyDecision::Decline(ProxyErrorCode::NotDevelopment);
        }

        if self.is_excluded(req.uri().path()) {
            return ProxyDecision::Decline(ProxyErrorCode::ExcludedPath);
        }

        if is_hmr_upgrade(req.headers()) {
            return ProxyDecision::Upgrade;
        }

        if !self.supervisor.is_running() {
            return ProxyDecision::Decline(ProxyErrorCode::UpstreamUnavailable);
        }

        match target_uri(&self.supervisor.base_url(), req.uri()) {
            Some(uri) => ProxyDecision::Forward(uri),
            None => ProxyDecision::Decline(ProxyErrorCode::UpstreamTransportError),
        }
    }

    pub async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let request_id = request_id.as_str();

        debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

        match self.decide(&req) {
            ProxyDecision::Decline(code) => {
                if code == ProxyErrorCode::UpstreamUnavailable {
                    warn!(uri = %req.uri(), request_id, "Dev server is not running");
                }
                json_error_response(code, decline_message(code), request_id)
            }
            ProxyDecision::Upgrade => {
                let url = self.supervisor.base_url();
                info!(
                    uri = %req.uri(),
                    request_id,
                    dev_server = %url,
                    "WebSocket upgrade for HMR, client should connect to the dev server directly"
                );
                switching_protocols_response(&url)
            }
            ProxyDecision::Forward(target) => self.forward(req, target, request_id).await,
        }
    }

    async fn forward(
        &self,
        req: Request<ProxyBody>,
        target: Uri,
        request_id: &str,
    ) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();
        debug!(method = %parts.method, %target, request_id, "Proxying request to dev server");

        let mut builder = Request::builder().method(parts.method).uri(target.clone());
        if let Some(headers) = builder.headers_mut() {
            *headers = filter_headers(&parts.headers);
        }
        let upstream_req = match builder.body(body) {
            Ok(req) => req,
            Err(e) => {
                error!(%target, request_id, error = %e, "Failed to build upstream request");
                return json_error_response(
                    ProxyErrorCode::UpstreamTransportError,
                    format!("Error proxying to dev server: {}", e),
                    request_id,
                );
            }
        };

        let result = tokio::time::timeout(self.request_timeout, self.upstream.send(upstream_req)).await;

        match result {
            Ok(Ok(response)) => {
                let (mut parts, body) = response.into_parts();
                strip_excluded_headers(&mut parts.headers);
                Response::from_parts(parts, body)
            }
            Ok(Err(e)) => {
                error!(%target, request_id, error = %e, "Error proxying request to dev server");
                json_error_response(
                    ProxyErrorCode::UpstreamTransportError,
                    format!("Error proxying to dev server: {}", e),
                    request_id,
                )
            }
            Err(_) => {
                warn!(
                    %target,
                    request_id,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Dev server request timed out"
                );
                json_error_response(
                    ProxyErrorCode::UpstreamTimeout,
                    format!(
                        "Dev server did not respond within {} seconds",
                        self.request_timeout.as_secs()
                    ),
                    request_id,
                )
            }
        }
    }
}

fn decline_message(code: ProxyErrorCode) -> &'static str {
    match code {
        ProxyErrorCode::NotDevelopment | ProxyErrorCode::ExcludedPath => "Not found",
        ProxyErrorCode::UpstreamUnavailable => "Dev server is not running",
        ProxyErrorCode::UpstreamTransportError | ProxyErrorCode::UpstreamTimeout => {
            "Invalid dev server target URL"
        }
    }
}

/// Base URL + original path and query, byte for byte
pub fn target_uri(base_url: &str, original: &Uri) -> Option<Uri> {
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{}{}", base_url.trim_end_matches('/'), path_and_query)
        .parse()
        .ok()
}

/// Copy of `headers` without the excluded set, keeping repeated values in order
pub fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = headers.clone();
    strip_excluded_headers(&mut filtered);
    filtered
}

pub fn strip_excluded_headers(headers: &mut HeaderMap) {
    for name in &EXCLUDED_HEADERS {
        headers.remove(name);
    }
}

/// Inbound HTTP server that hands every request to the router
pub struct ProxyServer<U> {
    bind_addr: SocketAddr,
    router: Arc<ReverseProxyRouter<U>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<U: Upstream> ProxyServer<U> {
    pub fn new(
        bind_addr: SocketAddr,
        router: Arc<ReverseProxyRouter<U>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            router,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S, U>(stream: S, router: Arc<ReverseProxyRouter<U>>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: Upstream,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { Ok::<_, hyper::Error>(router.handle(req.map(|body| body.boxed())).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
