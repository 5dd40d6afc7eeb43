//! Proxy server
//! Accepts HTTP/HTTPS connections and dispatches each request to a
//! redirect rule or to the engine of the matching route

use crate::cert_store::{run_renewal_loop, CertificateStore};
use crate::engine::{empty_body, full_body, ClientInfo, EngineConfig, PoolConfig, ReverseProxy, Transport};
use crate::error::ProxyError;
use crate::flush::{FlushLoopExitHook, ProxyBody};
use crate::redirect::RedirectRuleTable;
use crate::rewrite::ResponseRewriteRuleSet;
use crate::routes::{ProxyRoute, RouteStore};
use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Proxy server configuration
#[derive(Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    pub https_port: u16,
    pub enable_https: bool,
    pub force_https: bool,
    pub flush_interval: Duration,
    pub tunnel_timeout: Duration,
    pub autorenew_interval: Duration,
    pub pool: PoolConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            https_port: 8443,
            enable_https: false,
            force_https: false,
            flush_interval: Duration::ZERO,
            tunnel_timeout: Duration::from_secs(300),
            autorenew_interval: Duration::from_secs(86400),
            pool: PoolConfig::default(),
        }
    }
}

/// Engine built for one route, tagged with the upstream settings it was
/// built from
struct CachedEngine {
    signature: String,
    engine: Arc<ReverseProxy>,
}

/// Proxy server
pub struct ProxyServer {
    config: ServerConfig,
    routes: RouteStore,
    redirects: Arc<RedirectRuleTable>,
    certs: Arc<CertificateStore>,
    transport: Transport,
    insecure_transport: Transport,
    /// Keyed by route id
    engines: DashMap<String, CachedEngine>,
    on_flush_loop_exit: Option<FlushLoopExitHook>,
}

impl ProxyServer {
    pub fn new(
        config: ServerConfig,
        routes: RouteStore,
        redirects: Arc<RedirectRuleTable>,
        certs: Arc<CertificateStore>,
    ) -> Result<Self> {
        let transport = Transport::new(&config.pool, false).context("Failed to build upstream transport")?;
        let insecure_transport =
            Transport::new(&config.pool, true).context("Failed to build upstream transport")?;

        Ok(Self {
            config,
            routes,
            redirects,
            certs,
            transport,
            insecure_transport,
            engines: DashMap::new(),
            on_flush_loop_exit: None,
        })
    }

    /// Hook run whenever a periodic flush loop finishes a response
    pub fn with_flush_loop_exit_hook(mut self, hook: FlushLoopExitHook) -> Self {
        self.on_flush_loop_exit = Some(hook);
        self
    }

    /// Start the listeners and, with HTTPS on, the renewal scan
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let http_addr: SocketAddr = format!("0.0.0.0:{}", self.config.http_port).parse()?;

        info!("Proxy server starting on HTTP:{}", self.config.http_port);

        if self.config.enable_https {
            let https_addr: SocketAddr = format!("0.0.0.0:{}", self.config.https_port).parse()?;
            let https_server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = https_server.run_https_server(https_addr).await {
                    error!("HTTPS server stopped: {:#}", e);
                }
            });

            tokio::spawn(run_renewal_loop(self.certs.clone(), self.config.autorenew_interval));
        }

        self.run_http_server(http_addr).await
    }

    async fn run_http_server(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;
        info!("HTTP server listening on {}", addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(server.serve_connection(stream, remote_addr, false));
        }
    }

    async fn run_https_server(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind HTTPS listener on {}", addr))?;
        let acceptor = self.certs.tls_acceptor();
        info!("HTTPS server listening on {}", addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let acceptor = acceptor.clone();
            let server = self.clone();

            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => server.serve_connection(tls_stream, remote_addr, true).await,
                    Err(e) => debug!("TLS handshake with {} failed: {}", remote_addr, e),
                }
            });
        }
    }

    /// Serve one client connection, HTTP/1.1 with upgrades
    async fn serve_connection<I>(self: Arc<Self>, io: I, remote_addr: SocketAddr, is_tls: bool)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let conn_id = Uuid::new_v4();
        let span = info_span!("conn", id = %conn_id, peer = %remote_addr, tls = is_tls);
        let client = ClientInfo { remote_addr, is_tls };

        async move {
            let result = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(false)
                .serve_connection(
                    TokioIo::new(io),
                    service_fn(move |req| {
                        let server = self.clone();
                        async move { server.handle_request(req, client).await }
                    }),
                )
                .with_upgrades()
                .await
                .map_err(|e| anyhow!("HTTP service error: {}", e));

            if let Err(e) = result {
                debug!("Connection error: {}", e);
            }
        }
        .instrument(span)
        .await
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        client: ClientInfo,
    ) -> Result<Response<ProxyBody>, Infallible> {
        match self.process_request(req, client).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("Request error: {:#}", e);
                Ok(Self::error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"))
            }
        }
    }

    async fn process_request(&self, mut req: Request<Incoming>, client: ClientInfo) -> Result<Response<ProxyBody>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!("{} {}", method, req.uri());

        let original_host = match request_host(&req) {
            Some(h) => h,
            None => return Ok(Self::error_response(StatusCode::BAD_REQUEST, "Missing Host header")),
        };
        let host = strip_port(&original_host).to_ascii_lowercase();

        if self.config.force_https && !client.is_tls && !Self::is_https_request(&req) && method != Method::CONNECT {
            let location = self.https_location(&host, &req);
            return Ok(Self::redirect_response(StatusCode::MOVED_PERMANENTLY, &location));
        }

        if method != Method::CONNECT {
            let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
            let host_url = format!("{}{}", host, path_and_query);

            let redirect = match self.redirects.match_url(&host_url) {
                Some(rule) => Some((rule, host_url)),
                None => self
                    .redirects
                    .match_url(path_and_query)
                    .map(|rule| (rule, path_and_query.to_string())),
            };

            if let Some((rule, matched_url)) = redirect {
                let location = rule.target_for(&matched_url);
                let status = StatusCode::from_u16(rule.status_code).unwrap_or(StatusCode::TEMPORARY_REDIRECT);
                debug!("Redirect {} -> {} ({})", matched_url, location, status);
                return Ok(Self::redirect_response(status, &location));
            }
        }

        let route = match self.routes.find_route(&host, &path)? {
            Some(r) => r,
            None => return Ok(Self::error_response(StatusCode::NOT_FOUND, "No route found")),
        };

        if method != Method::CONNECT && !route.path_prefix.is_empty() {
            let stripped = route.strip_prefix(&path);
            let path_and_query = match req.uri().query() {
                Some(q) => format!("{}?{}", stripped, q),
                None => stripped,
            };
            *req.uri_mut() = Uri::builder()
                .path_and_query(path_and_query)
                .build()
                .context("Failed to rebuild request path")?;
        }

        let engine = self.engine_for(&route)?;
        let rules = ResponseRewriteRuleSet {
            proxy_domain: engine.upstream_authority().to_string(),
            original_host: original_host.clone(),
            use_tls: route.use_tls(),
            path_prefix: route.mount_point(),
        };

        match engine.serve_http(req, client, &rules).await {
            Ok(response) => Ok(response),
            Err(ProxyError::HijackUnsupported) => Ok(Self::error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Connection does not support hijacking",
            )),
            Err(e) => {
                error!("Upstream error for {}{}: {}", host, path, e);
                Ok(Self::error_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
            }
        }
    }

    /// Engine for a route's upstream, built on first use and rebuilt when
    /// the route's upstream settings change
    fn engine_for(&self, route: &ProxyRoute) -> Result<Arc<ReverseProxy>> {
        let signature = format!("{}#{}", route.upstream, route.skip_tls_verify);
        if let Some(cached) = self.engines.get(&route.id) {
            if cached.signature == signature {
                return Ok(cached.engine.clone());
            }
        }

        let transport = if route.skip_tls_verify {
            self.insecure_transport.clone()
        } else {
            self.transport.clone()
        };
        let config = EngineConfig {
            timeout: self.config.tunnel_timeout,
            flush_interval: self.config.flush_interval,
            pool: self.config.pool.clone(),
            ignore_tls_verification: route.skip_tls_verify,
            on_flush_loop_exit: self.on_flush_loop_exit.clone(),
        };

        let engine = Arc::new(ReverseProxy::with_transport(&route.upstream_url()?, transport, config)?);
        debug!("Created engine for route {} ({})", route.id, route.upstream);

        self.engines.insert(
            route.id.clone(),
            CachedEngine {
                signature,
                engine: engine.clone(),
            },
        );
        self.prune_engines();

        Ok(engine)
    }

    /// Drop cached engines whose route no longer exists
    fn prune_engines(&self) {
        let live: HashSet<String> = match self.routes.list_routes(None) {
            Ok(routes) => routes.into_iter().map(|r| r.id).collect(),
            Err(e) => {
                warn!("Skipping engine cache pruning: {:#}", e);
                return;
            }
        };
        self.engines.retain(|id, _| live.contains(id));
    }

    fn https_location<T>(&self, host: &str, req: &Request<T>) -> String {
        let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        if self.config.https_port == 443 {
            format!("https://{}{}", host, path_and_query)
        } else {
            format!("https://{}:{}{}", host, self.config.https_port, path_and_query)
        }
    }

    /// Check if request is from HTTPS (via proxy headers)
    fn is_https_request<T>(req: &Request<T>) -> bool {
        let header_is = |name: &str, expected: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case(expected))
                .unwrap_or(false)
        };

        header_is("x-forwarded-proto", "https") || header_is("x-forwarded-ssl", "on") || header_is("front-end-https", "on")
    }

    fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
        let mut response = Response::new(full_body(message.to_string()));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        response
    }

    fn redirect_response(status: StatusCode, location: &str) -> Response<ProxyBody> {
        match HeaderValue::from_str(location) {
            Ok(value) => {
                let mut response = Response::new(empty_body());
                *response.status_mut() = status;
                response.headers_mut().insert(LOCATION, value);
                response
            }
            Err(_) => {
                warn!("Unusable redirect target: {}", location);
                Self::error_response(StatusCode::INTERNAL_SERVER_ERROR, "Invalid redirect target")
            }
        }
    }
}

/// Host the client addressed: Host header, else the request-target authority
fn request_host<T>(req: &Request<T>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .filter(|h| !h.is_empty())
}

/// Drop a trailing `:port`, keeping bracketed IPv6 literals intact
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_engine_cache_follows_route_changes() {
        let dir = tempdir().unwrap();
        let routes = RouteStore::new(dir.path().join("routes.db")).unwrap();
        let redirects = Arc::new(RedirectRuleTable::load(dir.path().join("redirect")).unwrap());
        let certs = Arc::new(CertificateStore::new(dir.path().join("certs")).unwrap());
        let server = ProxyServer::new(ServerConfig::default(), routes.clone(), redirects, certs).unwrap();

        let route = routes.add_route("app.example.com", "", "http://10.0.0.1:3000", false).unwrap();
        let first = server.engine_for(&route).unwrap();
        assert_eq!(first.upstream_authority(), "10.0.0.1:3000");
        assert!(Arc::ptr_eq(&first, &server.engine_for(&route).unwrap()));

        routes.update_route(&route.id, Some("http://10.0.0.2:3000"), None).unwrap();
        let route = routes.get_route_by_id(&route.id).unwrap().unwrap();
        let second = server.engine_for(&route).unwrap();
        assert_eq!(second.upstream_authority(), "10.0.0.2:3000");
        assert_eq!(server.engines.len(), 1);

        routes.delete_route("app.example.com", None).unwrap();
        let other = routes.add_route("other.example.com", "", "http://10.0.0.3:3000", false).unwrap();
        server.engine_for(&other).unwrap();
        assert_eq!(server.engines.len(), 1);
        assert!(server.engines.contains_key(&other.id));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8443"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }

    #[test]
    fn test_request_host_prefers_header() {
        let req = Request::builder()
            .uri("http://authority.example.com/x")
            .header(HOST, "header.example.com:8080")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).unwrap(), "header.example.com:8080");

        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("tunnel.example.com:443")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).unwrap(), "tunnel.example.com:443");

        let req = Request::builder().uri("/x").body(()).unwrap();
        assert!(request_host(&req).is_none());
    }

    #[test]
    fn test_is_https_request() {
        let req = Request::builder()
            .header("X-Forwarded-Proto", "https")
            .body(())
            .unwrap();
        assert!(ProxyServer::is_https_request(&req));

        let req = Request::builder().header("front-end-https", "on").body(()).unwrap();
        assert!(ProxyServer::is_https_request(&req));

        let req = Request::builder().body(()).unwrap();
        assert!(!ProxyServer::is_https_request(&req));
    }

    #[test]
    fn test_redirect_response_rejects_bad_location() {
        let ok = ProxyServer::redirect_response(StatusCode::FOUND, "https://example.com/");
        assert_eq!(ok.status(), StatusCode::FOUND);
        assert_eq!(ok.headers()[LOCATION], "https://example.com/");

        let bad = ProxyServer::redirect_response(StatusCode::FOUND, "https://example.com/\n");
        assert_eq!(bad.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
