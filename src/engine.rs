//! Reverse proxy engine
//!
//! Forwards one request to a fixed upstream target: the Director rewrites
//! the request, hop-by-hop headers are stripped in both directions, the
//! response `Location` is rewritten and the body is streamed back with
//! optional bounded-latency flushing. CONNECT requests become raw TCP
//! tunnels and protocol upgrades are bridged once both sides switch.
//!
//! An engine is safe to share between concurrent requests; the only shared
//! mutable state is the connection pool inside [`Transport`].

use crate::error::{BoxError, ProxyError};
use crate::flush::{BodySender, FlushLoopExitHook, MaxLatencyWriter, ProxyBody, WriteFlush};
use crate::rewrite::{
    add_x_forwarded_headers, apply_host, declared_trailers, remove_hop_headers, rewrite_location,
    Director, ResponseRewriteRuleSet,
};
use crate::tunnel::tunnel;
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, TRAILER, UPGRADE};
use hyper::http::request;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode, Version};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

/// Tunnel lifetime used when none is configured
pub const DEFAULT_TUNNEL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Outbound request body type
type OutboundBody = UnsyncBoxBody<Bytes, BoxError>;

type HttpClient = Client<HttpsConnector<HttpConnector>, OutboundBody>;

/// Hook that may edit or reject an upstream response
pub type ModifyResponse = Arc<dyn Fn(&mut Response<Incoming>) -> Result<(), BoxError> + Send + Sync>;

/// Connection pool tuning for the outbound transport.
///
/// The legacy client pool only bounds idle connections per host, so there
/// is no total idle limit; it is `max_idle_per_host` times the number of
/// upstream hosts.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    /// Zero means unlimited
    pub max_conns_per_host: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let optimal_concurrent_connections = 32;
        Self {
            max_idle_per_host: optimal_concurrent_connections,
            idle_timeout: Duration::from_secs(30),
            max_conns_per_host: optimal_concurrent_connections * 2,
        }
    }
}

/// Engine configuration
#[derive(Clone, Default)]
pub struct EngineConfig {
    /// Absolute lifetime of a CONNECT tunnel; zero means five minutes
    pub timeout: Duration,
    /// Periodic flush while streaming; zero flushes after every chunk
    pub flush_interval: Duration,
    pub pool: PoolConfig,
    /// Accept invalid upstream TLS certificates
    pub ignore_tls_verification: bool,
    /// Runs when a periodic flush loop is stopped after a completed copy
    pub on_flush_loop_exit: Option<FlushLoopExitHook>,
}

/// Identity of the inbound connection a request arrived on
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo {
    pub remote_addr: SocketAddr,
    pub is_tls: bool,
}

/// Pooled outbound client with a per-host connection cap
#[derive(Clone)]
pub struct Transport {
    client: HttpClient,
    host_limits: Arc<DashMap<String, Arc<Semaphore>>>,
    max_conns_per_host: usize,
}

impl Transport {
    pub fn new(pool: &PoolConfig, ignore_tls_verification: bool) -> Result<Self, ProxyError> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(ignore_tls_verification)
            .danger_accept_invalid_hostnames(ignore_tls_verification)
            .build()?;
        let https = HttpsConnector::from((http, tokio_native_tls::TlsConnector::from(tls)));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(pool.max_idle_per_host)
            .pool_idle_timeout(pool.idle_timeout)
            .build(https);

        Ok(Self {
            client,
            host_limits: Arc::new(DashMap::new()),
            max_conns_per_host: pool.max_conns_per_host,
        })
    }

    async fn acquire(&self, authority: &str) -> Option<OwnedSemaphorePermit> {
        if self.max_conns_per_host == 0 {
            return None;
        }

        let limit = self
            .host_limits
            .entry(authority.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_conns_per_host)))
            .clone();

        limit.acquire_owned().await.ok()
    }

    /// Send a request upstream. The returned permit must live as long as
    /// the exchange, body streaming included.
    async fn execute(
        &self,
        req: Request<OutboundBody>,
    ) -> Result<(Response<Incoming>, Option<OwnedSemaphorePermit>), ProxyError> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let permit = self.acquire(&authority).await;
        let res = self.client.request(req).await?;
        Ok((res, permit))
    }
}

/// HTTP/HTTPS forwarding core for one upstream target
pub struct ReverseProxy {
    director: Director,
    transport: Transport,
    timeout: Duration,
    flush_interval: Duration,
    on_flush_loop_exit: Option<FlushLoopExitHook>,
    modify_response: Option<ModifyResponse>,
}

impl ReverseProxy {
    /// Build an engine with its own connection pool
    pub fn new(target: &Url, config: EngineConfig) -> Result<Self, ProxyError> {
        let transport = Transport::new(&config.pool, config.ignore_tls_verification)?;
        Self::with_transport(target, transport, config)
    }

    /// Build an engine over an existing, possibly shared, transport
    pub fn with_transport(target: &Url, transport: Transport, config: EngineConfig) -> Result<Self, ProxyError> {
        Ok(Self {
            director: Director::new(target)?,
            transport,
            timeout: config.timeout,
            flush_interval: config.flush_interval,
            on_flush_loop_exit: config.on_flush_loop_exit,
            modify_response: None,
        })
    }

    pub fn with_modify_response(mut self, hook: ModifyResponse) -> Self {
        self.modify_response = Some(hook);
        self
    }

    /// Upstream host[:port] this engine forwards to
    pub fn upstream_authority(&self) -> &str {
        self.director.authority()
    }

    fn tunnel_timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_TUNNEL_TIMEOUT
        } else {
            self.timeout
        }
    }

    /// Entry point: CONNECT tunnels, protocol upgrades or plain proxying
    pub async fn serve_http<B>(
        &self,
        req: Request<B>,
        client: ClientInfo,
        rules: &ResponseRewriteRuleSet,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if req.method() == Method::CONNECT {
            self.proxy_https(req).await
        } else if is_upgrade_request(req.headers()) {
            self.proxy_upgrade(req, client, rules).await
        } else {
            self.proxy_http(req, client, rules).await
        }
    }

    /// Forward a request and stream the upstream response back.
    ///
    /// Transport failures are returned without producing a response. If the
    /// client goes away, dropping the returned future cancels the upstream
    /// call and the streaming task stops at its next write.
    pub async fn proxy_http<B>(
        &self,
        req: Request<B>,
        client: ClientInfo,
        rules: &ResponseRewriteRuleSet,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (mut parts, body) = req.into_parts();
        self.prepare_outbound(&mut parts, client, rules)?;

        let outreq = Request::from_parts(parts, body.map_err(Into::into).boxed_unsync());
        let (res, permit) = self.transport.execute(outreq).await.map_err(|e| {
            debug!("http: proxy error: {}", e);
            e
        })?;

        self.finish_response(res, permit, client, rules)
    }

    /// Bridge a CONNECT request to a raw TCP connection to its target.
    ///
    /// The tunnel lives until either side hangs up or the configured
    /// timeout, counted from establishment, passes.
    pub async fn proxy_https<B>(&self, mut req: Request<B>) -> Result<Response<ProxyBody>, ProxyError> {
        if req.extensions().get::<OnUpgrade>().is_none() {
            warn!("http server does not support hijacker");
            return Err(ProxyError::HijackUnsupported);
        }

        let addr = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| ProxyError::InvalidConnectTarget(req.uri().to_string()))?;

        let upstream = TcpStream::connect(&addr).await.map_err(|source| {
            debug!("http: proxy error: dial {}: {}", addr, source);
            ProxyError::Dial {
                addr: addr.clone(),
                source,
            }
        })?;

        let deadline = Instant::now() + self.tunnel_timeout();
        let on_upgrade = hyper::upgrade::on(&mut req);

        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    if let Err(e) = tunnel(TokioIo::new(upgraded), upstream, Some(deadline)).await {
                        debug!("Tunnel to {} ended: {}", addr, e);
                    }
                }
                Err(e) => warn!("CONNECT upgrade failed for {}: {}", addr, e),
            }
        });

        Ok(Response::builder().status(StatusCode::OK).body(empty_body())?)
    }

    /// Forward an `Upgrade` request (WebSocket and friends). On `101` both
    /// connections are taken over and bridged; any other answer is streamed
    /// back like a regular response.
    pub async fn proxy_upgrade<B>(
        &self,
        mut req: Request<B>,
        client: ClientInfo,
        rules: &ResponseRewriteRuleSet,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if req.extensions().get::<OnUpgrade>().is_none() {
            return Err(ProxyError::HijackUnsupported);
        }

        let protocol = req.headers().get(UPGRADE).cloned();
        let client_upgrade = hyper::upgrade::on(&mut req);

        let (mut parts, body) = req.into_parts();
        self.prepare_outbound(&mut parts, client, rules)?;
        if let Some(protocol) = protocol {
            parts.headers.insert(UPGRADE, protocol);
            parts.headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        }

        let outreq = Request::from_parts(parts, body.map_err(Into::into).boxed_unsync());
        let (mut res, permit) = self.transport.execute(outreq).await?;

        if res.status() != StatusCode::SWITCHING_PROTOCOLS {
            return self.finish_response(res, permit, client, rules);
        }

        let upstream_upgrade = hyper::upgrade::on(&mut res);
        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.headers_mut() = res.headers().clone();

        let upstream = self.director.authority().to_string();
        tokio::spawn(async move {
            let _permit = permit;
            match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok((client_io, upstream_io)) => {
                    if let Err(e) = tunnel(TokioIo::new(client_io), TokioIo::new(upstream_io), None).await {
                        debug!("Upgraded connection to {} ended: {}", upstream, e);
                    }
                }
                Err(e) => warn!("Upgrade to {} failed: {}", upstream, e),
            }
        });

        Ok(response)
    }

    /// Director, Host selection, hop-by-hop stripping and X-Forwarded-*
    fn prepare_outbound(
        &self,
        parts: &mut request::Parts,
        client: ClientInfo,
        rules: &ResponseRewriteRuleSet,
    ) -> Result<(), ProxyError> {
        parts.extensions.clear();
        parts.version = Version::HTTP_11;

        self.director.direct(parts)?;
        apply_host(&mut parts.headers, rules);
        remove_hop_headers(&mut parts.headers);
        add_x_forwarded_headers(&mut parts.headers, client.remote_addr.ip(), client.is_tls);

        Ok(())
    }

    /// Rewrite the upstream response head and start streaming its body
    fn finish_response(
        &self,
        mut res: Response<Incoming>,
        permit: Option<OwnedSemaphorePermit>,
        client: ClientInfo,
        rules: &ResponseRewriteRuleSet,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let trailer_names = declared_trailers(res.headers());
        remove_hop_headers(res.headers_mut());

        if let Some(hook) = &self.modify_response {
            hook(&mut res).map_err(|e| {
                debug!("http: proxy error: {}", e);
                ProxyError::ModifyResponse(e)
            })?;
        }

        rewrite_location(res.headers_mut(), rules, client.is_tls);

        let (parts, upstream_body) = res.into_parts();
        let (sender, body) = BodySender::channel();

        let mut response = Response::new(body);
        *response.status_mut() = parts.status;
        *response.headers_mut() = parts.headers;

        // Announce trailers up front so the client side switches to chunked
        if !trailer_names.is_empty() {
            let names = trailer_names
                .iter()
                .map(|n| n.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            if let Ok(value) = HeaderValue::from_str(&names) {
                response.headers_mut().insert(TRAILER, value);
            }
        }

        tokio::spawn(stream_response(
            upstream_body,
            sender,
            self.flush_interval,
            self.on_flush_loop_exit.clone(),
            permit,
        ));

        Ok(response)
    }
}

/// Whether the request asks to switch protocols on this connection
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    if !headers.contains_key(UPGRADE) {
        return false;
    }

    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

async fn stream_response(
    upstream: Incoming,
    sender: BodySender,
    flush_interval: Duration,
    on_exit: Option<FlushLoopExitHook>,
    _permit: Option<OwnedSemaphorePermit>,
) {
    let client_gone = sender.closed();
    let sink = Arc::new(Mutex::new(sender));

    let copy = async {
        if flush_interval.is_zero() {
            let mut direct = sink.clone();
            copy_body(&mut direct, upstream, true).await
        } else {
            let mut writer = MaxLatencyWriter::start(sink.clone(), flush_interval, on_exit);
            let copied = copy_body(&mut writer, upstream, false).await;
            writer.stop().await;
            copied
        }
    };

    let copied = tokio::select! {
        copied = copy => copied,
        _ = client_gone => Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away")),
    };

    let mut sink = sink.lock().await;
    let finished = match copied {
        Ok(trailers) => match sink.flush().await {
            Ok(()) => match trailers {
                Some(trailers) => sink.send_trailers(trailers).await,
                None => Ok(()),
            },
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };

    if let Err(e) = finished {
        debug!("Response streaming ended early: {}", e);
        sink.abort(e).await;
    }
}

/// Copy body frames into `dst`, returning trailers once the source is
/// drained. The source is dropped before trailers are handed back.
async fn copy_body<W, B>(dst: &mut W, mut src: B, flush_each: bool) -> io::Result<Option<HeaderMap>>
where
    W: WriteFlush,
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    let mut trailers = None;

    while let Some(frame) = src.frame().await {
        let frame = frame.map_err(|e| {
            let e: BoxError = e.into();
            io::Error::new(io::ErrorKind::Other, e)
        })?;
        match frame.into_data() {
            Ok(data) => {
                dst.write(data).await?;
                if flush_each {
                    dst.flush().await?;
                }
            }
            Err(frame) => {
                if let Ok(t) = frame.into_trailers() {
                    trailers = Some(t);
                }
            }
        }
    }

    drop(src);
    Ok(trailers)
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use http_body_util::StreamBody;
    use hyper::body::Frame;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    fn client_info() -> ClientInfo {
        ClientInfo {
            remote_addr: "127.0.0.1:50000".parse().unwrap(),
            is_tls: false,
        }
    }

    #[test]
    fn test_is_upgrade_request() {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_upgrade_request(&headers));

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(is_upgrade_request(&headers));

        headers.remove(UPGRADE);
        assert!(!is_upgrade_request(&headers));
    }

    #[test]
    fn test_tunnel_timeout_defaults_to_five_minutes() {
        let target = Url::parse("http://127.0.0.1:9").unwrap();
        let engine = ReverseProxy::new(&target, EngineConfig::default()).unwrap();
        assert_eq!(engine.tunnel_timeout(), DEFAULT_TUNNEL_TIMEOUT);

        let engine = ReverseProxy::new(
            &target,
            EngineConfig {
                timeout: Duration::from_secs(3),
                ..EngineConfig::default()
            },
        )
        .unwrap();
        assert_eq!(engine.tunnel_timeout(), Duration::from_secs(3));
        assert_eq!(engine.upstream_authority(), "127.0.0.1:9");
    }

    #[tokio::test]
    async fn test_copy_body_returns_trailers_after_data() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", HeaderValue::from_static("abc"));

        let frames: Vec<Result<Frame<Bytes>, Infallible>> = vec![
            Ok(Frame::data(Bytes::from_static(b"one "))),
            Ok(Frame::data(Bytes::from_static(b"two"))),
            Ok(Frame::trailers(trailers)),
        ];
        let src = StreamBody::new(stream::iter(frames));

        let (mut sender, body) = BodySender::channel();
        let collector = tokio::spawn(async move { body.collect().await.unwrap().to_bytes() });

        let got = copy_body(&mut sender, src, true).await.unwrap();
        drop(sender);

        assert_eq!(got.unwrap().get("x-checksum").unwrap(), "abc");
        assert_eq!(collector.await.unwrap(), Bytes::from_static(b"one two"));
    }

    #[tokio::test]
    async fn test_connect_without_upgrade_support_fails_fast() {
        let target = Url::parse("http://127.0.0.1:9").unwrap();
        let engine = ReverseProxy::new(&target, EngineConfig::default()).unwrap();
        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("127.0.0.1:443")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let result = engine
            .serve_http(req, client_info(), &ResponseRewriteRuleSet::default())
            .await;
        assert!(matches!(result, Err(ProxyError::HijackUnsupported)));
    }

    #[tokio::test]
    async fn test_transport_failure_is_returned() {
        // Grab a free port, then close it so the connection is refused
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let target = Url::parse(&format!("http://{}", addr)).unwrap();
        let engine = ReverseProxy::new(&target, EngineConfig::default()).unwrap();
        let req = Request::builder()
            .uri("/anything")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let result = engine
            .proxy_http(req, client_info(), &ResponseRewriteRuleSet::default())
            .await;
        assert!(matches!(result, Err(ProxyError::Transport(_))));
    }

    async fn mock_upstream(template: wiremock::ResponseTemplate) -> wiremock::MockServer {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::any())
            .respond_with(template)
            .mount(&server)
            .await;
        server
    }

    fn engine_for(upstream: &wiremock::MockServer) -> ReverseProxy {
        let target = Url::parse(&upstream.uri()).unwrap();
        ReverseProxy::new(&target, EngineConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_response_hop_headers_stripped_and_location_rewritten() {
        let upstream = mock_upstream(
            wiremock::ResponseTemplate::new(302)
                .insert_header("Keep-Alive", "timeout=5")
                .insert_header("X-Backend", "yes")
                .insert_header("Location", "/next"),
        )
        .await;
        let engine = engine_for(&upstream);
        let rules = ResponseRewriteRuleSet {
            proxy_domain: engine.upstream_authority().to_string(),
            original_host: "proxy.example.com".into(),
            use_tls: false,
            path_prefix: "/mounted".into(),
        };

        let req = Request::builder().uri("/go").body(Empty::<Bytes>::new()).unwrap();
        let res = engine.proxy_http(req, client_info(), &rules).await.unwrap();

        assert_eq!(res.status(), StatusCode::FOUND);
        assert!(res.headers().get("keep-alive").is_none());
        assert_eq!(res.headers()["x-backend"], "yes");
        assert_eq!(res.headers()["location"], "/mounted/next");
        assert_eq!(res.headers()["zr-origin-location"], "/next");
    }

    #[tokio::test]
    async fn test_modify_response_hook() {
        let upstream = mock_upstream(wiremock::ResponseTemplate::new(200).set_body_string("payload")).await;

        let engine = engine_for(&upstream).with_modify_response(Arc::new(|res: &mut Response<Incoming>| -> Result<(), BoxError> {
            res.headers_mut().insert("x-modified", HeaderValue::from_static("1"));
            Ok(())
        }));
        let req = Request::builder().uri("/").body(Empty::<Bytes>::new()).unwrap();
        let res = engine
            .proxy_http(req, client_info(), &ResponseRewriteRuleSet::default())
            .await
            .unwrap();
        assert_eq!(res.headers()["x-modified"], "1");
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"payload"));

        let rejecting = engine_for(&upstream).with_modify_response(Arc::new(|_: &mut Response<Incoming>| -> Result<(), BoxError> {
            Err("rejected by policy".into())
        }));
        let req = Request::builder().uri("/").body(Empty::<Bytes>::new()).unwrap();
        let result = rejecting
            .proxy_http(req, client_info(), &ResponseRewriteRuleSet::default())
            .await;
        assert!(matches!(result, Err(ProxyError::ModifyResponse(_))));
    }

    /// Upstream that answers every request with an endless chunked body
    async fn endless_upstream() -> SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    if socket.read(&mut buf).await.is_err() {
                        return;
                    }
                    let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
                    if socket.write_all(head).await.is_err() {
                        return;
                    }
                    while socket.write_all(b"5\r\nhello\r\n").await.is_ok() {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_client_drop_mid_stream_releases_host_slot() {
        let addr = endless_upstream().await;
        let target = Url::parse(&format!("http://{}", addr)).unwrap();
        let engine = ReverseProxy::new(
            &target,
            EngineConfig {
                flush_interval: Duration::from_millis(10),
                pool: PoolConfig {
                    max_conns_per_host: 1,
                    ..PoolConfig::default()
                },
                ..EngineConfig::default()
            },
        )
        .unwrap();
        let rules = ResponseRewriteRuleSet::default();
        let get = || Request::builder().uri("/stream").body(Empty::<Bytes>::new()).unwrap();

        let res = engine.proxy_http(get(), client_info(), &rules).await.unwrap();
        let mut body = res.into_body();
        let frame = body.frame().await.unwrap().unwrap();
        assert!(!frame.into_data().unwrap().is_empty());

        // The only slot is held while the first response is still streaming
        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            engine.proxy_http(get(), client_info(), &rules),
        )
        .await;
        assert!(blocked.is_err());

        drop(body);

        let res = tokio::time::timeout(
            Duration::from_secs(5),
            engine.proxy_http(get(), client_info(), &rules),
        )
        .await
        .expect("slot was not released after the client went away")
        .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let frame = res.into_body().frame().await.unwrap().unwrap();
        assert!(!frame.into_data().unwrap().is_empty());
    }
}
