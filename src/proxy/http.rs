//! HTTP proxy variants
//!
//! `http-server` terminates TLCP/TLS and forwards each request to the target
//! over plain TCP; `http-client` accepts plain HTTP and forwards each request
//! over TLCP/TLS. Both rewrite headers with the instance's header rules and
//! answer `502 Bad Gateway` when the target fails.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::common::{connect_with_timeout, ProxyError, Result};
use crate::config::InstanceConfig;
use crate::protocol::ProtocolType;
use crate::security::{KeyStoreManager, RootCertManager};
use crate::stats::StatsCollector;
use super::auto::{ProtocolConn, ProtocolListener};
use super::client::dial_resolved;
use super::engine::{impl_proxy, ConnContext, ProxyCore, ProxySnapshot};
use super::vars::Variables;

/// Response body type of both variants
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// How requests reach the target
#[derive(Debug, Clone, Copy)]
enum Upstream {
    /// Plain TCP; the inbound side negotiated `protocol`
    Plain(ProtocolType),
    /// TLCP/TLS resolved per target
    Secure,
}

/// Forwards the requests of one inbound connection
struct Forwarder {
    snapshot: Arc<ProxySnapshot>,
    stats: Arc<StatsCollector>,
    peer: SocketAddr,
    local: SocketAddr,
    upstream: Upstream,
}

impl Forwarder {
    fn new(ctx: &ConnContext, upstream: Upstream) -> Self {
        Self {
            snapshot: Arc::clone(&ctx.snapshot),
            stats: Arc::clone(&ctx.stats),
            peer: ctx.peer,
            local: ctx.local,
            upstream,
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        self.stats.increment_requests();
        let started = Instant::now();
        let method = req.method().clone();
        let uri = req.uri().clone();

        match self.forward(req).await {
            Ok(response) => {
                self.stats.record_latency(started.elapsed());
                debug!(
                    "[{}] {} {} {} -> {}",
                    self.snapshot.config().name,
                    self.peer,
                    method,
                    uri,
                    response.status()
                );
                response
            }
            Err(e) => {
                self.stats.increment_errors();
                warn!("[{}] {} {} {} failed: {}", self.snapshot.config().name, self.peer, method, uri, e);
                bad_gateway(&e)
            }
        }
    }

    async fn forward(&self, mut req: Request<Incoming>) -> Result<Response<ProxyBody>> {
        let config = self.snapshot.config();

        let (vars, mut response) = match self.upstream {
            Upstream::Plain(protocol) => {
                let stream = connect_with_timeout(&config.target, config.timeout.dial()).await?;
                let vars = self.prepare(&mut req, protocol, true);
                (vars, send(stream, req).await?)
            }
            Upstream::Secure => {
                let stream = dial_resolved(&self.snapshot, &config.target).await?;
                let vars = self.prepare(&mut req, stream.protocol(), false);
                (vars, send(stream, req).await?)
            }
        };

        if let Some(http) = &config.http {
            vars.apply(&http.response_headers, response.headers_mut());
        }
        Ok(response.map(|body| body.boxed()))
    }

    /// Rewrite the request for the target and return the variables used
    fn prepare(&self, req: &mut Request<Incoming>, protocol: ProtocolType, forwarded_for: bool) -> Variables {
        let config = self.snapshot.config();
        let vars = Variables::new(
            &self.peer.to_string(),
            &self.local.to_string(),
            &config.target,
            protocol.as_str(),
            &config.name,
        );

        // Absolute-form targets become origin-form
        if req.uri().scheme().is_some() {
            let path = req.uri().path_and_query().map_or("/", |p| p.as_str());
            if let Ok(uri) = path.parse::<Uri>() {
                *req.uri_mut() = uri;
            }
        }
        if !req.headers().contains_key(HOST) {
            if let Ok(host) = HeaderValue::from_str(&config.target) {
                req.headers_mut().insert(HOST, host);
            }
        }
        if forwarded_for {
            if let Ok(ip) = HeaderValue::from_str(&vars.remote_ip) {
                req.headers_mut().insert("x-forwarded-for", ip);
            }
        }
        if let Some(http) = &config.http {
            vars.apply(&http.request_headers, req.headers_mut());
        }
        vars
    }
}

/// Send one request over a fresh upstream connection
async fn send<S>(stream: S, req: Request<Incoming>) -> Result<Response<Incoming>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ProxyError::Http(format!("upstream handshake failed: {}", e)))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Upstream connection closed: {}", e);
        }
    });

    sender
        .send_request(req)
        .await
        .map_err(|e| ProxyError::Http(format!("upstream request failed: {}", e)))
}

fn bad_gateway(e: &ProxyError) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("502 Bad Gateway: {}\n", e)))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
        .headers_mut()
        .insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Run the HTTP/1.1 request loop of one inbound connection
async fn serve_requests<S>(io: S, forwarder: Forwarder) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let forwarder = Arc::new(forwarder);
    let service = service_fn(move |req| {
        let forwarder = Arc::clone(&forwarder);
        async move { Ok::<_, Infallible>(forwarder.handle(req).await) }
    });

    if let Err(e) = http1::Builder::new().serve_connection(TokioIo::new(io), service).await {
        // Clients going away mid-request end up here
        debug!("HTTP connection ended: {}", e);
    }
    Ok(())
}

async fn serve_http_server(mut conn: ProtocolConn<TcpStream>, ctx: ConnContext) -> Result<()> {
    let protocol = conn.handshake().await?;
    serve_requests(conn, Forwarder::new(&ctx, Upstream::Plain(protocol))).await
}

async fn serve_http_client(inbound: TcpStream, ctx: ConnContext) -> Result<()> {
    serve_requests(inbound, Forwarder::new(&ctx, Upstream::Secure)).await
}

/// TLCP/TLS HTTP in, plain HTTP out
#[derive(Debug)]
pub struct HttpServerProxy {
    core: ProxyCore,
}

impl HttpServerProxy {
    /// Create a stopped HTTP server proxy
    pub fn new(
        config: &InstanceConfig,
        keystores: Arc<KeyStoreManager>,
        rootcerts: Arc<RootCertManager>,
        stats: Arc<StatsCollector>,
    ) -> Result<Self> {
        Ok(Self {
            core: ProxyCore::new(config, keystores, rootcerts, stats)?,
        })
    }
}

/// Plain HTTP in, TLCP/TLS HTTP out
#[derive(Debug)]
pub struct HttpClientProxy {
    core: ProxyCore,
}

impl HttpClientProxy {
    /// Create a stopped HTTP client proxy
    pub fn new(
        config: &InstanceConfig,
        keystores: Arc<KeyStoreManager>,
        rootcerts: Arc<RootCertManager>,
        stats: Arc<StatsCollector>,
    ) -> Result<Self> {
        Ok(Self {
            core: ProxyCore::new(config, keystores, rootcerts, stats)?,
        })
    }

    /// Forget every detected target protocol
    pub fn clear_protocol_cache(&self) {
        self.core.snapshot().cache.clear();
    }

    /// Cached protocol of `target`, if still fresh
    pub fn cached_protocol(&self, target: &str) -> Option<ProtocolType> {
        self.core.snapshot().cache.get(target)
    }
}

impl HttpServerProxy {
    fn launch(&self) -> impl Future<Output = Result<()>> + Send + '_ {
        let live = self.core.live();
        self.core.start(move |listener| ProtocolListener::new(listener, live), serve_http_server)
    }
}

impl HttpClientProxy {
    fn launch(&self) -> impl Future<Output = Result<()>> + Send + '_ {
        self.core.start(|listener: TcpListener| listener, serve_http_client)
    }
}

impl_proxy!(HttpServerProxy);
impl_proxy!(HttpClientProxy);
