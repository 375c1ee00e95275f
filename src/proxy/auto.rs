//! Protocol-classifying listener and connection
//!
//! A [`ProtocolListener`] hands out [`ProtocolConn`]s that run the server
//! handshake of the adapter's declared protocol. In `auto` mode the
//! connection first reads the record header, picks TLCP or TLS from it and
//! replays those bytes into the chosen handshake.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use arc_swap::ArcSwap;
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_openssl::SslStream;

use crate::common::{ProxyError, Result};
use crate::protocol::{detect_protocol, peek_record_header, ProtocolType, Rewind, MIN_DETECT_BYTES, PEEK_BYTES, PEEK_TIMEOUT};
use super::adapter::TlcpAdapter;
use super::engine::ProxySnapshot;

/// Where a listener takes the adapter for each accepted connection
pub trait AdapterSource: Send + Sync + 'static {
    /// Adapter to use for the next connection
    fn adapter(&self) -> Arc<TlcpAdapter>;
}

impl AdapterSource for Arc<TlcpAdapter> {
    fn adapter(&self) -> Arc<TlcpAdapter> {
        Arc::clone(self)
    }
}

impl AdapterSource for Arc<ArcSwap<ProxySnapshot>> {
    fn adapter(&self) -> Arc<TlcpAdapter> {
        Arc::clone(&self.load().adapter)
    }
}

/// Listener yielding protocol connections
///
/// Accepting does not run any handshake; the caller drives it with
/// [`ProtocolConn::handshake`] so a slow peer never blocks the accept loop.
#[derive(Debug)]
pub struct ProtocolListener<A> {
    listener: TcpListener,
    source: A,
}

impl<A: AdapterSource> ProtocolListener<A> {
    /// Wrap a bound listener
    pub fn new(listener: TcpListener, source: A) -> Self {
        Self { listener, source }
    }

    /// Bound address
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept the next connection
    ///
    /// The connection keeps the adapter current at accept time, even if a
    /// reload swaps it afterwards.
    pub async fn accept(&self) -> io::Result<(ProtocolConn<TcpStream>, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        Ok((ProtocolConn::new(stream, self.source.adapter()), peer))
    }
}

enum State<S> {
    Unclassified(Rewind<S>),
    Classified {
        protocol: ProtocolType,
        stream: SslStream<Rewind<S>>,
    },
    Closed,
}

/// Server-side connection that classifies itself on first use
///
/// Before the handshake, reads return the raw transport (replayed header
/// first) and writes go straight to it. After the handshake both go through
/// the secured stream. A failed handshake closes the transport.
pub struct ProtocolConn<S> {
    state: State<S>,
    adapter: Arc<TlcpAdapter>,
    detected: Option<ProtocolType>,
}

impl<S> std::fmt::Debug for ProtocolConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (state, protocol) = match &self.state {
            State::Unclassified(_) => ("unclassified", None),
            State::Classified { protocol, .. } => ("classified", Some(*protocol)),
            State::Closed => ("closed", None),
        };
        f.debug_struct("ProtocolConn")
            .field("state", &state)
            .field("protocol", &protocol)
            .finish()
    }
}

impl<S> ProtocolConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a freshly accepted transport
    pub fn new(stream: S, adapter: Arc<TlcpAdapter>) -> Self {
        Self {
            state: State::Unclassified(Rewind::new(stream)),
            adapter,
            detected: None,
        }
    }

    /// Adapter this connection was accepted under
    pub fn adapter(&self) -> &Arc<TlcpAdapter> {
        &self.adapter
    }

    /// Negotiated protocol, once the handshake succeeded
    pub fn protocol(&self) -> Option<ProtocolType> {
        match &self.state {
            State::Classified { protocol, .. } => Some(*protocol),
            _ => None,
        }
    }

    /// Whether the handshake has completed
    pub fn is_classified(&self) -> bool {
        matches!(self.state, State::Classified { .. })
    }

    /// Decide which handshake to run
    ///
    /// A fixed-protocol adapter answers without reading. In `auto` mode the
    /// record header is read once (bounded by a 5 second deadline) and kept
    /// for replay; fewer than 5 bytes classify as TLS.
    pub async fn peek_protocol(&mut self) -> io::Result<ProtocolType> {
        if let Some(protocol) = self.detected.or_else(|| self.protocol()) {
            return Ok(protocol);
        }

        let protocol = match (&mut self.state, self.adapter.protocol()) {
            (State::Unclassified(_), fixed @ (ProtocolType::Tlcp | ProtocolType::Tls)) => fixed,
            (State::Unclassified(stream), ProtocolType::Auto) => {
                let header = peek_record_header(stream.get_mut(), MIN_DETECT_BYTES, PEEK_BYTES, PEEK_TIMEOUT).await?;
                let protocol = detect_protocol(&header);
                stream.rewind(header.freeze());
                protocol
            }
            (State::Classified { protocol, .. }, _) => *protocol,
            (State::Closed, _) => return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed")),
        };

        trace!("Connection classified as {}", protocol);
        self.detected = Some(protocol);
        Ok(protocol)
    }

    /// Classify (if needed) and run the server handshake
    ///
    /// Idempotent once it succeeded. The classification peek has its own
    /// deadline; the adapter's handshake timeout starts after it.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Handshake` if classification, the handshake or its
    /// deadline fails. The connection is closed afterwards.
    pub async fn handshake(&mut self) -> Result<ProtocolType> {
        if let Some(protocol) = self.protocol() {
            return Ok(protocol);
        }

        let deadline = self.adapter.handshake_timeout();
        let result = match self.peek_protocol().await {
            Ok(detected) => timeout(deadline, self.accept_as(detected))
                .await
                .unwrap_or_else(|_| Err(ProxyError::Handshake(format!("handshake timed out after {:?}", deadline)))),
            Err(e) => Err(ProxyError::Handshake(format!("classification failed: {}", e))),
        };

        match result {
            Ok(protocol) => {
                debug!("{} handshake completed", protocol);
                Ok(protocol)
            }
            Err(e) => {
                self.state = State::Closed;
                Err(e)
            }
        }
    }

    async fn accept_as(&mut self, detected: ProtocolType) -> Result<ProtocolType> {
        let adapter = Arc::clone(&self.adapter);

        // Auto mode with a single context serves whatever the peer sent
        // with the context it has.
        let (protocol, ctx) = match adapter.server_context(detected) {
            Some(ctx) => (detected, ctx),
            None => {
                let other = match detected {
                    ProtocolType::Tlcp => ProtocolType::Tls,
                    _ => ProtocolType::Tlcp,
                };
                match adapter.server_context(other) {
                    Some(ctx) if adapter.protocol() == ProtocolType::Auto => (other, ctx),
                    _ => {
                        return Err(ProxyError::Handshake(format!(
                            "no {} context configured for {}",
                            detected,
                            adapter.config().name
                        )))
                    }
                }
            }
        };

        let stream = match mem::replace(&mut self.state, State::Closed) {
            State::Unclassified(stream) => stream,
            _ => return Err(ProxyError::Handshake("connection closed".to_string())),
        };
        let stream = ctx.accept(stream).await?;
        self.state = State::Classified { protocol, stream };
        Ok(protocol)
    }

    /// Drop the transport
    pub fn close(&mut self) {
        self.state = State::Closed;
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ProtocolConn<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            State::Unclassified(stream) => Pin::new(stream).poll_read(cx, buf),
            State::Classified { stream, .. } => Pin::new(stream).poll_read(cx, buf),
            State::Closed => Poll::Ready(Ok(())),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ProtocolConn<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().state {
            State::Unclassified(stream) => Pin::new(stream).poll_write(cx, data),
            State::Classified { stream, .. } => Pin::new(stream).poll_write(cx, data),
            State::Closed => Poll::Ready(Err(closed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            State::Unclassified(stream) => Pin::new(stream).poll_flush(cx),
            State::Classified { stream, .. } => Pin::new(stream).poll_flush(cx),
            State::Closed => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            State::Unclassified(stream) => Pin::new(stream).poll_shutdown(cx),
            State::Classified { stream, .. } => Pin::new(stream).poll_shutdown(cx),
            State::Closed => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstanceConfig, InstanceType, KeyStoreConfig, ProtocolSettings};
    use crate::security::testutil::{tlcp_keystore, tls_keystore};
    use crate::security::{KeyStoreManager, RootCertManager, RootCertPool};
    use crate::tls::build_tls_client;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn server_adapter(protocol: ProtocolType) -> (Arc<TlcpAdapter>, RootCertPool) {
        let keystores = KeyStoreManager::new();
        let (ca, keystore) = tls_keystore("site");
        keystores.register(keystore);

        let mut config = InstanceConfig::new("auto-test", InstanceType::Server, "127.0.0.1:0", "127.0.0.1:9");
        config.protocol = protocol;
        config.tls.keystore = Some(KeyStoreConfig::named("site"));
        let adapter = TlcpAdapter::build(&config, &keystores, &RootCertManager::new()).unwrap();
        (Arc::new(adapter), RootCertPool::new(vec![ca]))
    }

    /// Auto adapter holding both a TLS keystore and a TLCP keystore
    fn dual_adapter() -> Arc<TlcpAdapter> {
        let keystores = KeyStoreManager::new();
        keystores.register(tls_keystore("site").1);
        keystores.register(tlcp_keystore("gm").1);

        let mut config = InstanceConfig::new("dual-test", InstanceType::Server, "127.0.0.1:0", "127.0.0.1:9");
        config.tls.keystore = Some(KeyStoreConfig::named("site"));
        config.tlcp.keystore = Some(KeyStoreConfig::named("gm"));
        Arc::new(TlcpAdapter::build(&config, &keystores, &RootCertManager::new()).unwrap())
    }

    /// Feed a record header plus a truncated ClientHello and return the handshake error
    async fn handshake_error(version: [u8; 2]) -> String {
        let (mut near, far) = tokio::io::duplex(1024);
        let mut conn = ProtocolConn::new(far, dual_adapter());
        near.write_all(&[0x16, version[0], version[1], 0x00, 0x05, 0x01, 0x00, 0x00, 0x01, 0x00])
            .await
            .unwrap();

        let err = conn.handshake().await.unwrap_err();
        assert!(!conn.is_classified());
        match err {
            ProxyError::Handshake(msg) => msg,
            other => panic!("expected handshake error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tlcp_header_dispatches_to_tlcp_context() {
        let msg = handshake_error([0x01, 0x01]).await;
        assert!(msg.to_lowercase().contains("tlcp"), "{}", msg);
        #[cfg(not(feature = "ntls"))]
        assert_eq!(msg, crate::tls::ntls::UNAVAILABLE_REASON);
    }

    #[tokio::test]
    async fn test_tls_header_dispatches_to_tls_context() {
        let msg = handshake_error([0x03, 0x01]).await;
        assert!(msg.starts_with("tls accept failed"), "{}", msg);
    }

    #[cfg(feature = "ntls")]
    #[tokio::test]
    async fn test_auto_listener_serves_tlcp() {
        use crate::security::testutil::sm2_tlcp_keystore;
        use crate::tls::build_tlcp_client;

        let keystores = KeyStoreManager::new();
        let (ca, keystore) = sm2_tlcp_keystore("gm");
        keystores.register(keystore);
        let mut config = InstanceConfig::new("tlcp-test", InstanceType::Server, "127.0.0.1:0", "127.0.0.1:9");
        config.tlcp.keystore = Some(KeyStoreConfig::named("gm"));
        let adapter = Arc::new(TlcpAdapter::build(&config, &keystores, &RootCertManager::new()).unwrap());

        let listener = adapter.wrap_listener(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let protocol = conn.handshake().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
            conn.shutdown().await.ok();
            protocol
        });

        let pool = RootCertPool::new(vec![ca]);
        let client = build_tlcp_client(&ProtocolSettings::default(), None, Some(&pool)).unwrap();
        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut stream = client.connect("localhost", tcp).await.unwrap();
        stream.write_all(b"sm4cb").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"sm4cb");

        assert_eq!(server.await.unwrap(), ProtocolType::Tlcp);
    }

    #[tokio::test]
    async fn test_auto_listener_serves_tls() {
        let (adapter, pool) = server_adapter(ProtocolType::Auto);
        let listener = adapter.wrap_listener(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            assert_eq!(conn.protocol(), None);
            let protocol = conn.handshake().await.unwrap();
            // Second call is a no-op
            assert_eq!(conn.handshake().await.unwrap(), protocol);

            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
            conn.shutdown().await.ok();
            protocol
        });

        let client = build_tls_client(&ProtocolSettings::default(), None, Some(&pool)).unwrap();
        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut stream = client.connect("localhost", tcp).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        assert_eq!(server.await.unwrap(), ProtocolType::Tls);
    }

    #[tokio::test]
    async fn test_garbage_fails_handshake_and_closes() {
        let (adapter, _) = server_adapter(ProtocolType::Auto);
        let (mut near, far) = tokio::io::duplex(256);
        let mut conn = ProtocolConn::new(far, adapter);

        near.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(conn.peek_protocol().await.unwrap(), ProtocolType::Tls);

        assert!(matches!(conn.handshake().await, Err(ProxyError::Handshake(_))));
        assert!(!conn.is_classified());

        let mut buf = [0u8; 1];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert!(conn.write_all(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_unclassified_reads_replay_header() {
        let (adapter, _) = server_adapter(ProtocolType::Auto);
        let (mut near, far) = tokio::io::duplex(256);
        let mut conn = ProtocolConn::new(far, adapter);

        near.write_all(&[0x16, 0x01, 0x01, 0x00, 0x05, 0xAA, 0xBB]).await.unwrap();
        assert_eq!(conn.peek_protocol().await.unwrap(), ProtocolType::Tlcp);

        let mut buf = [0u8; 7];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x16, 0x01, 0x01, 0x00, 0x05, 0xAA, 0xBB]);

        conn.write_all(b"raw").await.unwrap();
        let mut out = [0u8; 3];
        near.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"raw");
    }

    #[tokio::test]
    async fn test_handshake_deadline_starts_after_peek() {
        let keystores = KeyStoreManager::new();
        keystores.register(tls_keystore("site").1);
        let mut config = InstanceConfig::new("slow-peer", InstanceType::Server, "127.0.0.1:0", "127.0.0.1:9");
        config.tls.keystore = Some(KeyStoreConfig::named("site"));
        config.timeout.handshake = 1;
        let adapter = Arc::new(TlcpAdapter::build(&config, &keystores, &RootCertManager::new()).unwrap());

        let (mut near, far) = tokio::io::duplex(1024);
        let mut conn = ProtocolConn::new(far, adapter);
        let server = tokio::spawn(async move { conn.handshake().await });

        // Header arrives after the handshake timeout but within the peek deadline
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        near.write_all(&[0x16, 0x03, 0x01, 0x00, 0x05, 0x01, 0x00, 0x00, 0x01, 0x00])
            .await
            .unwrap();

        match server.await.unwrap() {
            Err(ProxyError::Handshake(msg)) => assert!(msg.starts_with("tls accept failed"), "{}", msg),
            other => panic!("expected a failed TLS handshake, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fixed_protocol_skips_peek() {
        let (adapter, _) = server_adapter(ProtocolType::Tls);
        let (_near, far) = tokio::io::duplex(64);
        let mut conn = ProtocolConn::new(far, adapter);
        assert_eq!(conn.peek_protocol().await.unwrap(), ProtocolType::Tls);
        assert_eq!(
            format!("{:?}", conn),
            "ProtocolConn { state: \"unclassified\", protocol: None }"
        );
    }
}
