//! Network utility functions
//!
//! This module provides utility functions for network operations.

use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use log::debug;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use super::error::{ProxyError, Result};

/// Backlog passed to `listen(2)`
const LISTEN_BACKLOG: i32 = 1024;

/// Parse a socket address
///
/// A bare `:port` form binds every interface, as in `:8443`.
///
/// # Arguments
///
/// * `addr` - The address string to parse
///
/// # Returns
///
/// The parsed `SocketAddr`
pub fn parse_socket_addr(addr: &str) -> Result<SocketAddr> {
    let addr = addr.trim();
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };

    // Try direct parsing first
    if let Ok(socket_addr) = SocketAddr::from_str(&normalized) {
        return Ok(socket_addr);
    }

    // Try using ToSocketAddrs trait
    match normalized.to_socket_addrs() {
        Ok(mut addrs) => {
            if let Some(addr) = addrs.next() {
                Ok(addr)
            } else {
                Err(ProxyError::Config(format!("Failed to parse address: {}", addr)))
            }
        }
        Err(e) => Err(ProxyError::Config(format!("Failed to parse address {}: {}", addr, e))),
    }
}

/// Split `host:port` into its parts
///
/// Bracketed IPv6 hosts lose their brackets. A string without a port is
/// returned whole with an empty port.
pub fn split_host_port(addr: &str) -> (String, String) {
    if let Ok(socket_addr) = SocketAddr::from_str(addr) {
        return (socket_addr.ip().to_string(), socket_addr.port().to_string());
    }

    match addr.rfind(':') {
        Some(idx) if idx > 0 => {
            let host = addr[..idx].trim_start_matches('[').trim_end_matches(']');
            (host.to_string(), addr[idx + 1..].to_string())
        }
        _ => (addr.to_string(), String::new()),
    }
}

/// Bind a listening socket with `SO_REUSEADDR` so a restarted instance can
/// take its port back immediately
pub fn bind_listener(addr: &str) -> Result<TcpListener> {
    let socket_addr = parse_socket_addr(addr)?;

    let bind = || -> std::io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(socket_addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&socket_addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        TcpListener::from_std(socket.into())
    };

    bind().map_err(|e| ProxyError::Listen(format!("failed to listen on {}: {}", addr, e)))
}

/// Connect to `addr` within `dial_timeout`
pub async fn connect_with_timeout(addr: &str, dial_timeout: Duration) -> Result<TcpStream> {
    debug!("Dialing {} (timeout {:?})", addr, dial_timeout);

    let stream = timeout(dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProxyError::Dial(format!("connect to {} timed out after {:?}", addr, dial_timeout)))?
        .map_err(|e| ProxyError::Dial(format!("connect to {} failed: {}", addr, e)))?;

    let _ = stream.set_nodelay(true);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_socket_addr() {
        let addr = parse_socket_addr("127.0.0.1:8080");
        assert!(addr.is_ok(), "Should be able to parse a valid address");
        assert_eq!(addr.unwrap().port(), 8080);

        let addr = parse_socket_addr(":8443").unwrap();
        assert!(addr.ip().is_unspecified());
        assert_eq!(addr.port(), 8443);

        let addr = parse_socket_addr("invalid-address");
        assert!(addr.is_err(), "Should fail to parse an invalid address");
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("10.0.0.1:443"), ("10.0.0.1".to_string(), "443".to_string()));
        assert_eq!(split_host_port("[::1]:8443"), ("::1".to_string(), "8443".to_string()));
        assert_eq!(split_host_port("example.com:80"), ("example.com".to_string(), "80".to_string()));
        assert_eq!(split_host_port("example.com"), ("example.com".to_string(), String::new()));
    }

    #[tokio::test]
    async fn test_bind_and_connect() {
        let listener = bind_listener("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = connect_with_timeout(&addr.to_string(), Duration::from_secs(1)).await;
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused_is_dial_error() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = bind_listener("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = connect_with_timeout(&format!("127.0.0.1:{}", port), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Dial(_)));
    }
}
