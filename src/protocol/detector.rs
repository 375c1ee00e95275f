//! Protocol detector implementation
//!
//! This module classifies a connection by examining its first record header.
//! TLCP and TLS share the record layout, so the record type tells whether a
//! handshake is starting and the record version tells which family it is.

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout_at, Instant};

use crate::config::TLCP_VERSION;
use super::types::ProtocolType;

/// Record type of a handshake record
pub const RECORD_TYPE_HANDSHAKE: u8 = 0x16;

/// Bytes needed before the header can be interpreted
pub const MIN_DETECT_BYTES: usize = 5;

/// Bytes read from the transport for classification
pub const PEEK_BYTES: usize = 6;

/// Deadline for the classification read
pub const PEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// TLS 1.0 to 1.3 record versions
const TLS_VERSIONS: [u16; 4] = [0x0301, 0x0302, 0x0303, 0x0304];

/// Classify a connection from its first bytes
///
/// # Parameters
///
/// * `data` - Bytes read from the start of the connection
///
/// # Returns
///
/// `Tlcp` for a handshake record carrying version 0x0101, `Tls` otherwise.
/// Short input and unknown record types fall back to `Tls`.
pub fn detect_protocol(data: &[u8]) -> ProtocolType {
    if data.len() < MIN_DETECT_BYTES {
        trace!("Not enough data to classify: got {} bytes, need {}", data.len(), MIN_DETECT_BYTES);
        return ProtocolType::Tls;
    }

    if data[0] != RECORD_TYPE_HANDSHAKE {
        debug!("First byte is {:#04x}, not a handshake record; assuming TLS", data[0]);
        return ProtocolType::Tls;
    }

    let version = u16::from_be_bytes([data[1], data[2]]);
    if version == TLCP_VERSION {
        ProtocolType::Tlcp
    } else {
        if !TLS_VERSIONS.contains(&version) {
            trace!("Unknown record version {:#06x}; assuming TLS", version);
        }
        ProtocolType::Tls
    }
}

/// Read the start of a connection for classification
///
/// Reads until `min` bytes arrived, the peer closed, or the deadline
/// expired, never reading more than `max` bytes. The returned bytes have been
/// consumed from the stream; the caller must replay them.
///
/// # Parameters
///
/// * `stream` - Stream to read from
/// * `min` - Bytes that end the read early
/// * `max` - Upper bound of bytes read
/// * `deadline` - Maximum time spent waiting
///
/// # Returns
///
/// The bytes read, possibly fewer than `min`
pub async fn peek_record_header<S>(stream: &mut S, min: usize, max: usize, deadline: Duration) -> io::Result<BytesMut>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(max);
    let until = Instant::now() + deadline;

    while buf.len() < min {
        let mut chunk = [0u8; PEEK_BYTES];
        let want = (max - buf.len()).min(chunk.len());
        match timeout_at(until, stream.read(&mut chunk[..want])).await {
            Ok(Ok(0)) => {
                trace!("Peer closed after {} bytes", buf.len());
                break;
            }
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!("Timeout waiting for record header ({} bytes so far)", buf.len());
                break;
            }
        }
    }

    trace!("Peeked {} bytes: {:02X?}", buf.len(), &buf[..]);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    // Helper function to create a connected pair of TCP streams
    async fn create_tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });

        let (server, _) = listener.accept().await.unwrap();
        let client = client_connect.await.unwrap();

        (client, server)
    }

    #[test]
    fn test_detect_protocol() {
        assert_eq!(detect_protocol(&[0x16, 0x01, 0x01, 0x01, 0x01, 0x00]), ProtocolType::Tlcp);
        assert_eq!(detect_protocol(&[0x16, 0x03, 0x01, 0x03, 0x01, 0x00]), ProtocolType::Tls);
        assert_eq!(detect_protocol(&[0x16, 0x03, 0x01, 0x03, 0x03, 0x00]), ProtocolType::Tls);
        assert_eq!(detect_protocol(&[0x16, 0x03]), ProtocolType::Tls);
    }

    #[test]
    fn test_short_input_is_tls() {
        for len in 0..MIN_DETECT_BYTES {
            let data = [0x16, 0x01, 0x01, 0x00, 0x10];
            assert_eq!(detect_protocol(&data[..len]), ProtocolType::Tls);
        }
    }

    #[test]
    fn test_non_handshake_is_tls() {
        // TLCP version on an alert record
        assert_eq!(detect_protocol(&[0x15, 0x01, 0x01, 0x00, 0x02, 0x02]), ProtocolType::Tls);
        assert_eq!(detect_protocol(b"GET / HTTP/1.1"), ProtocolType::Tls);
        assert_eq!(detect_protocol(&[0x16, 0x02, 0x00, 0x00, 0x10]), ProtocolType::Tls);
    }

    #[tokio::test]
    async fn test_peek_record_header() {
        let (mut client, mut server) = create_tcp_pair().await;

        // TLCP ClientHello header followed by handshake bytes
        client
            .write_all(&[0x16, 0x01, 0x01, 0x00, 0x31, 0x01, 0x00, 0x00, 0x2d])
            .await
            .unwrap();

        let header = peek_record_header(&mut server, MIN_DETECT_BYTES, PEEK_BYTES, Duration::from_millis(500))
            .await
            .unwrap();

        assert!(header.len() >= MIN_DETECT_BYTES && header.len() <= PEEK_BYTES);
        assert_eq!(detect_protocol(&header), ProtocolType::Tlcp);
    }

    #[tokio::test]
    async fn test_peek_times_out_with_partial_data() {
        let (mut client, mut server) = create_tcp_pair().await;
        client.write_all(&[0x16, 0x03]).await.unwrap();

        let header = peek_record_header(&mut server, MIN_DETECT_BYTES, PEEK_BYTES, Duration::from_millis(50))
            .await
            .unwrap();

        assert_eq!(&header[..], &[0x16, 0x03]);
        assert_eq!(detect_protocol(&header), ProtocolType::Tls);
    }

    #[tokio::test]
    async fn test_peek_stops_at_eof() {
        let (mut client, mut server) = create_tcp_pair().await;
        client.write_all(&[0x16]).await.unwrap();
        client.shutdown().await.unwrap();

        let header = peek_record_header(&mut server, MIN_DETECT_BYTES, PEEK_BYTES, PEEK_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(header.len(), 1);
    }
}
