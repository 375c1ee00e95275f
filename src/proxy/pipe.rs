//! Data forwarding module
//!
//! This module copies data in both directions between two established streams.

use std::future::Future;
use std::io;
use std::time::Duration;

use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::common::{ProxyError, Result, Transferred};
use crate::config::InstanceConfig;

/// Copy settings of one pipe
#[derive(Debug, Clone, Copy)]
pub struct PipeOptions {
    /// Copy buffer size
    pub buffer_size: usize,
    /// Idle read timeout
    pub read_timeout: Option<Duration>,
    /// Idle write timeout
    pub write_timeout: Option<Duration>,
}

impl PipeOptions {
    /// Options taken from an instance configuration
    pub fn from_config(config: &InstanceConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            read_timeout: config.timeout.read(),
            write_timeout: config.timeout.write(),
        }
    }
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            buffer_size: crate::config::defaults::BUFFER_SIZE,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// Whether an I/O error only means the peer went away
pub fn is_normal_close(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => true,
        _ => e.to_string().to_ascii_lowercase().contains("unexpected eof"),
    }
}

async fn with_timeout<T, F>(limit: Option<Duration>, what: &str, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => timeout(limit, fut)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("{} idle for {:?}", what, limit)))?,
        None => fut.await,
    }
}

/// Copy `reader` into `writer` until end of stream, then half-close `writer`
async fn copy_direction<R, W>(reader: &mut R, writer: &mut W, count: &mut u64, options: &PipeOptions) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; options.buffer_size.max(1)];

    loop {
        let n = match with_timeout(options.read_timeout, "read", reader.read(&mut buffer)).await {
            Ok(0) => break, // Connection closed
            Ok(n) => n,
            Err(e) if is_normal_close(&e) => break,
            Err(e) => return Err(e),
        };

        match with_timeout(options.write_timeout, "write", writer.write_all(&buffer[..n])).await {
            Ok(()) => *count += n as u64,
            Err(e) if is_normal_close(&e) => return Ok(()),
            Err(e) => return Err(e),
        }
    }

    if let Err(e) = writer.shutdown().await {
        trace!("Half-close failed: {}", e);
    }
    Ok(())
}

/// Resolves once `signal` turns `true`; never resolves if its sender is gone
pub(crate) async fn cancelled(signal: &mut watch::Receiver<bool>) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            // Sender gone without a shutdown request
            std::future::pending::<()>().await;
        }
    }
}

/// Copy between `a` and `b` until both directions finished
///
/// End of stream in one direction half-closes the other side and lets the
/// opposite direction drain. Any other failure ends both directions. When
/// `cancel` turns `true` both streams are dropped, which closes them.
///
/// # Parameters
///
/// * `cancel` - Shutdown signal of the owning proxy
/// * `a` - First stream (the client side)
/// * `b` - Second stream (the target side)
/// * `options` - Buffer size and idle timeouts
///
/// # Returns
///
/// Bytes copied in each direction, or `ProxyError::Pipe` carrying the counts
/// reached before the failure.
pub async fn pipe<A, B>(mut cancel: watch::Receiver<bool>, a: A, b: B, options: PipeOptions) -> Result<Transferred>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_reader, mut a_writer) = tokio::io::split(a);
    let (mut b_reader, mut b_writer) = tokio::io::split(b);
    let mut transferred = Transferred::default();

    let outcome = {
        let a_to_b = copy_direction(&mut a_reader, &mut b_writer, &mut transferred.a_to_b, &options);
        let b_to_a = copy_direction(&mut b_reader, &mut a_writer, &mut transferred.b_to_a, &options);

        tokio::select! {
            result = async { tokio::try_join!(a_to_b, b_to_a) } => result.map(|_| ()),
            _ = cancelled(&mut cancel) => {
                debug!("Pipe cancelled by shutdown");
                Ok(())
            }
        }
    };

    debug!(
        "Pipe finished: {} bytes forward, {} bytes back",
        transferred.a_to_b, transferred.b_to_a
    );

    outcome.map(|_| transferred).map_err(|source| ProxyError::Pipe { source, transferred })
}
