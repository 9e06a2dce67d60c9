//! Byte transports the protocol runs over.
//!
//! The protocol only needs two things from a link: read whatever bytes are available within a
//! short bound, and write bytes. Reads are never sized to an expected frame length; a read that
//! waits for a full frame stalls forever once a byte of that frame is lost.

use std::time::Duration;

use async_trait::async_trait;
use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;

use crate::RadioError;

/// Upper bound on handing one write to the stream.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Transport: Send {
    /// Returns up to `max` bytes, waiting at most `wait`. An empty result means the link was
    /// idle for the whole wait.
    async fn read_available(&mut self, max: usize, wait: Duration) -> Result<Vec<u8>, RadioError>;

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), RadioError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for &mut T {
    async fn read_available(&mut self, max: usize, wait: Duration) -> Result<Vec<u8>, RadioError> {
        (**self).read_available(max, wait).await
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        (**self).write_all(bytes).await
    }
}

/// Transport over any async byte stream: a serial device, a serial-over-TCP bridge such as
/// ser2net, or an in-memory pipe.
pub struct StreamTransport<S> {
    stream: S,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

impl StreamTransport<TcpStream> {
    /// Connects to a serial port exported over TCP.
    pub async fn connect_tcp(addr: impl ToSocketAddrs) -> Result<Self, RadioError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_available(&mut self, max: usize, wait: Duration) -> Result<Vec<u8>, RadioError> {
        let mut buf = vec![0u8; max.max(1)];
        let n = match timeout(wait, self.stream.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => return Ok(Vec::new()),
        };
        if n == 0 {
            return Err(RadioError::Disconnected);
        }
        buf.truncate(n);
        trace!("read {} bytes", n);
        Ok(buf)
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        let stream = &mut self.stream;
        let write = async move {
            stream.write_all(bytes).await?;
            stream.flush().await
        };
        timeout(WRITE_TIMEOUT, write)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out"))??;
        trace!("wrote {} bytes", bytes.len());
        Ok(())
    }
}
