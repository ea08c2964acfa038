use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

use crate::protocol::error::{MorayError, Result};
use crate::protocol::Message;
use crate::transport::codec::{JsonCodec, MAX_MESSAGE_SIZE};

/// Async TCP transport for Moray frames.
///
/// # Wire Protocol
///
/// Messages are sent with a 4-byte length prefix (big-endian u32) followed
/// by the JSON-encoded frame:
///
/// ```text
/// [4-byte length] [JSON data]
/// ```
///
/// # Example
///
/// ```no_run
/// use moray_common::transport::TcpTransport;
/// use moray_common::Message;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr = "127.0.0.1:2020".parse()?;
/// let mut stream = TcpTransport::connect(addr, Duration::from_secs(2)).await?;
///
/// TcpTransport::write_frame(&mut stream, &Message::request(1, "ping", vec![])).await?;
/// while let Some(frame) = TcpTransport::read_frame(&mut stream).await? {
///     if frame.is_terminal() {
///         break;
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct TcpTransport;

impl TcpTransport {
    /// Connects to `addr` with keep-alive enabled, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`MorayError::ConnectTimeout`] if the deadline expires, or a
    /// transport error if the socket cannot be created or the peer refuses.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| Self::map_io_error(e, "creating socket"))?;

        socket
            .set_keepalive(true)
            .map_err(|e| Self::map_io_error(e, "enabling keep-alive"))?;

        match tokio::time::timeout(timeout, socket.connect(addr)).await {
            Ok(Ok(stream)) => {
                stream
                    .set_nodelay(true)
                    .map_err(|e| Self::map_io_error(e, "setting nodelay"))?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Self::map_io_error(e, &format!("connecting to {}", addr))),
            Err(_) => Err(MorayError::ConnectTimeout {
                backend: addr.to_string(),
                timeout_ms: crate::protocol::millis(timeout),
            }),
        }
    }

    /// Writes one length-prefixed frame and flushes the stream.
    pub async fn write_frame<W>(stream: &mut W, message: &Message) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = JsonCodec::encode_frame(message)?;
        Self::write_raw(stream, &frame).await
    }

    /// Writes an already encoded frame (length prefix included).
    pub async fn write_raw<W>(stream: &mut W, frame: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        stream
            .write_all(frame)
            .await
            .map_err(|e| Self::map_io_error(e, "writing frame"))?;

        stream
            .flush()
            .await
            .map_err(|e| Self::map_io_error(e, "flushing stream"))?;

        Ok(())
    }

    /// Reads one length-prefixed frame.
    ///
    /// # Returns
    ///
    /// `Ok(None)` when the peer closed the stream cleanly between frames.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The stream ends in the middle of a frame
    /// - The frame exceeds the maximum size (100 MB)
    /// - The frame body is not a valid message
    pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Message>>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            let n = stream
                .read(&mut len_buf[filled..])
                .await
                .map_err(|e| Self::map_io_error(e, "reading length prefix"))?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(MorayError::Protocol(
                    "stream ended inside a length prefix".to_string(),
                ));
            }
            filled += n;
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(MorayError::Protocol(format!(
                "Message too large: {} bytes (max {} bytes)",
                len, MAX_MESSAGE_SIZE
            )));
        }

        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                MorayError::Protocol("stream ended inside a frame".to_string())
            } else {
                Self::map_io_error(e, "reading data")
            }
        })?;

        JsonCodec::decode_message(&buf).map(Some)
    }

    /// Map IO errors to transport errors carrying the failing step.
    fn map_io_error(err: std::io::Error, context: &str) -> MorayError {
        match err.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe => {
                MorayError::transport(context, "connection lost")
            }
            _ => MorayError::transport(context, err),
        }
    }
}
