use async_trait::async_trait;
use std::{io, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;

pub const DEFAULT_MAX_LINE_BYTES: usize = 512 * 1024;
const READ_CHUNK_BYTES: usize = 4096;

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused by {addr}")]
    ConnectionRefused { addr: String },
    #[error("connection attempt timed out after {0:?}")]
    ConnectionTimeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("line exceeds max size: {size} > {max}")]
    OversizedLine { size: usize, max: usize },
}

impl TransportError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionRefused { .. } => "connection_refused",
            Self::ConnectionTimeout(_) => "connection_timeout",
            Self::Network(_) | Self::OversizedLine { .. } => "network_error",
            Self::ConnectionClosed => "connection_closed",
            Self::Write(_) => "write_error",
            Self::Read(_) => "read_error",
        }
    }

    pub fn is_refused(&self) -> bool {
        matches!(self, Self::ConnectionRefused { .. })
    }
}

/// Opens line transports. The session only sees this seam so tests can
/// hand it in-memory streams.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &str, timeout: Duration) -> Result<LineTransport, TransportError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str, timeout: Duration) -> Result<LineTransport, TransportError> {
        LineTransport::connect(addr, timeout).await
    }
}

pub struct LineTransport {
    reader: LineReader,
    writer: LineWriter,
}

impl LineTransport {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, TransportError> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) if err.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(TransportError::ConnectionRefused {
                    addr: addr.to_string(),
                })
            }
            Ok(Err(err)) => return Err(TransportError::Network(err.to_string())),
            Err(_) => return Err(TransportError::ConnectionTimeout(timeout)),
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(event = "transport_nodelay_failed", addr = %addr, error = %err);
        }
        debug!(event = "transport_connected", addr = %addr);
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: LineReader::new(Box::new(read_half), DEFAULT_MAX_LINE_BYTES),
            writer: LineWriter {
                inner: Some(Box::new(write_half)),
            },
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.reader.max_line_bytes = max_line_bytes;
        self
    }

    pub fn into_split(self) -> (LineReader, LineWriter) {
        (self.reader, self.writer)
    }
}

/// Buffers partial input between calls, so a `receive_line` future can be
/// dropped (timeout, `select!`) without losing bytes.
pub struct LineReader {
    inner: BoxedRead,
    pending: Vec<u8>,
    max_line_bytes: usize,
}

impl LineReader {
    fn new(inner: BoxedRead, max_line_bytes: usize) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            max_line_bytes,
        }
    }

    pub async fn receive_line(&mut self) -> Result<String, TransportError> {
        loop {
            if let Some(line) = self.take_line()? {
                return Ok(line);
            }
            let mut chunk = [0u8; READ_CHUNK_BYTES];
            let read = self
                .inner
                .read(&mut chunk)
                .await
                .map_err(TransportError::Read)?;
            if read == 0 {
                return Err(TransportError::ConnectionClosed);
            }
            self.pending.extend_from_slice(&chunk[..read]);
        }
    }

    /// `Ok(None)` when nothing complete arrived within `limit`.
    pub async fn receive_line_within(
        &mut self,
        limit: Duration,
    ) -> Result<Option<String>, TransportError> {
        match tokio::time::timeout(limit, self.receive_line()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    fn take_line(&mut self) -> Result<Option<String>, TransportError> {
        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let frame = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            // The query interface terminates lines with "\n\r", so the
            // carriage return shows up at the start of the next frame.
            let text = String::from_utf8_lossy(&frame);
            let line = text.trim_matches(|ch| ch == '\r' || ch == '\n');
            if line.is_empty() {
                continue;
            }
            return Ok(Some(line.to_string()));
        }

        if self.pending.len() > self.max_line_bytes {
            let size = self.pending.len();
            self.pending.clear();
            return Err(TransportError::OversizedLine {
                size,
                max: self.max_line_bytes,
            });
        }
        Ok(None)
    }
}

pub struct LineWriter {
    inner: Option<BoxedWrite>,
}

impl LineWriter {
    pub async fn send_line(&mut self, text: &str) -> Result<(), TransportError> {
        let Some(writer) = self.inner.as_mut() else {
            return Err(TransportError::Write(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport closed",
            )));
        };
        if text.contains('\n') {
            return Err(TransportError::Write(io::Error::new(
                io::ErrorKind::InvalidInput,
                "line contains a newline",
            )));
        }
        let mut frame = Vec::with_capacity(text.len() + 1);
        frame.extend_from_slice(text.as_bytes());
        frame.push(b'\n');
        writer.write_all(&frame).await.map_err(TransportError::Write)?;
        writer.flush().await.map_err(TransportError::Write)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.inner.take() {
            if let Err(err) = writer.shutdown().await {
                debug!(event = "transport_shutdown_failed", error = %err);
            }
        }
    }
}
