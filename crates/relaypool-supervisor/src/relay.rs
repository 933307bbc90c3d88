//! Relay transport between the supervisor and its workers.
//!
//! Frames are JSON-serialized and newline-delimited. The supervisor opens
//! every exchange with a `pid` frame carrying its own pid; the worker
//! answers with a `pid` frame carrying the worker's pid.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context as TaskContext, Poll};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::error::SupervisorError;

/// Longest accepted frame, in bytes.
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Relay transport errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Line framing failed (oversized or broken frame).
    #[error("Frame codec error: {0}")]
    Codec(#[from] LinesCodecError),

    /// A frame was not valid JSON.
    #[error("Invalid frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Peer closed the connection.
    #[error("Relay closed by peer")]
    Closed,

    /// Peer sent a frame we did not expect at this point.
    #[error("Unexpected frame: expected {expected}, got {got:?}")]
    UnexpectedFrame { expected: &'static str, got: Frame },

    /// Peer did not complete the pid handshake in time.
    #[error("Handshake timed out")]
    HandshakeTimeout,
}

/// A single relay frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Pid exchange, sent in both directions.
    Pid { pid: u32 },
    /// Opaque application payload.
    Payload { body: serde_json::Value },
    /// Ask the worker to exit.
    Stop,
}

/// Where the relay listener lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAddress {
    /// Unix domain socket path.
    Unix(PathBuf),
    /// TCP `host:port`.
    Tcp(String),
}

impl FromStr for RelayAddress {
    type Err = SupervisorError;

    /// Accepts `unix://<path>`, `tcp://<host:port>` or a bare `<host:port>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(SupervisorError::InvalidAddress(s.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let host_port = s.strip_prefix("tcp://").unwrap_or(s);
        match host_port.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self::Tcp(host_port.to_string()))
            }
            _ => Err(SupervisorError::InvalidAddress(s.to_string())),
        }
    }
}

impl fmt::Display for RelayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// Bound listening endpoint workers connect back to.
#[derive(Debug)]
pub enum RelayListener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl RelayListener {
    /// Bind to `address`. A stale unix socket file is removed first.
    pub async fn bind(address: &RelayAddress) -> Result<Self, SupervisorError> {
        let bind_err = |source| SupervisorError::Bind {
            address: address.to_string(),
            source,
        };

        match address {
            RelayAddress::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path).map_err(bind_err)?;
                }
                let listener = UnixListener::bind(path).map_err(bind_err)?;
                Ok(Self::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            RelayAddress::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
                Ok(Self::Tcp(listener))
            }
        }
    }

    /// The address workers should dial, with any ephemeral port resolved.
    pub fn local_address(&self) -> io::Result<RelayAddress> {
        match self {
            Self::Unix { path, .. } => Ok(RelayAddress::Unix(path.clone())),
            Self::Tcp(listener) => Ok(RelayAddress::Tcp(listener.local_addr()?.to_string())),
        }
    }

    /// Accept the next worker connection.
    pub async fn accept(&self) -> io::Result<RelayStream> {
        match self {
            Self::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(RelayStream::Unix(stream))
            }
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(RelayStream::Tcp(stream))
            }
        }
    }
}

impl Drop for RelayListener {
    fn drop(&mut self) {
        if let Self::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(path.as_path()) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove relay socket");
                }
            }
        }
    }
}

/// A connected relay stream, unix or TCP.
#[derive(Debug)]
pub enum RelayStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Framed relay connection.
pub struct Relay {
    framed: Framed<RelayStream, LinesCodec>,
}

impl Relay {
    /// Wrap a connected stream.
    pub fn new(stream: RelayStream) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN)),
        }
    }

    /// Send one frame.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), RelayError> {
        let line = serde_json::to_string(frame)?;
        self.framed.send(line).await?;
        Ok(())
    }

    /// Receive one frame. Returns `None` on EOF.
    pub async fn recv(&mut self) -> Result<Option<Frame>, RelayError> {
        match self.framed.next().await {
            Some(line) => Ok(Some(serde_json::from_str(&line?)?)),
            None => Ok(None),
        }
    }

    /// Ask the peer for its pid.
    pub async fn fetch_pid(&mut self) -> Result<u32, RelayError> {
        self.send(&Frame::Pid {
            pid: std::process::id(),
        })
        .await?;

        match self.recv().await? {
            Some(Frame::Pid { pid }) => Ok(pid),
            Some(other) => Err(RelayError::UnexpectedFrame {
                expected: "pid",
                got: other,
            }),
            None => Err(RelayError::Closed),
        }
    }

    /// Send a payload and wait for the peer's payload reply.
    pub async fn request(
        &mut self,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, RelayError> {
        self.send(&Frame::Payload { body }).await?;

        match self.recv().await? {
            Some(Frame::Payload { body }) => Ok(body),
            Some(other) => Err(RelayError::UnexpectedFrame {
                expected: "payload",
                got: other,
            }),
            None => Err(RelayError::Closed),
        }
    }
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("stream", self.framed.get_ref())
            .finish()
    }
}

/// Dial the supervisor's relay listener.
pub async fn connect(address: &RelayAddress) -> Result<Relay, RelayError> {
    let stream = match address {
        RelayAddress::Unix(path) => RelayStream::Unix(UnixStream::connect(path).await?),
        RelayAddress::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            RelayStream::Tcp(stream)
        }
    };
    Ok(Relay::new(stream))
}

/// Worker side of the relay: answer pid requests and echo payloads.
///
/// `pid_for` receives the zero-based index of each pid request and returns
/// the pid to report. Returns when the supervisor sends `Stop` or hangs up.
pub async fn serve_worker<F>(mut relay: Relay, mut pid_for: F) -> Result<(), RelayError>
where
    F: FnMut(usize) -> u32,
{
    let mut pid_requests = 0usize;
    while let Some(frame) = relay.recv().await? {
        match frame {
            Frame::Pid { pid: supervisor } => {
                let pid = pid_for(pid_requests);
                pid_requests += 1;
                debug!(supervisor_pid = supervisor, pid, "Answering pid request");
                relay.send(&Frame::Pid { pid }).await?;
            }
            Frame::Payload { body } => {
                relay.send(&Frame::Payload { body }).await?;
            }
            Frame::Stop => {
                debug!("Stop requested by supervisor");
                return Ok(());
            }
        }
    }
    Ok(())
}
