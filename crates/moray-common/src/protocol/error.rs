use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::remote::{RemoteError, RemoteErrorKind};

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// The layer of the client stack an error originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLayer {
    /// No connection could be claimed from the pool
    PoolExhausted,
    /// Socket-level failure (DNS, connect, read, write, close)
    Transport,
    /// The peer violated the framing protocol
    Protocol,
    /// The request itself failed (timeout, abort)
    Request,
    /// The server reported an error
    Remote,
    /// The caller passed invalid input, or the client was misused
    Client,
}

/// Errors produced by the Moray client stack.
///
/// Errors are cheaply cloneable so that a single connection fault can be
/// delivered to every request that was in flight on that connection.
#[derive(Error, Debug, Clone)]
pub enum MorayError {
    #[error("failed to claim connection: no connections available")]
    NoConnections,

    #[error("client closed")]
    Closed,

    #[error("{context}: {message}")]
    Transport { context: String, message: String },

    #[error("failed to resolve {domain}: {message}")]
    Dns { domain: String, message: String },

    #[error("connect to {backend} timed out after {timeout_ms}ms")]
    ConnectTimeout { backend: String, timeout_ms: u64 },

    #[error("connection to {0} closed")]
    ConnectionClosed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("request aborted")]
    Aborted,

    #[error("request failed: {method}: {source}")]
    Request {
        method: String,
        #[source]
        source: Box<MorayError>,
    },

    #[error("server error: {0}")]
    Server(#[source] RemoteError),

    #[error(transparent)]
    Remote(RemoteError),

    #[error("bad server response: {0}")]
    BadResponse(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(Arc<serde_json::Error>),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MorayError {
    /// Wraps `source` as the failure of an RPC to `method`.
    pub fn request(method: impl Into<String>, source: MorayError) -> Self {
        MorayError::Request {
            method: method.into(),
            source: Box::new(source),
        }
    }

    pub fn transport(context: impl Into<String>, message: impl ToString) -> Self {
        MorayError::Transport {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Classifies the error by the layer it originated in.
    ///
    /// For wrapped request failures this reports the layer of the innermost
    /// cause, so a server error surfaced through an RPC is still `Remote`.
    pub fn layer(&self) -> ErrorLayer {
        match self {
            MorayError::NoConnections | MorayError::Closed => ErrorLayer::PoolExhausted,
            MorayError::Transport { .. }
            | MorayError::Dns { .. }
            | MorayError::ConnectTimeout { .. }
            | MorayError::ConnectionClosed(_)
            | MorayError::Io(_) => ErrorLayer::Transport,
            MorayError::Protocol(_) | MorayError::BadResponse(_) => ErrorLayer::Protocol,
            MorayError::Timeout { .. } | MorayError::Aborted => ErrorLayer::Request,
            MorayError::Request { source, .. } => source.layer(),
            MorayError::Server(_) | MorayError::Remote(_) => ErrorLayer::Remote,
            MorayError::InvalidOptions(_)
            | MorayError::InvalidArgument(_)
            | MorayError::JsonSerialization(_)
            | MorayError::Internal(_) => ErrorLayer::Client,
        }
    }

    /// Returns the server-reported error carried by this error, if any.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            MorayError::Request { source, .. } => source.remote(),
            MorayError::Server(err) | MorayError::Remote(err) => Some(err),
            _ => None,
        }
    }

    /// Searches the whole cause chain for a remote error of `kind`.
    pub fn find_remote(&self, kind: &RemoteErrorKind) -> Option<&RemoteError> {
        self.remote().and_then(|err| err.find(kind))
    }

    pub fn has_remote_cause(&self, kind: &RemoteErrorKind) -> bool {
        self.find_remote(kind).is_some()
    }

    /// Returns true if the request failed because its deadline expired.
    pub fn is_timeout(&self) -> bool {
        match self {
            MorayError::Timeout { .. } => true,
            MorayError::Request { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Strips the request and server wrappers, leaving the first cause that
    /// is not itself a wrapper.
    ///
    /// A server error becomes [`MorayError::Remote`], which displays exactly
    /// as the server reported it.
    pub fn unwrap_chain(self) -> MorayError {
        match self {
            MorayError::Request { source, .. } => source.unwrap_chain(),
            MorayError::Server(err) => MorayError::Remote(err),
            other => other,
        }
    }
}

impl From<std::io::Error> for MorayError {
    fn from(err: std::io::Error) -> Self {
        MorayError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for MorayError {
    fn from(err: serde_json::Error) -> Self {
        MorayError::JsonSerialization(Arc::new(err))
    }
}

impl From<RemoteError> for MorayError {
    fn from(err: RemoteError) -> Self {
        MorayError::Server(err)
    }
}

pub type Result<T> = std::result::Result<T, MorayError>;
