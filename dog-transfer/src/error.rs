use std::fmt;
use std::io;

use http::StatusCode;
use thiserror::Error;

/// Result type for transfer operations
pub type TransferResult<T> = Result<T, TransferError>;

/// Errors that can occur while moving bytes to or from the service
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Service returned status {status}")]
    Status {
        status: StatusCode,
        request_id: Option<String>,
    },

    #[error("Operation canceled")]
    Canceled,

    #[error("Operation deadline exceeded")]
    DeadlineExceeded,

    #[error("Storage backend error: {source}")]
    Backend {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransferError {
    /// Create a backend error from any error type
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            source: Box::new(error),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a status error for an unexpected service response
    pub fn status(status: StatusCode) -> Self {
        Self::Status {
            status,
            request_id: None,
        }
    }

    /// True for cancellation and deadline errors coming from an [`crate::OpContext`]
    pub fn is_context_error(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }

    /// True when the retry policy may try the operation again.
    ///
    /// Only network errors flagged temporary or timeout qualify; per-try
    /// deadlines are classified by the policy itself.
    pub fn is_retryable_network(&self) -> bool {
        match self {
            Self::Network(err) => err.is_temporary() || err.is_timeout(),
            _ => false,
        }
    }

    /// Convert into an `io::Error`, unwrapping I/O errors instead of nesting them
    pub fn into_io(self) -> io::Error {
        match self {
            Self::Io { source } => source,
            Self::Network(err) => io::Error::new(err.io_kind(), err),
            Self::DeadlineExceeded => {
                io::Error::new(io::ErrorKind::TimedOut, TransferError::DeadlineExceeded)
            }
            other => io::Error::other(other),
        }
    }
}

/// How a network failure should be treated by retrying callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Transient condition (connection reset, DNS hiccup); safe to retry
    Temporary,
    /// The network operation timed out
    Timeout,
    /// Network failure that will not go away by retrying
    Fatal,
}

/// A transport-level failure that never produced a service response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkError {
    kind: NetworkErrorKind,
    message: String,
}

impl NetworkError {
    pub fn new<S: Into<String>>(kind: NetworkErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn temporary<S: Into<String>>(message: S) -> Self {
        Self::new(NetworkErrorKind::Temporary, message)
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::new(NetworkErrorKind::Timeout, message)
    }

    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::new(NetworkErrorKind::Fatal, message)
    }

    pub fn kind(&self) -> NetworkErrorKind {
        self.kind
    }

    pub fn is_temporary(&self) -> bool {
        self.kind == NetworkErrorKind::Temporary
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == NetworkErrorKind::Timeout
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self.kind {
            NetworkErrorKind::Timeout => io::ErrorKind::TimedOut,
            NetworkErrorKind::Temporary => io::ErrorKind::ConnectionReset,
            NetworkErrorKind::Fatal => io::ErrorKind::ConnectionAborted,
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            NetworkErrorKind::Temporary => write!(f, "temporary: {}", self.message),
            NetworkErrorKind::Timeout => write!(f, "timeout: {}", self.message),
            NetworkErrorKind::Fatal => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<NetworkError> for io::Error {
    fn from(err: NetworkError) -> Self {
        io::Error::new(err.io_kind(), err)
    }
}

/// Whether a body read failure came from the network layer.
///
/// Wrapped [`NetworkError`]s always qualify; otherwise the error kind decides.
/// A truncated body (`UnexpectedEof`) is not a network error.
pub fn is_network_io_error(err: &io::Error) -> bool {
    if err
        .get_ref()
        .is_some_and(|inner| inner.downcast_ref::<NetworkError>().is_some())
    {
        return true;
    }
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
    )
}
