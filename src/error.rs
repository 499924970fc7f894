//! Contains the `Error` and `Result` types that `sessionpool` uses.

use std::sync::Arc;

use thiserror::Error;

/// The result type for all methods that can return an error in the `sessionpool` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `sessionpool` crate. The inner
/// [`ErrorKind`] is boxed to keep the type small and is the sole source of
/// truth for classifying an error.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,

    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            source: None,
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Error {
        ErrorKind::InvalidState {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn resource_exhausted(message: impl Into<String>) -> Error {
        ErrorKind::ResourceExhausted {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn canceled(message: impl Into<String>) -> Error {
        ErrorKind::Canceled {
            message: message.into(),
        }
        .into()
    }

    /// Construct an `Internal` error. Available to service implementations
    /// that need to surface a fatal backend failure through the pool.
    pub fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    /// Construct an `Unavailable` error. Service implementations use this for
    /// transient backend failures that the pool may retry.
    pub fn unavailable(message: impl Into<String>) -> Error {
        ErrorKind::Unavailable {
            message: message.into(),
        }
        .into()
    }

    /// Whether the operation that produced this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Unavailable { .. } | ErrorKind::DeadlineExceeded { .. } | ErrorKind::Io(_)
        )
    }

    /// Whether this error was caused by cancellation or shutdown.
    pub fn is_canceled(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Canceled { .. })
    }

    /// Whether this error indicates the pool was at capacity or a wait timed
    /// out.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ResourceExhausted { .. })
    }

    /// Whether this error indicates a use of the pool after shutdown.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::InvalidState { .. })
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        ErrorKind::Io(Arc::new(error)).into()
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// The pool was used after shutdown.
    #[error("{message}")]
    #[non_exhaustive]
    InvalidState { message: String },

    /// The pool was at capacity, or a wait for a session timed out.
    #[error("{message}")]
    #[non_exhaustive]
    ResourceExhausted { message: String },

    /// The operation was canceled, either explicitly or by pool shutdown.
    #[error("{message}")]
    #[non_exhaustive]
    Canceled { message: String },

    /// The service is temporarily unable to handle the request.
    #[error("The service is unavailable: {message}")]
    #[non_exhaustive]
    Unavailable { message: String },

    /// A service call exceeded its deadline.
    #[error("Deadline exceeded: {message}")]
    #[non_exhaustive]
    DeadlineExceeded { message: String },

    /// The service reported an internal failure.
    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// The service returned an error the pool cannot classify.
    #[error("Unknown error: {message}")]
    #[non_exhaustive]
    Unknown { message: String },

    /// Wrapper around [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}
