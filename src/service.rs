//! The client-side surface of the remote database service that the pool
//! manages sessions for.

use futures_core::future::BoxFuture;

use crate::error::Result;

/// The identifier of a transaction pre-begun on a session. Caching one on a
/// read/write session lets the first write skip a round-trip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionId(String);

impl TransactionId {
    /// The opaque identifier assigned by the service.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TransactionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A server-side session as returned by [`SessionService::create_session`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CreatedSession {
    /// The opaque name assigned to the session by the service.
    pub name: String,
}

impl CreatedSession {
    /// Create a `CreatedSession` with the given server-assigned name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// The RPC surface the pool consumes from the database service.
///
/// All calls are cancellable by dropping the returned future. Implementations
/// report failures as crate [`Error`](crate::error::Error) values;
/// [`Error::is_retryable`](crate::error::Error::is_retryable) decides whether
/// the pool retries a failed session creation.
pub trait SessionService: Send + Sync + 'static {
    /// Create a new session in the given database.
    fn create_session(&self, database: &str) -> BoxFuture<'static, Result<CreatedSession>>;

    /// Begin a transaction on the named session, returning its id.
    fn begin_transaction(&self, session: &str) -> BoxFuture<'static, Result<TransactionId>>;

    /// Execute a SQL statement on the named session. The pool only issues the
    /// keepalive probe through this method.
    fn execute_sql(&self, session: &str, sql: &str) -> BoxFuture<'static, Result<()>>;

    /// Delete the named session. The pool treats deletion as best-effort.
    fn delete_session(&self, session: &str) -> BoxFuture<'static, Result<()>>;
}
