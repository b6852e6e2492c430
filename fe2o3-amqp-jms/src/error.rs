//! Errors returned by the messaging layer

use crate::{resolver::EndpointKind, transport::TransportError};

/// Errors associated with the connection, session, producer and consumer handles as well as the
/// directory resolver
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The broker rejected the credentials during the open handshake
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Socket, TLS or framing error. The connection is unusable afterwards
    #[error("Transport failed: {0}")]
    TransportFailed(String),

    /// The broker returned a negative outcome for a persistent send
    #[error("Broker rejected the delivery: {0}")]
    BrokerRejected(String),

    /// The symbolic name has no entry in the directory
    #[error("Name {0:?} is not bound in the directory")]
    NotFound(String),

    /// The directory entry is not of the requested kind
    #[error("Name {name:?} is bound to a {found:?}, not a {expected:?}")]
    TypeMismatch {
        /// Symbolic name that was looked up
        name: String,
        /// The kind requested by the caller
        expected: EndpointKind,
        /// The kind declared by the entry
        found: EndpointKind,
    },

    /// Send on an unbound producer without an explicit destination
    #[error("Producer has no destination and none was given")]
    UnresolvedDestination,

    /// Mixing synchronous receive and an asynchronous listener on one consumer
    #[error("Illegal consumer mode: {0}")]
    IllegalMode(&'static str),

    /// The operation is not available on this handle
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// The destination cannot be used from this connection
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// The connection is closed, or was closed while the operation was pending
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The session is closed, or was closed while the operation was pending
    #[error("Session is closed")]
    SessionClosed,

    /// The consumer is closed, or was closed while the operation was pending
    #[error("Consumer is closed")]
    ConsumerClosed,

    /// The producer is closed
    #[error("Producer is closed")]
    ProducerClosed,

    /// The caller interrupted a pending receive, see [`Consumer::receive_interruptible`](crate::Consumer::receive_interruptible)
    #[error("Operation interrupted")]
    Interrupted,

    /// The connection url cannot be parsed
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),

    /// The configuration source is malformed or unreadable
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Authentication(description) => Self::AuthenticationFailed(description),
            TransportError::ConnectionLost(description) => Self::TransportFailed(description),
            TransportError::Detached(description) => Self::TransportFailed(description),
            TransportError::Rejected(description) => Self::BrokerRejected(description),
            TransportError::NotFound(address) => {
                Self::InvalidDestination(format!("{} is not known to the broker", address))
            }
        }
    }
}

impl Error {
    /// Whether this is one of the `*Closed` terminal errors
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed
                | Error::SessionClosed
                | Error::ConsumerClosed
                | Error::ProducerClosed
        )
    }
}

/// A specialized `Result` type for the messaging layer
pub type Result<T, E = Error> = std::result::Result<T, E>;
