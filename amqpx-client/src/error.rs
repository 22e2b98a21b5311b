//! Client error types.

use amqpx_protocol::{AmqpError, ErrorCondition, ProtocolError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Client errors.
///
/// `Clone` so that a connection's terminal error can be handed to every
/// pending operation.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    TransportConnect(String),

    #[error("TLS verification failed: {0}")]
    TlsVerification(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("frame decode error: {0}")]
    FrameDecode(#[from] ProtocolError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("remote error: {0}")]
    Remote(AmqpError),

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("link detached: {0}")]
    LinkDetached(String),

    #[error("session ended")]
    SessionEnded,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("SASL authentication failed: {0}")]
    Sasl(String),

    #[error("operation timed out")]
    Timeout,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(Arc::new(err))
    }
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::TransportConnect(_) => true,
            ClientError::ConnectTimeout(_) => true,
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::DeliveryFailed(_) => true,
            ClientError::Remote(error) => error.condition.is_transient(),
            _ => false,
        }
    }

    /// Returns the condition to report to the peer when this error ends
    /// the connection.
    pub(crate) fn condition(&self) -> ErrorCondition {
        match self {
            ClientError::FrameDecode(_) => ErrorCondition::FramingError,
            ClientError::ProtocolViolation(_) => ErrorCondition::NotAllowed,
            ClientError::Remote(error) => error.condition.clone(),
            _ => ErrorCondition::InternalError,
        }
    }
}
