//! Transport Error Types
//!
//! One error type for every transport operation: broker connects, publishes,
//! correlated waits, fan-out and the RPC socket.

use codec::ProtocolError;
use std::net::SocketAddr;
use thiserror::Error;

/// Main transport error type
#[derive(Error, Debug)]
pub enum TransportError {
    /// Network connectivity errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection management errors
    #[error("Connection error: {message} (remote: {remote_addr:?})")]
    Connection {
        message: String,
        remote_addr: Option<SocketAddr>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Framing and serialization errors
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Missing options or routes
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Broker SDK faults
    #[error("Message queue error: {backend}: {message}")]
    MessageQueue {
        backend: String,
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A correlated wait or RPC call passed its deadline
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// A wait was abandoned because its cancellation token fired
    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    /// The reply arrived but carried no payload
    #[error("Empty response body for correlation {correlation_id}")]
    EmptyBody { correlation_id: String },

    /// Some destinations of a fan-out publish failed
    #[error("Fan-out failed: {failed} of {attempted} destinations ({})", .errors.join("; "))]
    FanoutFailed {
        attempted: usize,
        failed: usize,
        errors: Vec<String>,
    },

    /// The remote handler reported an error
    #[error("Remote error from {method}: {message}")]
    Remote { method: String, message: String },

    /// Resource exhaustion errors
    #[error("Resource exhausted: {resource}: {message}")]
    ResourceExhausted { resource: String, message: String },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source
    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Create a protocol error with source
    pub fn protocol_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Protocol {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a message queue error
    pub fn message_queue(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MessageQueue {
            backend: backend.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a message queue error with source
    pub fn message_queue_with_source(
        backend: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::MessageQueue {
            backend: backend.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn empty_body(correlation_id: impl ToString) -> Self {
        Self::EmptyBody {
            correlation_id: correlation_id.to_string(),
        }
    }

    pub fn fanout_failed(attempted: usize, errors: Vec<String>) -> Self {
        Self::FanoutFailed {
            attempted,
            failed: errors.len(),
            errors,
        }
    }

    pub fn remote(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TransportError::Network { .. } => "network",
            TransportError::Connection { .. } => "connection",
            TransportError::Protocol { .. } => "protocol",
            TransportError::Configuration { .. } => "configuration",
            TransportError::MessageQueue { .. } => "message_queue",
            TransportError::Timeout { .. } => "timeout",
            TransportError::Cancelled { .. } => "cancelled",
            TransportError::EmptyBody { .. } => "empty_body",
            TransportError::FanoutFailed { .. } => "fanout",
            TransportError::Remote { .. } => "remote",
            TransportError::ResourceExhausted { .. } => "resource_exhausted",
            TransportError::Io { .. } => "io",
        }
    }
}

// Custom Clone implementation since Box<dyn Error> doesn't implement Clone
impl Clone for TransportError {
    fn clone(&self) -> Self {
        match self {
            TransportError::Network { message, .. } => TransportError::Network {
                message: message.clone(),
                source: None, // Source errors are not cloneable, so we omit them
            },
            TransportError::Connection {
                message,
                remote_addr,
                ..
            } => TransportError::Connection {
                message: message.clone(),
                remote_addr: *remote_addr,
                source: None,
            },
            TransportError::Protocol { message, .. } => TransportError::Protocol {
                message: message.clone(),
                source: None,
            },
            TransportError::Configuration { message, field } => TransportError::Configuration {
                message: message.clone(),
                field: field.clone(),
            },
            TransportError::MessageQueue {
                backend, message, ..
            } => TransportError::MessageQueue {
                backend: backend.clone(),
                message: message.clone(),
                source: None,
            },
            TransportError::Timeout {
                operation,
                timeout_ms,
            } => TransportError::Timeout {
                operation: operation.clone(),
                timeout_ms: *timeout_ms,
            },
            TransportError::Cancelled { operation } => TransportError::Cancelled {
                operation: operation.clone(),
            },
            TransportError::EmptyBody { correlation_id } => TransportError::EmptyBody {
                correlation_id: correlation_id.clone(),
            },
            TransportError::FanoutFailed {
                attempted,
                failed,
                errors,
            } => TransportError::FanoutFailed {
                attempted: *attempted,
                failed: *failed,
                errors: errors.clone(),
            },
            TransportError::Remote { method, message } => TransportError::Remote {
                method: method.clone(),
                message: message.clone(),
            },
            TransportError::ResourceExhausted { resource, message } => {
                TransportError::ResourceExhausted {
                    resource: resource.clone(),
                    message: message.clone(),
                }
            }
            TransportError::Io { message, source } => TransportError::Io {
                message: message.clone(),
                source: std::io::Error::new(source.kind(), message.as_str()),
            },
        }
    }
}

/// Convert standard I/O errors to transport errors
impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Io {
            message: error.to_string(),
            source: error,
        }
    }
}

/// Framing errors keep their diagnostic text
impl From<ProtocolError> for TransportError {
    fn from(error: ProtocolError) -> Self {
        TransportError::protocol_with_source(error.to_string(), error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_error_construction() {
        let err = TransportError::network("Connection refused");
        assert_eq!(err.category(), "network");
    }

    #[test]
    fn test_connection_error() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 4)), 4222);
        let err = TransportError::connection("Handshake failed", Some(addr));

        match err {
            TransportError::Connection { remote_addr, .. } => {
                assert_eq!(remote_addr, Some(addr));
            }
            _ => panic!("Expected Connection error"),
        }
    }

    #[test]
    fn test_framing_and_configuration_categories() {
        let framing: TransportError = ProtocolError::message_too_small(16, 3, "typed frame header").into();
        assert_eq!(framing.category(), "protocol");
        assert!(framing.to_string().contains("need 16 bytes"));

        let config = TransportError::configuration("no send routes", Some("routes"));
        assert_eq!(config.category(), "configuration");
    }

    #[test]
    fn test_timeout_and_cancel_are_distinct() {
        let timeout = TransportError::timeout("receive", 20_000);
        let cancelled = TransportError::cancelled("receive");

        assert_eq!(timeout.category(), "timeout");
        assert_eq!(cancelled.category(), "cancelled");
    }

    #[test]
    fn test_fanout_lists_every_failure() {
        let err = TransportError::fanout_failed(
            3,
            vec!["mem://b/replies: boom".into(), "mem://c/replies: down".into()],
        );
        let text = err.to_string();
        assert!(text.contains("2 of 3"));
        assert!(text.contains("boom"));
        assert!(text.contains("down"));

        match err.clone() {
            TransportError::FanoutFailed { failed, .. } => assert_eq!(failed, 2),
            _ => panic!("Expected FanoutFailed"),
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "test");
        let transport_err = TransportError::from(io_err);

        match transport_err.clone() {
            TransportError::Io { message, source } => {
                assert!(message.contains("test"));
                assert_eq!(source.kind(), std::io::ErrorKind::ConnectionRefused);
            }
            _ => panic!("Expected Io error"),
        }
    }
}
