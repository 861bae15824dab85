//! Error types shared across the proxy

use std::io;
use thiserror::Error;

use crate::ports::PortSpecError;

/// Errors surfaced by the supervisor and its listeners
#[derive(Debug, Error)]
pub enum Error {
    /// Bad flags or a missing auth key; fatal before any session exists
    #[error("configuration error: {0}")]
    Config(String),

    /// The port specification could not be parsed
    #[error("invalid port specification: {0}")]
    PortSpec(#[from] PortSpecError),

    /// The overlay session could not be established
    #[error("failed to establish overlay session for {hostname}: {reason}")]
    NetworkSession { hostname: String, reason: String },

    /// A single listener failed to bind
    #[error("failed to listen on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The local target could not be reached or failed mid-response
    #[error("forward to localhost:{port} failed: {reason}")]
    Forward { port: u16, reason: String },

    /// A self-resolution check failed
    #[error("health check for {hostname} failed: {reason}")]
    HealthCheck { hostname: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_error_names_port() {
        let err = Error::Listen {
            port: 8080,
            source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        };
        assert!(err.to_string().contains("8080"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_port_spec_error_converts() {
        let err: Error = PortSpecError::InvalidPort("abc".to_string()).into();
        assert!(matches!(err, Error::PortSpec(_)));
        assert!(err.to_string().contains("abc"));
    }
}
