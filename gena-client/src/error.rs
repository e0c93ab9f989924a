//! Error types for the GENA client

use thiserror::Error;
use upnp_eventing::TransportError;

/// Errors that can occur while talking to a device's event endpoint
#[derive(Debug, Error)]
pub enum GenaError {
    /// Network or HTTP communication error
    #[error("Network/HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The device answered with a non-success status
    #[error("{method} failed: HTTP {status} {reason}")]
    Status {
        method: &'static str,
        status: u16,
        reason: String,
    },

    /// A required response header was absent
    #[error("Missing {0} header in response")]
    MissingHeader(&'static str),

    /// A response header could not be interpreted
    #[error("Invalid {name} header: {value}")]
    InvalidHeader { name: &'static str, value: String },

    /// The HTTP client could not be set up
    #[error("Client configuration error: {0}")]
    Client(String),
}

impl From<GenaError> for TransportError {
    fn from(err: GenaError) -> Self {
        match err {
            GenaError::Http(e) => TransportError::Network(e.to_string()),
            GenaError::Status { status, reason, .. } => {
                TransportError::RejectedByRemote { status, reason }
            }
            GenaError::MissingHeader(_) | GenaError::InvalidHeader { .. } => {
                TransportError::Protocol(err.to_string())
            }
            GenaError::Client(msg) => TransportError::Network(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_maps_to_rejection() {
        let err = GenaError::Status {
            method: "SUBSCRIBE",
            status: 412,
            reason: "Precondition Failed".to_string(),
        };
        assert_eq!(err.to_string(), "SUBSCRIBE failed: HTTP 412 Precondition Failed");
        assert_eq!(
            TransportError::from(err),
            TransportError::RejectedByRemote {
                status: 412,
                reason: "Precondition Failed".to_string(),
            }
        );
    }

    #[test]
    fn test_header_errors_are_protocol_errors() {
        let err = TransportError::from(GenaError::MissingHeader("SID"));
        assert_eq!(
            err,
            TransportError::Protocol("Missing SID header in response".to_string())
        );

        let err = TransportError::from(GenaError::InvalidHeader {
            name: "TIMEOUT",
            value: "forever".to_string(),
        });
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}
