//! Error types for the upnp-eventing crate.

use crate::types::{ServiceKey, Sid, SubscriptionStatus};

/// Errors reported by an [`crate::EventTransport`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request could not be delivered or no response arrived
    #[error("Network error: {0}")]
    Network(String),

    /// The remote service answered with a non-2xx status
    #[error("Rejected by remote: {status} {reason}")]
    RejectedByRemote {
        /// HTTP status code
        status: u16,
        /// Reason phrase or body excerpt
        reason: String,
    },

    /// The response violated the GENA wire contract
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Errors that can occur while managing subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventingError {
    /// The service publishes no evented state variables
    #[error("Service is not evented: {0}")]
    NotEvented(ServiceKey),

    /// A SUBSCRIBE, RENEW or UNSUBSCRIBE exchange failed
    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// A request referenced a SID that is no longer tracked
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(Sid),

    /// The remote service rejected the request
    #[error("Rejected by remote: {status} {reason}")]
    RejectedByRemote {
        /// HTTP status code
        status: u16,
        /// Reason phrase or body excerpt
        reason: String,
    },

    /// A subscription was asked to do something its state does not allow
    #[error("Cannot {operation} a subscription in state {state}")]
    InvalidTransition {
        /// State the subscription was in
        state: SubscriptionStatus,
        /// The attempted operation
        operation: &'static str,
    },

    /// No local HTTP server root is available for the callback URL
    #[error("No callback root available for {0}")]
    NoCallbackRoot(ServiceKey),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The manager has been shut down and accepts no new subscriptions
    #[error("Subscription manager is shut down")]
    ShutDown,
}

impl From<TransportError> for EventingError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::RejectedByRemote { status, reason } => {
                EventingError::RejectedByRemote { status, reason }
            }
            other => EventingError::Transport(other),
        }
    }
}

/// Errors raised while parsing an inbound NOTIFY request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    /// A required GENA header was absent
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    /// A GENA header carried an unexpected value
    #[error("Invalid {name} header: {value}")]
    InvalidHeader {
        /// Header name
        name: &'static str,
        /// The value received
        value: String,
    },

    /// The SEQ header was not an unsigned 32-bit integer
    #[error("Invalid sequence number: {0}")]
    InvalidSequence(String),

    /// The body was not a well-formed property set
    #[error("Invalid event body: {0}")]
    InvalidBody(String),
}

/// Convenience type alias for Results using EventingError.
pub type Result<T> = std::result::Result<T, EventingError>;
