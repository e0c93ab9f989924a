//! Error types for the callback server

use thiserror::Error;

/// Errors that can occur while starting the callback server
#[derive(Debug, Error)]
pub enum CallbackServerError {
    #[error("No available port found in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },

    #[error("Failed to detect local IP address")]
    LocalAddressUnavailable,

    #[error("Invalid callback base URL: {0}")]
    InvalidBaseUrl(String),
}
