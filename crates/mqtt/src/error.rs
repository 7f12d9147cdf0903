//! Error handling for broker operations.
//!
//! `TransferError` is the single error type returned by this crate. It
//! covers invalid configuration, queueing failures and failed connection
//! attempts so callers can decide per variant whether the failure is worth
//! retrying on the next trigger.
//!
//! # Usage
//!
//! ```ignore
//! match manager.connect(options).await {
//!     Ok(instance) => instance,
//!     Err(TransferError::ConnectTimeout(secs)) => {
//!         warn!("Broker did not answer within {secs}s, will retry later");
//!         return;
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use thiserror::Error;

/// The unified error type for broker operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Configuration validation failed.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// The local client could not queue a request (channel closed, client
    /// shut down).
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// No CONNACK arrived within the configured connection timeout.
    #[error("Timed out after {0}s waiting for the broker to accept the connection")]
    ConnectTimeout(u64),

    /// The delivery loop stopped before the connection was established.
    #[error("Connection closed before it was established: {0}")]
    ConnectionClosed(String),

    /// The session has already been shut down.
    #[error("Session is not connected")]
    NotConnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_closed_display() {
        let err = TransferError::ConnectionClosed("refused".into());
        assert_eq!(
            err.to_string(),
            "Connection closed before it was established: refused"
        );
    }

    #[test]
    fn test_connect_timeout_display() {
        let err = TransferError::ConnectTimeout(30);
        assert!(err.to_string().contains("30s"));
    }

    #[test]
    fn test_transfer_error_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(TransferError::NotConnected);
        assert_eq!(err.to_string(), "Session is not connected");
    }
}
