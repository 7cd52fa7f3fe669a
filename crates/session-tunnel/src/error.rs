//! Error types for the tunnel lifecycle

use thiserror::Error;

/// Boxed error used at the collaborator seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Reference for the key formats accepted by the connect-authorization API.
pub const SEND_PUBLIC_KEY_DOCS: &str =
    "https://docs.aws.amazon.com/ec2-instance-connect/latest/APIReference/API_SendSSHPublicKey.html";

/// Local port allocation errors
#[derive(Debug, Error)]
pub enum PortError {
    #[error("invalid port range {min}-{max}")]
    InvalidRange { min: u16, max: u16 },

    #[error("port {port} is unavailable: {source}")]
    Unavailable {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("no available port in range {min}-{max}")]
    NoPortAvailable { min: u16, max: u16 },
}

/// Tunnel lifecycle errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("error finding an available port to initiate a session tunnel: {0}")]
    PortAllocation(#[from] PortError),

    #[error("error encountered in obtaining target instance id for session tunnel")]
    MissingInstance,

    #[error("error getting public key from private key: {0}")]
    KeyDerivation(String),

    #[error("{message}\nCheck the key type and length are valid in AWS API.\n{SEND_PUBLIC_KEY_DOCS}")]
    KeyDelivery {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("session transport error: {0}")]
    Transport(String),

    #[error("tunnel start cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl TunnelError {
    /// Returns true if this represents a requested stop rather than a fault
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TunnelError::Cancelled)
    }

    pub(crate) fn key_delivery(message: impl Into<String>, source: Option<BoxError>) -> Self {
        TunnelError::KeyDelivery {
            message: message.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_cancelled_is_distinguishable() {
        assert!(TunnelError::Cancelled.is_cancelled());
        assert!(!TunnelError::MissingInstance.is_cancelled());
        assert!(!TunnelError::Transport("boom".into()).is_cancelled());
    }

    #[test]
    fn test_key_delivery_points_at_api_docs() {
        let err = TunnelError::key_delivery(
            "error encountered in sending public key to instance",
            Some("connection reset".into()),
        );
        let message = err.to_string();

        assert!(message.contains("sending public key"));
        assert!(message.contains(SEND_PUBLIC_KEY_DOCS));
        assert_eq!(err.source().unwrap().to_string(), "connection reset");
    }

    #[test]
    fn test_port_error_wraps_into_tunnel_error() {
        let err: TunnelError = PortError::NoPortAvailable {
            min: 8000,
            max: 9000,
        }
        .into();

        assert!(matches!(err, TunnelError::PortAllocation(_)));
        assert!(err.to_string().contains("8000-9000"));
    }
}
