//! Error types for `WireGuard` device operations.

use thiserror::Error;

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, WireGuardError>;

/// Errors that can occur while reading or configuring a `WireGuard` device.
#[derive(Debug, Error)]
pub enum WireGuardError {
    /// Invalid key format.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid base64 encoding.
    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(String),

    /// Invalid key length.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// Invalid CIDR notation.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// The named interface does not exist.
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    /// The device control plane rejected or failed an operation.
    #[error("interface error: {0}")]
    InterfaceError(String),
}

impl From<base64::DecodeError> for WireGuardError {
    fn from(e: base64::DecodeError) -> Self {
        Self::InvalidBase64(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_length_display() {
        let err = WireGuardError::InvalidKeyLength(16);
        assert_eq!(err.to_string(), "invalid key length: expected 32, got 16");
    }

    #[test]
    fn interface_not_found_display() {
        let err = WireGuardError::InterfaceNotFound("wg0".to_string());
        assert_eq!(err.to_string(), "interface not found: wg0");
    }
}
