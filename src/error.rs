//! Error types for the shadow gateway.
//!
//! Every fallible operation in the crate returns [`GatewayError`]. The variants
//! follow the gateway's failure taxonomy:
//!
//! - **Decode anomalies**: malformed frames, truncated payloads, checksum
//!   mismatches. These are never fatal; the dispatcher logs them and records
//!   the raw bytes for later protocol analysis.
//! - **Correlation timeouts**: no reply arrived for an awaited command sequence.
//! - **Upstream failures**: DNS or connection failures talking to the vendor
//!   cloud. The HTTP proxy maps these to a gateway-style response.
//! - **Invariant violations**: duplicate waiter registration, malformed
//!   configuration. Fatal at startup only.
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use shadowgate::GatewayError;
//!
//! let error = GatewayError::upstream_unavailable("api.example.com", "connection refused");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for gateway operations.
pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Main error type for gateway operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Decode error in {context}: {details}")]
    Decode { context: String, details: String },

    #[error("Truncated {context}: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated { context: String, offset: usize, needed: usize, available: usize },

    #[error("Frame checksum mismatch: expected {expected:#06x}, found {found:#06x}")]
    Checksum { expected: u16, found: u16 },

    #[error("No reply for device {device_id:#010x} sequence {sequence:#04x} after {duration:?}")]
    Timeout { device_id: u32, sequence: u8, duration: Duration },

    #[error("Upstream {host} unavailable: {reason}")]
    Upstream {
        host: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Device {device_id:#010x} has no known peer address")]
    NoPeer { device_id: u32 },

    #[error("Invariant violated: {reason}")]
    Invariant { reason: String },

    #[error("Configuration error: {reason}")]
    Config {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Persistence failure in {operation}: {reason}")]
    Persistence { operation: String, reason: String },

    #[error("I/O error: {context}")]
    Io {
        context: String,
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    #[error("Gateway is shut down")]
    Closed,
}

impl GatewayError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Timeout { .. } => true,
            GatewayError::Upstream { .. } => true,
            GatewayError::NoPeer { .. } => true,
            GatewayError::Persistence { .. } => true,
            GatewayError::Io { .. } => true,
            GatewayError::Decode { .. } => false,
            GatewayError::Truncated { .. } => false,
            GatewayError::Checksum { .. } => false,
            GatewayError::Invariant { .. } => false,
            GatewayError::Config { .. } => false,
            GatewayError::Closed => false,
        }
    }

    /// Returns whether this error describes peer input the protocol model does
    /// not understand, as opposed to a failure of the gateway itself.
    pub fn is_anomaly(&self) -> bool {
        matches!(
            self,
            GatewayError::Decode { .. }
                | GatewayError::Truncated { .. }
                | GatewayError::Checksum { .. }
        )
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            GatewayError::Decode { .. }
            | GatewayError::Truncated { .. }
            | GatewayError::Checksum { .. } => vec![
                "Inspect the unknown message log for the raw frame",
                "Compare against a capture of the same message type",
                "Extend the opcode catalogue if the message is new",
            ],
            GatewayError::Timeout { .. } => vec![
                "Check the device is online and bound to a peer address",
                "Increase the command timeout",
                "Verify the command was relayed to the right peer",
            ],
            GatewayError::NoPeer { .. } => vec![
                "Wait for the device to send a PING or STATUS",
                "Check the device is configured to use this gateway",
            ],
            GatewayError::Upstream { .. } => vec![
                "Check the upstream nameserver is reachable",
                "Verify the vendor cloud hostname still resolves",
                "Retry the request",
            ],
            GatewayError::Invariant { .. } => vec![
                "Do not register two waiters for the same command sequence",
                "Restart the gateway if the state looks inconsistent",
            ],
            GatewayError::Config { .. } => vec![
                "Check the configuration file syntax",
                "Verify every policy pattern is a valid regular expression",
            ],
            GatewayError::Persistence { .. } => vec![
                "Check the storage backend is writable",
                "Purge old records to free space",
            ],
            GatewayError::Io { .. } => vec![
                "Check the socket or file is still open",
                "Verify permissions for the listening port or capture file",
            ],
            GatewayError::Closed => vec!["Start a new gateway instance"],
        }
    }

    /// Helper constructor for decode errors.
    pub fn decode(context: impl Into<String>, details: impl Into<String>) -> Self {
        GatewayError::Decode { context: context.into(), details: details.into() }
    }

    /// Helper constructor for upstream failures.
    pub fn upstream_unavailable(host: impl Into<String>, reason: impl Into<String>) -> Self {
        GatewayError::Upstream { host: host.into(), reason: reason.into(), source: None }
    }

    /// Helper constructor for upstream failures with source.
    pub fn upstream_unavailable_with_source(
        host: impl Into<String>,
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        GatewayError::Upstream { host: host.into(), reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for invariant violations.
    pub fn invariant(reason: impl Into<String>) -> Self {
        GatewayError::Invariant { reason: reason.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        GatewayError::Config { reason: reason.into(), source: None }
    }

    /// Helper constructor for I/O errors with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        GatewayError::Io { context: context.into(), path: None, source }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        GatewayError::Io { context: format!("file {}", path.display()), path: Some(path), source }
    }

    /// Helper constructor for persistence failures.
    pub fn persistence(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        GatewayError::Persistence { operation: operation.into(), reason: reason.into() }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io { context: "<unknown>".to_string(), path: None, source: err }
    }
}

impl From<regex::Error> for GatewayError {
    fn from(err: regex::Error) -> Self {
        GatewayError::Config { reason: "invalid pattern".to_string(), source: Some(Box::new(err)) }
    }
}

impl From<serde_yaml_ng::Error> for GatewayError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        GatewayError::Config {
            reason: "invalid configuration document".to_string(),
            source: Some(Box::new(err)),
        }
    }
}
