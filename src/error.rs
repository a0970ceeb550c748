use std::path::PathBuf;

use thiserror::Error;

use crate::proxy::socks5::Reply;

/// Unified error type for Frontgate
#[derive(Error, Debug)]
pub enum GateError {
    // Startup errors
    #[error("Port {port} already in use ({addr}): {source}")]
    Bind {
        addr: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Access denied writing {path}: {action}")]
    PermissionDenied { path: PathBuf, action: String },

    #[error("{path} has no authorizations, write one token per line")]
    MissingAuthorizations { path: PathBuf },

    // SOCKS5 handshake errors
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("No acceptable authentication method offered")]
    NoAcceptableMethod,

    #[error("Malformed SOCKS5 handshake: {0}")]
    Handshake(String),

    #[error("Unsupported SOCKS5 command: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("Unsupported SOCKS5 address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    // Dial errors
    #[error("No live tunnel endpoints")]
    NoEndpointsAvailable,

    #[error("All tunnel endpoints exhausted after {attempts} attempts")]
    AllEndpointsExhausted { attempts: usize },

    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    // Tunnel worker errors
    #[error("Tunnel worker on port {port} failed to connect: {reason}")]
    WorkerConnect { port: u16, reason: String },

    // Gateway errors
    #[error("Could not determine destination: {0}")]
    DestinationUnknown(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Cancelled by shutdown")]
    Cancelled,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Frontgate operations
pub type Result<T> = std::result::Result<T, GateError>;

impl GateError {
    /// SOCKS5 reply code sent to a client whose request failed with this error
    pub fn socks_reply(&self) -> Reply {
        match self {
            GateError::NoEndpointsAvailable | GateError::AllEndpointsExhausted { .. } => {
                Reply::HostUnreachable
            }
            GateError::UnsupportedCommand(_) => Reply::CommandNotSupported,
            GateError::UnsupportedAddressType(_) => Reply::AddressTypeNotSupported,
            GateError::ProxyConnectionFailed(_) | GateError::Timeout => Reply::HostUnreachable,
            _ => Reply::GeneralFailure,
        }
    }

    /// Whether this error must terminate the process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GateError::Bind { .. }
                | GateError::PermissionDenied { .. }
                | GateError::MissingAuthorizations { .. }
                | GateError::InvalidConfig(_)
        )
    }

    /// Map an I/O error raised while writing `path`, turning permission failures
    /// into an actionable message for the operator.
    pub fn from_write(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            GateError::PermissionDenied {
                path: path.into(),
                action: "config file not exported automatically, please run as root".to_string(),
            }
        } else {
            GateError::Io(err)
        }
    }
}

impl From<tokio_socks::Error> for GateError {
    fn from(err: tokio_socks::Error) -> Self {
        GateError::ProxyConnectionFailed(err.to_string())
    }
}

impl From<url::ParseError> for GateError {
    fn from(err: url::ParseError) -> Self {
        GateError::InvalidConfig(err.to_string())
    }
}
