//! Error types for the proxy.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while parsing, resolving or dialing a target.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Discovery-backed target without exactly `namespace:service:port`.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Port component is not a valid TCP port.
    #[error("invalid port number: {0}")]
    InvalidPort(String),

    /// Listen address could not be parsed or resolved.
    #[error("invalid listen address {addr}: {reason}")]
    InvalidListenAddress { addr: String, reason: String },

    /// Binding the listening socket failed.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Discovery backend failed.
    #[error("failed to lookup service {namespace}/{service}: {source}")]
    Lookup {
        namespace: String,
        service: String,
        #[source]
        source: DiscoveryError,
    },

    /// Discovery returned an empty instance list.
    #[error("no instances registered for {namespace}/{service}")]
    NoInstances { namespace: String, service: String },

    /// No instance carries an address for the requested family.
    #[error("invalid response for {namespace}/{service}; neither v4 nor v6 address available")]
    NoUsableAddress { namespace: String, service: String },

    /// Name resolution of a static target failed.
    #[error("failed to resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Dialing the resolved target failed.
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// An operation exceeded the connection timeout.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// Errors raised by a discovery backend.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The Cloud Map call failed; `code` is the service error code, if any.
    #[error("discovery request failed: {message}")]
    Api {
        code: Option<String>,
        message: String,
    },

    /// An address attribute did not parse as an IP address.
    #[error("instance {instance_id}: attribute {attribute}={value:?} is not a valid address")]
    InvalidAttribute {
        instance_id: String,
        attribute: &'static str,
        value: String,
    },

    /// The directory has no such service.
    #[error("service {namespace}/{service} not found")]
    NotFound { namespace: String, service: String },

    /// Directory file could not be read.
    #[error("failed to read directory {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Malformed JSON directory or response.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed TOML directory.
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory file extension is neither `.json` nor `.toml`.
    #[error("unsupported directory format: {}", .0.display())]
    UnsupportedFormat(PathBuf),
}

impl DiscoveryError {
    /// Short reason code used as a structured log field.
    pub fn reason_code(&self) -> &'static str {
        match self {
            DiscoveryError::Api { .. } => "api_error",
            DiscoveryError::InvalidAttribute { .. } => "invalid_attribute",
            DiscoveryError::NotFound { .. } => "not_found",
            DiscoveryError::Read { .. } => "read_failed",
            DiscoveryError::Json(_) => "invalid_json",
            DiscoveryError::Toml(_) => "invalid_toml",
            DiscoveryError::UnsupportedFormat(_) => "unsupported_format",
        }
    }
}
