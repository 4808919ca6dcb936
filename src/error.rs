//! Error types for the DHCP server.
//!
//! Only configuration and startup failures are expected to reach `main`;
//! everything raised while handling a single datagram is logged and dropped
//! by the server loop.

/// Errors that can occur while configuring or running the server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or lease files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed DHCP packet received.
    ///
    /// Covers short packets, a bad magic cookie, and truncated or
    /// mis-sized options.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// Invalid server configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate). The server
    /// refuses to start when this is raised.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 without administrator privileges.
    #[error("Socket error: {0}")]
    Socket(String),

    /// The lease backend could not load or store rows.
    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// A specialized Result type for DHCP operations.
pub type Result<T> = std::result::Result<T, Error>;
