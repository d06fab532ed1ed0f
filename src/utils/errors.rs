//! Error types and handling for the peerway overlay.
//!
//! Every component reports failures through [`PeerwayError`]. Remote input
//! never produces a panic: protocol violations surface as [`ProtocolError`]
//! values that callers log and drop.

use thiserror::Error;

/// Result type alias for the peerway library
pub type Result<T> = std::result::Result<T, PeerwayError>;

/// Top-level error type for all peerway operations
#[derive(Error, Debug, Clone)]
pub enum PeerwayError {
    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Network and transport layer errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Signaling relay errors
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Peer channel state errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Configuration and I/O errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Protocol-level errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Persistence errors reported by a `Database` implementation
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Base64 encoding/decoding errors
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Generic error for unexpected conditions
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey {
        /// What went wrong
        reason: String,
    },

    /// Encryption operation failure
    #[error("Encryption failed: {reason}")]
    Encryption {
        /// What went wrong
        reason: String,
    },

    /// Decryption operation failure
    #[error("Decryption failed: {reason}")]
    Decryption {
        /// What went wrong
        reason: String,
    },

    /// Key derivation failure
    #[error("Key derivation failed: {reason}")]
    KeyDerivation {
        /// What went wrong
        reason: String,
    },

    /// No certificate has been issued to or received from the peer
    #[error("No certificate for peer {peer_id}")]
    MissingCertificate {
        /// Peer the operation targeted
        peer_id: String,
    },
}

/// Network and transport layer errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Connection establishment failure
    #[error("Connection failed to {peer}: {reason}")]
    ConnectionFailed {
        /// Address or id that was dialed
        peer: String,
        /// What went wrong
        reason: String,
    },

    /// Negotiation transport error
    #[error("Transport error: {reason}")]
    Transport {
        /// What went wrong
        reason: String,
    },

    /// Timeout during network operation
    #[error("Network timeout: {operation}")]
    Timeout {
        /// Operation that ran out of time
        operation: String,
    },

    /// Invalid network address
    #[error("Invalid address: {address}")]
    InvalidAddress {
        /// Address as given
        address: String,
    },

    /// The relay connection is gone
    #[error("Relay connection closed")]
    RelayClosed,
}

/// Signaling relay errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The endpoint already registered an entity on this connection
    #[error("Endpoint already registered: {endpoint_id}")]
    AlreadyRegistered {
        /// Relay endpoint of the connection
        endpoint_id: String,
    },

    /// The relay rejected the entity registration
    #[error("Relay refused registration of {entity_id}")]
    RegistrationRefused {
        /// Entity that tried to register
        entity_id: String,
    },
}

/// Peer channel state errors
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    /// The channel has no usable transport
    #[error("Channel to {peer_id} is not connected")]
    NotConnected {
        /// Peer the operation targeted
        peer_id: String,
    },

    /// The peer has been blocked locally
    #[error("Peer blocked: {peer_id}")]
    Blocked {
        /// Peer the operation targeted
        peer_id: String,
    },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue {
        /// Configuration key
        field: String,
        /// Offending value
        value: String,
    },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path involved
        path: String,
    },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError {
        /// What went wrong
        reason: String,
    },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation {
        /// Path involved
        path: String,
    },
}

/// Protocol-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Invalid envelope or relay message format
    #[error("Invalid message format: {reason}")]
    InvalidMessage {
        /// What went wrong
        reason: String,
    },

    /// Message too large
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Size of the message in bytes
        size: usize,
        /// Largest size accepted
        max: usize,
    },

    /// Transfer or handshake message arrived in the wrong state
    #[error("Protocol violation: {reason}")]
    Violation {
        /// What went wrong
        reason: String,
    },

    /// A transferred filename tried to escape its namespace
    #[error("Rejected filename: {filename}")]
    InvalidFilename {
        /// Filename as received
        filename: String,
    },
}

/// Storage errors
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// Record lookup failed
    #[error("Record not found: {key}")]
    NotFound {
        /// Key that was looked up
        key: String,
    },
}

impl PeerwayError {
    /// Creates a new unexpected error with a custom message
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Creates a protocol violation error
    pub fn violation<S: Into<String>>(reason: S) -> Self {
        Self::Protocol(ProtocolError::Violation {
            reason: reason.into(),
        })
    }

    /// Creates a timeout error for the named operation
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Network(NetworkError::Timeout {
            operation: operation.into(),
        })
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(NetworkError::Timeout { .. })
                | Self::Network(NetworkError::ConnectionFailed { .. })
                | Self::Channel(ChannelError::NotConnected { .. })
                | Self::Protocol(ProtocolError::MessageTooLarge { .. })
        )
    }

    /// Returns true if this error indicates a security violation
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::Decryption { .. })
                | Self::Protocol(ProtocolError::InvalidFilename { .. })
        )
    }
}

impl From<std::io::Error> for PeerwayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PeerwayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
