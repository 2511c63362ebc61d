//! Error types for clusterbus

use thiserror::Error;

/// Errors that can occur in the event bus
#[derive(Debug, Error)]
pub enum EventError {
    /// Store backend connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// The store could not grant a lease
    #[error("Failed to grant lease: {reason}")]
    Lease { reason: String },

    /// Writing a record to the store failed
    #[error("Failed to write key '{key}': {reason}")]
    StoreWrite { key: String, reason: String },

    /// A stored record could not be decoded into an event
    #[error("Failed to decode record '{key}': {reason}")]
    Decode { key: String, reason: String },

    /// User id cannot be used in a topic key
    #[error("Invalid user id '{0}': must be non-empty and contain no '/'")]
    InvalidUser(String),

    /// Missing or invalid user identity at connection time
    #[error("Unauthorized: {0}")]
    Auth(String),

    /// Writing an event to one connection failed
    #[error("Failed to deliver to connection {connection}: {reason}")]
    Delivery { connection: String, reason: String },

    /// The watch subscription could not be created or broke
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation aborted through its cancellation token
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The dispatcher actor has stopped
    #[error("Dispatcher closed: {0}")]
    Closed(String),
}

/// Result type alias for event bus operations
pub type Result<T> = std::result::Result<T, EventError>;
