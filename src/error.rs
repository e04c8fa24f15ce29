//! Error types for the messaging session manager.

use std::time::Duration;

/// Persistence errors. The inbound pipeline aborts the current message on
/// these but never tears down the transport connection.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Opaque failures reported by the protocol client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connect failed for session {session_id}: {reason}")]
    ConnectFailed { session_id: String, reason: String },

    #[error("Send to {address} failed: {reason}")]
    SendFailed { address: String, reason: String },

    #[error("Connection already closed")]
    Closed,
}

/// Session lifecycle errors surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session {session_id} was not paired within {timeout:?}")]
    PairingTimeout {
        session_id: String,
        timeout: Duration,
    },

    #[error("Pairing failed for session {session_id}: {reason}")]
    PairingFailed { session_id: String, reason: String },

    #[error("Session {session_id} gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { session_id: String, attempts: u32 },

    #[error("Session {session_id} was superseded by a later operation")]
    Superseded { session_id: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Failure of an outbound send request.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Session {session_id} is not connected")]
    NotConnected { session_id: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Message sent but not recorded: {0}")]
    Persistence(#[from] DatabaseError),
}
