//! Persistence layer: libSQL-backed storage for sessions, conversations,
//! messages and bot configuration.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    Conversation, ConversationStatus, Database, DeliveryStatus, Direction, Identity, NewMessage,
    PairingCode, SessionRecord, StoredMessage, session_id_for,
};
