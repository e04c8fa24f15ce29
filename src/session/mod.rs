//! Per-tenant session lifecycle.

pub mod credentials;
pub mod pairing;
pub mod registry;
pub mod state;
pub mod supervisor;

pub use credentials::CredentialStore;
pub use registry::SessionRegistry;
pub use state::SessionStatus;
pub use supervisor::{ConnectionSupervisor, InitMode, RecoveryReport};
