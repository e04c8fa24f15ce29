//! CRM messaging: multi-tenant chat session manager.

pub mod bot;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod transport;

pub use manager::SessionManager;
