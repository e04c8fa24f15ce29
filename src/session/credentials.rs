//! On-disk protocol credentials, one directory per session.

use std::path::PathBuf;

use tracing::{debug, info};

/// Owns `{root}/{session_id}/` directories handed to the transport.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Credential directory of a session. Not created.
    pub fn dir_for(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    /// Ensure the session's directory exists and return it.
    pub async fn prepare(&self, session_id: &str) -> std::io::Result<PathBuf> {
        let dir = self.dir_for(session_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Whether anything has been stored for the session.
    pub async fn has_credentials(&self, session_id: &str) -> bool {
        match tokio::fs::read_dir(self.dir_for(session_id)).await {
            Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
            Err(_) => false,
        }
    }

    /// Remove every credential file of the session. Missing directories are fine.
    pub async fn wipe(&self, session_id: &str) -> std::io::Result<()> {
        let dir = self.dir_for(session_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(session_id, "Session credentials wiped");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(session_id, "No credentials to wipe");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
