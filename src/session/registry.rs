//! Registry of live sessions.
//!
//! An in-memory cache of the connections this process currently holds. The
//! store stays the record of truth; the registry only answers "which handle,
//! which generation, and is it connected" for a session id.
//!
//! Every `initialize` starts a new generation. Work tied to an older
//! generation (events of a replaced connection, a connect that finished after
//! a disconnect) is discarded by comparing generations under the session lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session::state::SessionStatus;
use crate::transport::TransportHandle;

/// One live connection attempt and everything scoped to it.
pub struct LiveSession {
    pub generation: u64,
    pub status: SessionStatus,
    /// Set once the transport connect returned.
    pub handle: Option<Arc<dyn TransportHandle>>,
    /// Cancels the session worker and any pending automated replies.
    pub cancel: CancellationToken,
}

impl LiveSession {
    /// Cancel scoped work and close the transport connection.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle {
            handle.end().await;
        }
    }
}

/// Live handles, generations and pending reconnect timers keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    live: RwLock<HashMap<String, LiveSession>>,
    reconnects: RwLock<HashMap<String, (u64, CancellationToken)>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize lifecycle changes of one session. Other sessions are unaffected.
    pub async fn lock(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(session_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Start a new generation for `session_id`. The caller must have removed
    /// any previous entry.
    pub async fn begin(&self, session_id: &str, status: SessionStatus) -> (u64, CancellationToken) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let entry = LiveSession {
            generation,
            status,
            handle: None,
            cancel: cancel.clone(),
        };
        self.live.write().await.insert(session_id.to_string(), entry);
        debug!(session_id, generation, "Session generation started");
        (generation, cancel)
    }

    /// Attach the connection handle. Fails if `generation` was superseded.
    pub async fn attach(
        &self,
        session_id: &str,
        generation: u64,
        handle: Arc<dyn TransportHandle>,
    ) -> bool {
        let mut live = self.live.write().await;
        match live.get_mut(session_id) {
            Some(entry) if entry.generation == generation => {
                entry.handle = Some(handle);
                true
            }
            _ => false,
        }
    }

    /// Take the handle of a dead connection, keeping the generation current.
    pub async fn detach(
        &self,
        session_id: &str,
        generation: u64,
    ) -> Option<Arc<dyn TransportHandle>> {
        let mut live = self.live.write().await;
        let entry = live.get_mut(session_id)?;
        if entry.generation != generation {
            return None;
        }
        entry.handle.take()
    }

    /// Remove the session entirely, returning what was live.
    pub async fn remove(&self, session_id: &str) -> Option<LiveSession> {
        self.live.write().await.remove(session_id)
    }

    pub async fn is_current(&self, session_id: &str, generation: u64) -> bool {
        self.generation(session_id).await == Some(generation)
    }

    pub async fn generation(&self, session_id: &str) -> Option<u64> {
        self.live.read().await.get(session_id).map(|e| e.generation)
    }

    /// Mirror a status change. Ignored for superseded generations.
    pub async fn set_status(&self, session_id: &str, generation: u64, status: SessionStatus) -> bool {
        let mut live = self.live.write().await;
        match live.get_mut(session_id) {
            Some(entry) if entry.generation == generation => {
                entry.status = status;
                true
            }
            _ => false,
        }
    }

    pub async fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.live.read().await.get(session_id).map(|e| e.status)
    }

    /// The handle of a session that is `Connected` right now.
    pub async fn connected_handle(&self, session_id: &str) -> Option<Arc<dyn TransportHandle>> {
        let live = self.live.read().await;
        live.get(session_id)
            .filter(|e| e.status == SessionStatus::Connected)
            .and_then(|e| e.handle.clone())
    }

    pub async fn has_handle(&self, session_id: &str) -> bool {
        let live = self.live.read().await;
        live.get(session_id).is_some_and(|e| e.handle.is_some())
    }

    pub async fn live_count(&self) -> usize {
        self.live.read().await.len()
    }

    // ── Reconnect timers ────────────────────────────────────────────

    /// Track the pending reconnect of `generation`, cancelling any previous one.
    pub async fn set_reconnect(&self, session_id: &str, generation: u64, token: CancellationToken) {
        if let Some((_, previous)) = self
            .reconnects
            .write()
            .await
            .insert(session_id.to_string(), (generation, token))
        {
            previous.cancel();
        }
    }

    /// Cancel the pending reconnect, if any. Returns whether one was pending.
    pub async fn cancel_reconnect(&self, session_id: &str) -> bool {
        match self.reconnects.write().await.remove(session_id) {
            Some((_, token)) => {
                token.cancel();
                debug!(session_id, "Pending reconnect cancelled");
                true
            }
            None => false,
        }
    }

    /// Forget the timer of `generation` once it fired.
    pub async fn clear_reconnect(&self, session_id: &str, generation: u64) {
        let mut reconnects = self.reconnects.write().await;
        if reconnects.get(session_id).is_some_and(|(g, _)| *g == generation) {
            reconnects.remove(session_id);
        }
    }

    pub async fn has_pending_reconnect(&self, session_id: &str) -> bool {
        self.reconnects.read().await.contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::error::TransportError;

    struct NullHandle;

    #[async_trait]
    impl TransportHandle for NullHandle {
        async fn send(&self, _address: &str, _body: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn end(&self) {}
    }

    #[tokio::test]
    async fn generations_increase_and_supersede() {
        let registry = SessionRegistry::new();
        let (first, _) = registry.begin("s1", SessionStatus::Initializing).await;
        registry.remove("s1").await;
        let (second, _) = registry.begin("s1", SessionStatus::Initializing).await;

        assert!(second > first);
        assert!(!registry.is_current("s1", first).await);
        assert!(!registry.attach("s1", first, Arc::new(NullHandle)).await);
        assert!(registry.attach("s1", second, Arc::new(NullHandle)).await);
    }

    #[tokio::test]
    async fn only_connected_sessions_expose_a_send_handle() {
        let registry = SessionRegistry::new();
        let (generation, _) = registry.begin("s1", SessionStatus::Initializing).await;
        registry.attach("s1", generation, Arc::new(NullHandle)).await;
        assert!(registry.connected_handle("s1").await.is_none());

        registry.set_status("s1", generation, SessionStatus::Connected).await;
        assert!(registry.connected_handle("s1").await.is_some());

        registry.detach("s1", generation).await;
        assert!(registry.connected_handle("s1").await.is_none());
        assert!(registry.is_current("s1", generation).await);
    }

    #[tokio::test]
    async fn shutdown_cancels_scoped_work() {
        let registry = SessionRegistry::new();
        let (_, cancel) = registry.begin("s1", SessionStatus::Initializing).await;
        let child = cancel.child_token();

        registry.remove("s1").await.unwrap().shutdown().await;
        assert!(child.is_cancelled());
        assert_eq!(registry.live_count().await, 0);
    }

    #[tokio::test]
    async fn reconnect_timers_are_replaced_and_cancelled() {
        let registry = SessionRegistry::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        registry.set_reconnect("s1", 1, first.clone()).await;
        registry.set_reconnect("s1", 2, second.clone()).await;
        assert!(first.is_cancelled());

        // A stale timer does not clear the newer one.
        registry.clear_reconnect("s1", 1).await;
        assert!(registry.has_pending_reconnect("s1").await);

        assert!(registry.cancel_reconnect("s1").await);
        assert!(second.is_cancelled());
        assert!(!registry.cancel_reconnect("s1").await);
    }

    #[tokio::test]
    async fn session_locks_are_independent() {
        let registry = SessionRegistry::new();
        let _a = registry.lock("s1").await;
        let b = tokio::time::timeout(std::time::Duration::from_millis(100), registry.lock("s2")).await;
        assert!(b.is_ok());
    }
}
