//! In-process loopback transport.
//!
//! Behaves like a paired device without any network: a connection issues a
//! pairing code unless credentials already exist under the session's
//! credential directory, in which case it opens straight away with the stored
//! identity. Tests and the development binary drive the remote side through
//! [`LoopbackTransport::complete_pairing`], [`LoopbackTransport::deliver`] and
//! [`LoopbackTransport::close`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use super::{CloseReason, RawInbound, Transport, TransportConnection, TransportEvent, TransportHandle};
use crate::error::TransportError;
use crate::store::traits::Identity;

/// File written into the credential directory once a session is paired.
pub const CREDENTIALS_FILE: &str = "creds.json";

const EVENT_BUFFER: usize = 64;

/// A message that went out through a loopback handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub session_id: String,
    pub address: String,
    pub body: String,
}

struct LoopbackSession {
    events: mpsc::Sender<TransportEvent>,
    credentials: PathBuf,
    ended: Arc<AtomicBool>,
}

#[derive(Default)]
struct LoopbackState {
    sessions: HashMap<String, LoopbackSession>,
    connects: HashMap<String, u32>,
    connect_failures: HashMap<String, u32>,
    send_failure: Option<String>,
    sent: Vec<SentMessage>,
    codes_issued: u64,
}

/// Loopback implementation of [`Transport`].
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the tenant scanning the pairing code: persist credentials and
    /// open the connection. Returns `false` if the session has no connection.
    pub async fn complete_pairing(&self, session_id: &str, identity: Identity) -> bool {
        let (sender, credentials) = {
            let state = self.state.lock().await;
            match state.sessions.get(session_id) {
                Some(s) => (s.events.clone(), s.credentials.clone()),
                None => return false,
            }
        };

        if let Err(e) = write_credentials(&credentials, &identity).await {
            warn!(session_id, error = %e, "Loopback failed to write credentials");
            return false;
        }
        info!(session_id, number = %identity.number, "Loopback pairing completed");
        sender
            .send(TransportEvent::ConnectionOpened { identity })
            .await
            .is_ok()
    }

    /// Deliver an inbound message on the session's current connection.
    pub async fn deliver(&self, session_id: &str, message: RawInbound) -> bool {
        self.inject(session_id, TransportEvent::MessageReceived(message))
            .await
    }

    /// Close the session's current connection from the remote side.
    pub async fn close(&self, session_id: &str, reason: CloseReason) -> bool {
        self.inject(session_id, TransportEvent::ConnectionClosed { reason })
            .await
    }

    /// Push an arbitrary event onto the session's current connection.
    pub async fn inject(&self, session_id: &str, event: TransportEvent) -> bool {
        let sender = {
            let state = self.state.lock().await;
            match state.sessions.get(session_id) {
                Some(s) => s.events.clone(),
                None => return false,
            }
        };
        sender.send(event).await.is_ok()
    }

    /// Make the next `count` connects for `session_id` fail.
    pub async fn fail_next_connects(&self, session_id: &str, count: u32) {
        let mut state = self.state.lock().await;
        state.connect_failures.insert(session_id.to_string(), count);
    }

    /// Make every send fail with `reason` until cleared with `None`.
    pub async fn set_send_failure(&self, reason: Option<&str>) {
        self.state.lock().await.send_failure = reason.map(str::to_string);
    }

    /// Number of connect calls made for `session_id`, failed ones included.
    pub async fn connect_count(&self, session_id: &str) -> u32 {
        let state = self.state.lock().await;
        state.connects.get(session_id).copied().unwrap_or(0)
    }

    /// Everything sent so far, oldest first.
    pub async fn sent_messages(&self) -> Vec<SentMessage> {
        self.state.lock().await.sent.clone()
    }

    /// Whether the session's current connection was ended by the client.
    pub async fn is_ended(&self, session_id: &str) -> bool {
        let state = self.state.lock().await;
        state
            .sessions
            .get(session_id)
            .is_none_or(|s| s.ended.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(
        &self,
        session_id: &str,
        credentials: &Path,
    ) -> Result<TransportConnection, TransportError> {
        let mut state = self.state.lock().await;
        *state.connects.entry(session_id.to_string()).or_insert(0) += 1;

        if let Some(remaining) = state.connect_failures.get_mut(session_id) {
            if *remaining > 0 {
                *remaining -= 1;
                debug!(session_id, remaining = *remaining, "Loopback connect failing on request");
                return Err(TransportError::ConnectFailed {
                    session_id: session_id.to_string(),
                    reason: "loopback refused connection".into(),
                });
            }
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let first = match read_credentials(credentials).await {
            Some(identity) => TransportEvent::ConnectionOpened { identity },
            None => {
                state.codes_issued += 1;
                TransportEvent::PairingCodeIssued {
                    code: format!("2@{session_id}#{}", state.codes_issued),
                }
            }
        };
        // Fresh channel with spare capacity.
        let _ = tx.try_send(first);

        let ended = Arc::new(AtomicBool::new(false));
        state.sessions.insert(
            session_id.to_string(),
            LoopbackSession {
                events: tx,
                credentials: credentials.to_path_buf(),
                ended: Arc::clone(&ended),
            },
        );
        debug!(session_id, "Loopback connection opened");

        Ok(TransportConnection {
            handle: Arc::new(LoopbackHandle {
                session_id: session_id.to_string(),
                state: Arc::clone(&self.state),
                ended,
            }),
            events: rx,
        })
    }
}

/// Handle of one loopback connection.
struct LoopbackHandle {
    session_id: String,
    state: Arc<Mutex<LoopbackState>>,
    ended: Arc<AtomicBool>,
}

#[async_trait]
impl TransportHandle for LoopbackHandle {
    async fn send(&self, address: &str, body: &str) -> Result<(), TransportError> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.send_failure {
            return Err(TransportError::SendFailed {
                address: address.to_string(),
                reason: reason.clone(),
            });
        }
        state.sent.push(SentMessage {
            session_id: self.session_id.clone(),
            address: address.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn end(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            debug!(session_id = %self.session_id, "Loopback connection ended");
        }
    }
}

async fn read_credentials(dir: &Path) -> Option<Identity> {
    let raw = tokio::fs::read_to_string(dir.join(CREDENTIALS_FILE)).await.ok()?;
    match serde_json::from_str(&raw) {
        Ok(identity) => Some(identity),
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "Unreadable loopback credentials, re-pairing");
            None
        }
    }
}

async fn write_credentials(dir: &Path, identity: &Identity) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let json = serde_json::to_string(identity).map_err(std::io::Error::other)?;
    tokio::fs::write(dir.join(CREDENTIALS_FILE), json).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            number: "5511000".into(),
            display_name: Some("Store".into()),
        }
    }

    #[tokio::test]
    async fn first_connect_issues_pairing_code() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LoopbackTransport::new();
        let mut conn = transport.connect("session-1", dir.path()).await.unwrap();

        match conn.events.recv().await.unwrap() {
            TransportEvent::PairingCodeIssued { code } => assert!(code.starts_with("2@session-1")),
            other => panic!("expected pairing code, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn paired_session_reconnects_without_code() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LoopbackTransport::new();
        let mut conn = transport.connect("session-1", dir.path()).await.unwrap();
        conn.events.recv().await.unwrap();

        assert!(transport.complete_pairing("session-1", identity()).await);
        assert_eq!(
            conn.events.recv().await.unwrap(),
            TransportEvent::ConnectionOpened {
                identity: identity()
            }
        );

        let mut again = transport.connect("session-1", dir.path()).await.unwrap();
        assert_eq!(
            again.events.recv().await.unwrap(),
            TransportEvent::ConnectionOpened {
                identity: identity()
            }
        );
        assert_eq!(transport.connect_count("session-1").await, 2);
    }

    #[tokio::test]
    async fn injected_connect_failures_run_out() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LoopbackTransport::new();
        transport.fail_next_connects("session-1", 1).await;

        assert!(transport.connect("session-1", dir.path()).await.is_err());
        assert!(transport.connect("session-1", dir.path()).await.is_ok());
    }

    #[tokio::test]
    async fn sends_are_recorded_until_ended() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LoopbackTransport::new();
        let conn = transport.connect("session-1", dir.path()).await.unwrap();

        conn.handle.send("5511", "hello").await.unwrap();
        assert_eq!(transport.sent_messages().await[0].body, "hello");

        conn.handle.end().await;
        assert!(transport.is_ended("session-1").await);
        assert!(matches!(
            conn.handle.send("5511", "again").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn send_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LoopbackTransport::new();
        let conn = transport.connect("session-1", dir.path()).await.unwrap();
        transport.set_send_failure(Some("rate limited")).await;

        let err = conn.handle.send("5511", "hello").await.unwrap_err();
        assert!(matches!(err, TransportError::SendFailed { .. }));
        assert!(transport.sent_messages().await.is_empty());
    }
}
