//! Connect / disconnect handling for live connections.
//!
//! Every transport connection moves through `PendingAuth -> Established ->
//! Closed`. Only an established connection has a registry record. A closed
//! connection has no session entry at all, so a repeated or unknown
//! disconnect is a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use parley_shared::{ConnectionId, UserId};
use parley_store::UserDirectory;

use crate::error::ServerError;
use crate::identity::{verify_within, CredentialVerifier, Identity};
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    PendingAuth,
    Established(UserId),
    Closed,
}

pub struct ConnectionLifecycle {
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    verifier: Arc<dyn CredentialVerifier>,
    transport: Arc<dyn Transport>,
    directory: Arc<dyn UserDirectory>,
    verify_timeout: Duration,
    sessions: DashMap<ConnectionId, ConnectionState>,
}

impl ConnectionLifecycle {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceTracker>,
        verifier: Arc<dyn CredentialVerifier>,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn UserDirectory>,
        verify_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            presence,
            verifier,
            transport,
            directory,
            verify_timeout,
            sessions: DashMap::new(),
        }
    }

    /// Authenticate a new connection and make it reachable.
    ///
    /// On any failure the connection ends up closed with no registry
    /// record. A disconnect that arrives while the credential is being
    /// verified wins over the verification result.
    pub async fn on_connect(
        &self,
        connection_id: &ConnectionId,
        credential: &str,
    ) -> Result<Identity, ServerError> {
        match self.sessions.entry(connection_id.clone()) {
            Entry::Occupied(_) => {
                return Err(ServerError::BadRequest(format!(
                    "connection {connection_id} is already open"
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(ConnectionState::PendingAuth);
            }
        }

        let identity =
            match verify_within(self.verifier.as_ref(), credential, self.verify_timeout).await {
                Ok(identity) => identity,
                Err(e) => {
                    self.sessions.remove_if(connection_id, |_, state| {
                        *state == ConnectionState::PendingAuth
                    });
                    debug!(connection = %connection_id, error = %e, "Rejected connection");
                    return Err(e.into());
                }
            };
        let user_id = identity.subject_id.clone();

        let displaced = {
            // Holding the session entry keeps a concurrent disconnect out
            // until the registry reflects the new connection.
            let Some(mut session) = self.sessions.get_mut(connection_id) else {
                debug!(
                    connection = %connection_id,
                    user = %user_id,
                    "Connection closed during verification"
                );
                return Err(ServerError::ConnectionClosed(
                    "closed during verification".to_string(),
                ));
            };
            let displaced = self.registry.register(&user_id, connection_id);
            *session = ConnectionState::Established(user_id.clone());
            displaced
        };

        for old in &displaced {
            self.sessions.remove(old);
            self.transport.close(old);
        }

        let now = Utc::now();
        self.presence.heartbeat(&user_id, now);
        if let Err(e) = self
            .directory
            .remember(&user_id, identity.email.as_deref(), now)
            .await
        {
            warn!(user = %user_id, error = %e, "Failed to record user in directory");
        }

        info!(
            connection = %connection_id,
            user = %user_id,
            displaced = displaced.len(),
            "Connection established"
        );
        Ok(identity)
    }

    /// Handle the transport's disconnect notification.
    ///
    /// Returns whether the connection was still open. Presence is left
    /// alone; it decays on its own.
    pub fn on_disconnect(&self, connection_id: &ConnectionId) -> bool {
        let Some((_, state)) = self.sessions.remove(connection_id) else {
            return false;
        };

        if let ConnectionState::Established(user_id) = state {
            self.registry.unregister(&user_id, connection_id);
            info!(connection = %connection_id, user = %user_id, "Connection closed");
        } else {
            debug!(connection = %connection_id, "Connection closed before authentication");
        }
        true
    }

    /// Refresh the owner's presence from a client heartbeat frame.
    pub fn heartbeat(&self, connection_id: &ConnectionId) -> Option<UserId> {
        let ConnectionState::Established(user_id) = self.state(connection_id) else {
            return None;
        };
        self.presence.heartbeat(&user_id, Utc::now());
        Some(user_id)
    }

    pub fn state(&self, connection_id: &ConnectionId) -> ConnectionState {
        self.sessions
            .get(connection_id)
            .map(|state| state.value().clone())
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionPolicy;
    use crate::testing::{conn, user, RecordingTransport, StaticVerifier};
    use parley_store::SqliteStore;
    use std::collections::HashSet;
    use tokio::sync::Notify;

    struct Harness {
        lifecycle: Arc<ConnectionLifecycle>,
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceTracker>,
        transport: Arc<RecordingTransport>,
        store: Arc<SqliteStore>,
    }

    fn harness(policy: ConnectionPolicy, verifier: StaticVerifier) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new(policy));
        let presence = Arc::new(PresenceTracker::new(Duration::from_secs(300)));
        let transport = RecordingTransport::new();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let lifecycle = Arc::new(ConnectionLifecycle::new(
            registry.clone(),
            presence.clone(),
            Arc::new(verifier),
            transport.clone(),
            store.clone(),
            Duration::from_millis(200),
        ));
        Harness {
            lifecycle,
            registry,
            presence,
            transport,
            store,
        }
    }

    fn alice_verifier() -> StaticVerifier {
        StaticVerifier::new().with_token("tok-alice", "alice")
    }

    #[tokio::test]
    async fn test_connect_registers_and_marks_online() {
        let h = harness(ConnectionPolicy::Multi, alice_verifier());

        let identity = h.lifecycle.on_connect(&conn("c1"), "tok-alice").await.unwrap();
        assert_eq!(identity.subject_id, user("alice"));
        assert_eq!(
            h.lifecycle.state(&conn("c1")),
            ConnectionState::Established(user("alice"))
        );
        assert_eq!(h.registry.resolve(&user("alice")), HashSet::from([conn("c1")]));
        assert!(h.presence.is_online(&user("alice"), Utc::now()));

        let record = h.store.find(&user("alice")).await.unwrap().unwrap();
        assert_eq!(record.email.as_deref(), Some("alice@example.com"));
    }

    #[tokio::test]
    async fn test_rejected_credential_leaves_no_trace() {
        let h = harness(ConnectionPolicy::Multi, alice_verifier());

        let err = h.lifecycle.on_connect(&conn("c1"), "forged").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_credential");
        assert_eq!(h.lifecycle.state(&conn("c1")), ConnectionState::Closed);
        assert_eq!(h.registry.connection_count(), 0);
        assert!(h.presence.last_active(&user("alice")).is_none());
    }

    #[tokio::test]
    async fn test_verification_timeout_rejects() {
        let verifier = alice_verifier().with_delay(Duration::from_secs(5));
        let h = harness(ConnectionPolicy::Multi, verifier);

        let err = h.lifecycle.on_connect(&conn("c1"), "tok-alice").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_credential");
        assert_eq!(h.lifecycle.state(&conn("c1")), ConnectionState::Closed);
        assert_eq!(h.registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_verification_wins() {
        let gate = Arc::new(Notify::new());
        let h = harness(ConnectionPolicy::Multi, alice_verifier().with_gate(gate.clone()));

        let lifecycle = h.lifecycle.clone();
        let pending =
            tokio::spawn(async move { lifecycle.on_connect(&conn("c1"), "tok-alice").await });

        while h.lifecycle.state(&conn("c1")) != ConnectionState::PendingAuth {
            tokio::task::yield_now().await;
        }
        assert!(h.lifecycle.on_disconnect(&conn("c1")));
        gate.notify_one();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "connection_closed");
        assert_eq!(h.lifecycle.state(&conn("c1")), ConnectionState::Closed);
        assert!(h.registry.resolve(&user("alice")).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_keeps_presence() {
        let h = harness(ConnectionPolicy::Multi, alice_verifier());
        h.lifecycle.on_connect(&conn("c1"), "tok-alice").await.unwrap();

        assert!(h.lifecycle.on_disconnect(&conn("c1")));
        assert!(!h.lifecycle.on_disconnect(&conn("c1")));
        assert!(!h.lifecycle.on_disconnect(&conn("never-seen")));

        assert!(h.registry.resolve(&user("alice")).is_empty());
        assert!(h.presence.is_online(&user("alice"), Utc::now()));
    }

    #[tokio::test]
    async fn test_duplicate_connect_is_refused() {
        let h = harness(ConnectionPolicy::Multi, alice_verifier());
        h.lifecycle.on_connect(&conn("c1"), "tok-alice").await.unwrap();

        let err = h.lifecycle.on_connect(&conn("c1"), "tok-alice").await.unwrap_err();
        assert_eq!(err.kind(), "bad_request");
        assert_eq!(
            h.lifecycle.state(&conn("c1")),
            ConnectionState::Established(user("alice"))
        );
    }

    #[tokio::test]
    async fn test_single_policy_closes_displaced_connection() {
        let h = harness(ConnectionPolicy::Single, alice_verifier());
        h.lifecycle.on_connect(&conn("old"), "tok-alice").await.unwrap();
        h.lifecycle.on_connect(&conn("new"), "tok-alice").await.unwrap();

        assert_eq!(h.registry.resolve(&user("alice")), HashSet::from([conn("new")]));
        assert_eq!(h.transport.closed(), vec![conn("old")]);
        assert_eq!(h.lifecycle.state(&conn("old")), ConnectionState::Closed);

        // The displaced socket's own disconnect later is a no-op.
        assert!(!h.lifecycle.on_disconnect(&conn("old")));
        assert_eq!(h.registry.resolve(&user("alice")), HashSet::from([conn("new")]));
    }

    #[tokio::test]
    async fn test_socket_heartbeat_requires_established_session() {
        let h = harness(ConnectionPolicy::Multi, alice_verifier());
        assert_eq!(h.lifecycle.heartbeat(&conn("c1")), None);

        h.lifecycle.on_connect(&conn("c1"), "tok-alice").await.unwrap();
        let before = h.presence.last_active(&user("alice")).unwrap();
        assert_eq!(h.lifecycle.heartbeat(&conn("c1")), Some(user("alice")));
        assert!(h.presence.last_active(&user("alice")).unwrap() >= before);
    }
}
