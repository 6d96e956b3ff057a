//! Hand-written collaborators for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use parley_shared::{ConnectionId, ConversationId, Message, UserId};
use parley_store::{MessageStore, StoreError, UserDirectory, UserRecord};

use crate::identity::{CredentialVerifier, Identity, IdentityError};
use crate::transport::{PushOutcome, Transport};

pub fn user(id: &str) -> UserId {
    UserId::new(id).unwrap()
}

pub fn conn(id: &str) -> ConnectionId {
    ConnectionId::from(id)
}

/// Accepts a fixed set of tokens, each mapping to one identity.
#[derive(Default)]
pub struct StaticVerifier {
    identities: HashMap<String, Identity>,
    gate: Option<Arc<Notify>>,
    delay: Option<Duration>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `subject`.
    pub fn with_token(mut self, token: &str, subject: &str) -> Self {
        self.identities.insert(
            token.to_string(),
            Identity {
                subject_id: user(subject),
                email: Some(format!("{subject}@example.com")),
                expiry: Utc::now() + chrono::Duration::hours(1),
            },
        );
        self
    }

    /// Hold every verification until `gate` is notified.
    pub fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl CredentialVerifier for StaticVerifier {
    async fn verify(&self, credential: &str) -> Result<Identity, IdentityError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let token = credential.strip_prefix("Bearer ").unwrap_or(credential);
        self.identities
            .get(token)
            .cloned()
            .ok_or_else(|| IdentityError::Rejected("unknown token".to_string()))
    }
}

/// Records every push and close; outcomes are scripted per connection.
#[derive(Default)]
pub struct RecordingTransport {
    outcomes: Mutex<HashMap<ConnectionId, PushOutcome>>,
    hanging: Mutex<HashSet<ConnectionId>>,
    pushes: Mutex<Vec<(ConnectionId, String)>>,
    closed: Mutex<Vec<ConnectionId>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, connection_id: &ConnectionId, outcome: PushOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(connection_id.clone(), outcome);
    }

    /// Pushes to `connection_id` never complete.
    pub fn hang(&self, connection_id: &ConnectionId) {
        self.hanging.lock().unwrap().insert(connection_id.clone());
    }

    pub fn pushes(&self) -> Vec<(ConnectionId, String)> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn pushed_to(&self) -> HashSet<ConnectionId> {
        self.pushes().into_iter().map(|(id, _)| id).collect()
    }

    pub fn closed(&self) -> Vec<ConnectionId> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn push(&self, connection_id: &ConnectionId, payload: &str) -> PushOutcome {
        self.pushes
            .lock()
            .unwrap()
            .push((connection_id.clone(), payload.to_string()));

        let hangs = self.hanging.lock().unwrap().contains(connection_id);
        if hangs {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }

        self.outcomes
            .lock()
            .unwrap()
            .get(connection_id)
            .cloned()
            .unwrap_or(PushOutcome::Delivered)
    }

    fn close(&self, connection_id: &ConnectionId) {
        self.closed.lock().unwrap().push(connection_id.clone());
    }
}

/// A message store whose backend is down.
pub struct FailingStore;

#[async_trait]
impl MessageStore for FailingStore {
    async fn append(&self, _message: &Message) -> Result<(), StoreError> {
        Err(StoreError::Worker("store offline".to_string()))
    }

    async fn query(&self, _conversation_id: &ConversationId) -> Result<Vec<Message>, StoreError> {
        Err(StoreError::Worker("store offline".to_string()))
    }
}

#[async_trait]
impl UserDirectory for FailingStore {
    async fn remember(
        &self,
        _user_id: &UserId,
        _email: Option<&str>,
        _seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Err(StoreError::Worker("store offline".to_string()))
    }

    async fn find(&self, _user_id: &UserId) -> Result<Option<UserRecord>, StoreError> {
        Err(StoreError::Worker("store offline".to_string()))
    }

    async fn all_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        Err(StoreError::Worker("store offline".to_string()))
    }
}
