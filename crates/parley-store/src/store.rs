//! Async store interfaces and their SQLite adapter.
//!
//! The server only talks to [`MessageStore`] and [`UserDirectory`]; the
//! rusqlite work behind [`SqliteStore`] runs on tokio's blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use parley_shared::{ConversationId, Message, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::UserRecord;

/// Append-only ordered message log, partitioned by conversation.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Durably append `message` to its conversation.
    async fn append(&self, message: &Message) -> Result<()>;

    /// Messages of a conversation in ascending sequence-key order.
    async fn query(&self, conversation_id: &ConversationId) -> Result<Vec<Message>>;
}

/// Users that have authenticated at least once.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn remember(
        &self,
        user_id: &UserId,
        email: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn find(&self, user_id: &UserId) -> Result<Option<UserRecord>>;

    async fn all_users(&self) -> Result<Vec<UserRecord>>;
}

/// SQLite-backed [`MessageStore`] and [`UserDirectory`].
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteStore {
    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self::from_database(Database::open_at(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    pub fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().unwrap_or_else(PoisonError::into_inner);
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, message: &Message) -> Result<()> {
        let message = message.clone();
        self.with_db(move |db| {
            db.insert_message(&message)?;
            debug!(
                id = %message.id,
                conversation = %message.conversation_id,
                seq = %message.sequence_key,
                "Appended message"
            );
            Ok(())
        })
        .await
    }

    async fn query(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let conversation_id = conversation_id.clone();
        self.with_db(move |db| db.messages_for_conversation(&conversation_id))
            .await
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn remember(
        &self,
        user_id: &UserId,
        email: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        let user_id = user_id.clone();
        let email = email.map(str::to_string);
        self.with_db(move |db| db.upsert_user(&user_id, email.as_deref(), seen_at))
            .await
    }

    async fn find(&self, user_id: &UserId) -> Result<Option<UserRecord>> {
        let user_id = user_id.clone();
        self.with_db(move |db| db.get_user(&user_id)).await
    }

    async fn all_users(&self) -> Result<Vec<UserRecord>> {
        self.with_db(|db| db.list_users()).await
    }
}
