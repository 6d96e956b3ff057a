//! Records persisted alongside the message log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::UserId;

/// A user that has authenticated at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: UserId,
    pub email: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}
