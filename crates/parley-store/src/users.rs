use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};

use parley_shared::UserId;

use crate::database::Database;
use crate::error::Result;
use crate::models::UserRecord;

impl Database {
    /// Record that `user_id` authenticated at `seen_at`.
    ///
    /// The first sighting fixes `first_seen_at`; later calls only move
    /// `last_seen_at` forward and refresh the email when one is given.
    pub fn upsert_user(
        &self,
        user_id: &UserId,
        email: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        // Fixed-width UTC form so MAX() compares chronologically.
        let seen = seen_at.to_rfc3339_opts(SecondsFormat::Nanos, true);
        self.conn().execute(
            "INSERT INTO users (user_id, email, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                 email        = COALESCE(excluded.email, users.email),
                 last_seen_at = MAX(users.last_seen_at, excluded.last_seen_at)",
            params![user_id.as_str(), email, seen],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &UserId) -> Result<Option<UserRecord>> {
        let user = self
            .conn()
            .query_row(
                "SELECT user_id, email, first_seen_at, last_seen_at
                 FROM users WHERE user_id = ?1",
                params![user_id.as_str()],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn list_users(&self) -> Result<Vec<UserRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, email, first_seen_at, last_seen_at
             FROM users ORDER BY user_id ASC",
        )?;

        let rows = stmt.query_map([], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }
}

fn parse_ts(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    let user_id: String = row.get(0)?;
    let email: Option<String> = row.get(1)?;
    let first_seen: String = row.get(2)?;
    let last_seen: String = row.get(3)?;

    let user_id = UserId::new(user_id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(UserRecord {
        user_id,
        email,
        first_seen_at: parse_ts(2, &first_seen)?,
        last_seen_at: parse_ts(3, &last_seen)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    #[test]
    fn upsert_keeps_first_seen() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(30);

        db.upsert_user(&user("alice"), Some("alice@example.com"), t0)
            .unwrap();
        db.upsert_user(&user("alice"), None, t1).unwrap();

        let record = db.get_user(&user("alice")).unwrap().unwrap();
        assert_eq!(record.email.as_deref(), Some("alice@example.com"));
        assert_eq!(record.first_seen_at, t0);
        assert_eq!(record.last_seen_at, t1);
    }

    #[test]
    fn upsert_never_moves_last_seen_backwards() {
        let db = Database::open_in_memory().unwrap();
        let t1 = Utc::now();
        let t0 = t1 - Duration::minutes(5);

        db.upsert_user(&user("bob"), None, t1).unwrap();
        db.upsert_user(&user("bob"), None, t0).unwrap();

        let record = db.get_user(&user("bob")).unwrap().unwrap();
        assert_eq!(record.last_seen_at, t1);
    }

    #[test]
    fn list_users_sorted() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        for id in ["carol", "alice", "bob"] {
            db.upsert_user(&user(id), None, now).unwrap();
        }

        let ids: Vec<String> = db
            .list_users()
            .unwrap()
            .into_iter()
            .map(|u| u.user_id.to_string())
            .collect();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn missing_user_is_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_user(&user("ghost")).unwrap().is_none());
    }
}
