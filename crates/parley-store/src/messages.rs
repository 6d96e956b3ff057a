use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use parley_shared::{ConversationId, Message, SequenceKey, UserId};

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages (id, conversation_id, sender_id, receiver_id, text,
                                   attachment, created_at, seq_millis, seq_counter)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.id.to_string(),
                message.conversation_id.as_str(),
                message.sender_id.as_str(),
                message.receiver_id.as_str(),
                message.text,
                message.attachment,
                message.created_at.to_rfc3339(),
                message.sequence_key.millis,
                message.sequence_key.counter,
            ],
        )?;
        Ok(())
    }

    /// All messages of a conversation, oldest first.
    pub fn messages_for_conversation(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, conversation_id, sender_id, receiver_id, text, attachment,
                    created_at, seq_millis, seq_counter
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY seq_millis ASC, seq_counter ASC, id ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id.as_str()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let receiver_id: String = row.get(3)?;
    let text: String = row.get(4)?;
    let attachment: Option<String> = row.get(5)?;
    let ts_str: String = row.get(6)?;
    let seq_millis: i64 = row.get(7)?;
    let seq_counter: u32 = row.get(8)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| conversion_error(0, e))?;
    let sender_id = UserId::new(sender_id).map_err(|e| conversion_error(2, e))?;
    let receiver_id = UserId::new(receiver_id).map_err(|e| conversion_error(3, e))?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(6, e))?;

    Ok(Message {
        id,
        conversation_id: ConversationId::from_raw(conversation_id),
        sender_id,
        receiver_id,
        text,
        attachment,
        created_at,
        sequence_key: SequenceKey::new(seq_millis, seq_counter),
    })
}
