use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{MAX_ATTACHMENT_URI_LEN, MAX_TEXT_CHARS};
use crate::error::SharedError;
use crate::types::{ConversationId, SequenceKey, UserId};

/// A persisted chat message. This is the only message shape inside the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: String,
    /// Opaque URI of an uploaded image; the object store is not our concern.
    pub attachment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sequence_key: SequenceKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        if self.attachment.is_some() {
            MessageKind::Image
        } else {
            MessageKind::Text
        }
    }
}

/// A message accepted from a sender but not yet stamped or persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: String,
    pub attachment: Option<String>,
}

impl OutgoingMessage {
    pub fn new(
        sender_id: UserId,
        receiver_id: UserId,
        text: impl Into<String>,
        attachment: Option<String>,
    ) -> Self {
        Self {
            sender_id,
            receiver_id,
            text: text.into(),
            attachment: attachment.filter(|a| !a.trim().is_empty()),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        ConversationId::between(&self.sender_id, &self.receiver_id)
    }

    pub fn is_self_message(&self) -> bool {
        self.sender_id == self.receiver_id
    }

    pub fn validate(&self) -> Result<(), SharedError> {
        let chars = self.text.chars().count();
        if chars > MAX_TEXT_CHARS {
            return Err(SharedError::TextTooLong {
                len: chars,
                max: MAX_TEXT_CHARS,
            });
        }

        match &self.attachment {
            Some(uri) => validate_attachment(uri)?,
            None if self.text.trim().is_empty() => return Err(SharedError::EmptyMessage),
            None => {}
        }

        Ok(())
    }

    /// Stamp the message with its ordering key and creation time.
    pub fn into_message(self, sequence_key: SequenceKey, created_at: DateTime<Utc>) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: self.conversation_id(),
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            text: self.text,
            attachment: self.attachment,
            created_at,
            sequence_key,
        }
    }
}

fn validate_attachment(uri: &str) -> Result<(), SharedError> {
    if uri.len() > MAX_ATTACHMENT_URI_LEN {
        return Err(SharedError::InvalidAttachment(format!(
            "longer than {MAX_ATTACHMENT_URI_LEN} bytes"
        )));
    }
    if uri.chars().any(char::is_whitespace) {
        return Err(SharedError::InvalidAttachment(
            "contains whitespace".to_string(),
        ));
    }
    if !(uri.starts_with("https://") || uri.starts_with("http://")) {
        return Err(SharedError::InvalidAttachment(
            "expected an http(s) URI".to_string(),
        ));
    }
    Ok(())
}
