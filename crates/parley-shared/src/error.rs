use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SharedError {
    #[error("User id must not be empty")]
    EmptyUserId,

    #[error("User id must not contain '_': {0}")]
    InvalidUserId(String),

    #[error("Message must carry text or an attachment")]
    EmptyMessage,

    #[error("Message text too long: {len} chars (max {max})")]
    TextTooLong { len: usize, max: usize },

    #[error("Invalid attachment URI: {0}")]
    InvalidAttachment(String),

    #[error("Conversation id {given} does not match participants (expected {expected})")]
    ConversationMismatch { given: String, expected: String },

    #[error("Invalid sequence key: {0}")]
    InvalidSequenceKey(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
