use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::CONVERSATION_DELIMITER;
use crate::error::SharedError;

// User identity = `sub` claim issued by the identity provider.
// Never contains CONVERSATION_DELIMITER, so a conversation id splits back
// into exactly one pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Result<Self, SharedError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(SharedError::EmptyUserId);
        }
        if id.contains(CONVERSATION_DELIMITER) {
            return Err(SharedError::InvalidUserId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = SharedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle of one live transport session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the conversation between two users.
///
/// Derived from the unordered pair of participants: the two ids are sorted
/// and joined with [`CONVERSATION_DELIMITER`], so `between(a, b)` and
/// `between(b, a)` are equal. Nothing is stored for a conversation besides
/// its messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn between(a: &UserId, b: &UserId) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!(
            "{}{}{}",
            first.as_str(),
            CONVERSATION_DELIMITER,
            second.as_str()
        ))
    }

    /// Wrap an id received from a client (e.g. a URL path segment).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two participant ids, lowest first. `None` for an id that was
    /// not produced by [`ConversationId::between`].
    pub fn participants(&self) -> Option<(&str, &str)> {
        let (first, second) = self.0.split_once(CONVERSATION_DELIMITER)?;
        let well_formed = !first.trim().is_empty()
            && !second.trim().is_empty()
            && !second.contains(CONVERSATION_DELIMITER)
            && first <= second;
        well_formed.then_some((first, second))
    }

    /// Whether `user` is one of the two participants.
    pub fn involves(&self, user: &UserId) -> bool {
        self.participants()
            .is_some_and(|(first, second)| user.as_str() == first || user.as_str() == second)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordering key of a message within its conversation.
///
/// `millis` is the send time; `counter` breaks ties between messages that
/// were stamped in the same millisecond. The string form is fixed-width so
/// it sorts lexicographically in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SequenceKey {
    pub millis: i64,
    pub counter: u32,
}

impl SequenceKey {
    pub const fn new(millis: i64, counter: u32) -> Self {
        Self { millis, counter }
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:013}-{:06}", self.millis, self.counter)
    }
}

impl FromStr for SequenceKey {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, counter) = s
            .split_once('-')
            .ok_or_else(|| SharedError::InvalidSequenceKey(s.to_string()))?;
        let millis = millis
            .parse::<i64>()
            .map_err(|_| SharedError::InvalidSequenceKey(s.to_string()))?;
        let counter = counter
            .parse::<u32>()
            .map_err(|_| SharedError::InvalidSequenceKey(s.to_string()))?;
        Ok(Self { millis, counter })
    }
}

impl TryFrom<String> for SequenceKey {
    type Error = SharedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SequenceKey> for String {
    fn from(key: SequenceKey) -> Self {
        key.to_string()
    }
}

/// Hands out strictly increasing [`SequenceKey`]s.
///
/// Keys follow wall-clock milliseconds; when the clock has not advanced (or
/// went backwards) the previous millisecond is reused with the next counter.
#[derive(Debug, Default)]
pub struct SequenceClock {
    last: Mutex<Option<SequenceKey>>,
}

impl SequenceClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> SequenceKey {
        self.next_at(Utc::now())
    }

    pub fn next_at(&self, now: DateTime<Utc>) -> SequenceKey {
        let millis = now.timestamp_millis();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);

        let next = match *last {
            Some(prev) if millis <= prev.millis => match prev.counter.checked_add(1) {
                Some(counter) => SequenceKey::new(prev.millis, counter),
                None => SequenceKey::new(prev.millis + 1, 0),
            },
            _ => SequenceKey::new(millis, 0),
        };

        *last = Some(next);
        next
    }
}
