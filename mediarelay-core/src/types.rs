//! Identifier types used throughout the worker

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separates the random part of a room id from its producer name
const ROOM_ID_SEPARATOR: &str = "___";

/// Globally unique id of a peer session, assigned by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Room identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id that remembers which producer the room runs,
    /// so a room can later be relaunched from its id alone.
    #[must_use]
    pub fn generate(producer: &str) -> Self {
        let random = rand::random::<u64>() >> 1;
        Self(format!("{random:x}{ROOM_ID_SEPARATOR}{producer}"))
    }

    /// Producer name embedded by [`RoomId::generate`], if any
    #[must_use]
    pub fn producer_name(&self) -> Option<&str> {
        self.0
            .split_once(ROOM_ID_SEPARATOR)
            .map(|(_, name)| name)
            .filter(|name| !name.is_empty())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
