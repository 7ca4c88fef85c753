//! Control packet envelope

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ProtoError;

/// Closed set of commands understood by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Coordinator asks the worker to start streaming a room to a peer
    Start,
    /// Worker acknowledges a `start`
    Started,
    /// Coordinator removes a peer from its room
    Quit,
    /// A room was closed (worker -> coordinator), or must be closed
    /// (coordinator -> worker)
    CloseRoom,
}

impl Command {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Started => "started",
            Self::Quit => "quit",
            Self::CloseRoom => "close_room",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "started" => Ok(Self::Started),
            "quit" => Ok(Self::Quit),
            "close_room" => Ok(Self::CloseRoom),
            other => Err(ProtoError::UnknownCommand(other.to_string())),
        }
    }
}

/// One message on the control channel.
///
/// `packet_id` is the correlation id. It is assigned by the sender of a
/// request and copied unchanged into the reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPacket {
    /// Command id
    pub id: String,
    /// Opaque, command specific payload
    pub data: String,
    /// Correlation id
    pub packet_id: String,
    /// Globally unique id of the peer session
    pub session_id: String,
    /// Room the session belongs to (many sessions map to one room)
    pub room_id: String,
}

impl ControlPacket {
    pub fn new(command: Command, data: impl Into<String>) -> Self {
        Self {
            id: command.as_str().to_string(),
            data: data.into(),
            ..Default::default()
        }
    }

    /// Packet announcing that a room has been closed
    pub fn close_room(room_id: impl Into<String>) -> Self {
        let room_id = room_id.into();
        Self {
            id: Command::CloseRoom.as_str().to_string(),
            data: room_id.clone(),
            room_id,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    #[must_use]
    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = room_id.into();
        self
    }

    /// Parsed command id, if it is one of the known commands
    pub fn command(&self) -> Option<Command> {
        self.id.parse().ok()
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
