//! Control-plane wire types shared by the relay worker and its coordinator.
//!
//! Every message on the control channel is a JSON encoded [`ControlPacket`].
//! Its `data` field is itself a JSON document whose shape depends on the
//! command carried in `id`:
//!
//! | command      | `data`                         |
//! |--------------|--------------------------------|
//! | `start`      | [`RoomStartCall`]              |
//! | `started`    | [`RoomStartRsp`]               |
//! | `quit`       | bare room id                   |
//! | `close_room` | bare room id                   |

mod packet;
mod payload;

pub use packet::{Command, ControlPacket};
pub use payload::{Payload, RoomStartCall, RoomStartRsp, SdpDescriptor};

use thiserror::Error;

/// Errors raised while encoding or decoding control payloads
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
