//! Command specific payloads carried in [`ControlPacket::data`](crate::ControlPacket)

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Payloads travel as JSON text inside the packet's `data` field
pub trait Payload: Serialize + DeserializeOwned {
    fn from_data(data: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    fn to_data(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `start` request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStartCall {
    /// Producer to run in the room (game name)
    #[serde(default)]
    pub name: String,

    #[serde(rename = "audioPayload", default)]
    pub audio_payload_type: u8,

    #[serde(rename = "videoPayload", default)]
    pub video_payload_type: u8,

    /// Network of the peer address, `udp` when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone: String,

    /// Peer media address, `ip:port`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub addr: String,
}

impl Payload for RoomStartCall {}

/// `started` response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStartRsp {
    #[serde(rename = "room")]
    pub room_id: String,

    /// JSON encoded [`SdpDescriptor`]
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sdp: String,
}

impl Payload for RoomStartRsp {}

/// Local media description handed back to the peer. Not a real SDP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpDescriptor {
    /// Local `ip:port` the peer should expect RTP from
    pub address: String,

    #[serde(rename = "audioPayload")]
    pub audio_payload_type: u8,

    #[serde(rename = "videoPayload")]
    pub video_payload_type: u8,
}

impl Payload for SdpDescriptor {}
