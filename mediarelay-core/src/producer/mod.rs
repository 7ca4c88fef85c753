//! Raw frame producers
//!
//! A producer runs once per room. It receives an explicit
//! [`ProducerContext`] that carries everything it may touch: where to send
//! frames, the typed peer input stream and the room's cancellation token.

pub mod pattern;
#[cfg(unix)]
pub mod socket;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::media::Frame;
use crate::types::{RoomId, SessionId};

pub use pattern::PatternProducer;
#[cfg(unix)]
pub use socket::SocketProducer;

/// Raw input value that tells the producer a peer went away
pub const DISCONNECT_SENTINEL: u16 = 0xFFFF;

/// Peer input, classified at the producer boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// Controller state as a bitmap of pressed buttons
    Buttons { player: u8, bitmap: u16 },
    /// The peer's input stream ended
    Disconnect { session: SessionId },
}

impl InputEvent {
    /// Classify raw bytes read from a peer.
    ///
    /// Two bytes are a little-endian button bitmap, except for
    /// [`DISCONNECT_SENTINEL`].
    pub fn parse(raw: &[u8], player: u8, session: &SessionId) -> Result<Self> {
        match *raw {
            [lo, hi] => {
                let bitmap = u16::from_le_bytes([lo, hi]);
                if bitmap == DISCONNECT_SENTINEL {
                    Ok(Self::Disconnect {
                        session: session.clone(),
                    })
                } else {
                    Ok(Self::Buttons { player, bitmap })
                }
            }
            _ => Err(Error::UnknownInput(raw.len())),
        }
    }
}

/// Per-room state handed to a producer
pub struct ProducerContext {
    pub room_id: RoomId,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// RTP clock ticks per second, used for frame timestamps
    pub clock_rate: u32,
    pub frames: mpsc::Sender<Frame>,
    pub input: mpsc::Receiver<InputEvent>,
    /// Fires when the room closes
    pub cancel: CancellationToken,
}

impl ProducerContext {
    /// Clock ticks between two frames
    #[must_use]
    pub fn ticks_per_frame(&self) -> u32 {
        self.clock_rate / self.fps.max(1)
    }
}

/// Source of raw frames for one room
#[async_trait]
pub trait FrameProducer: Send {
    /// Produce frames until cancelled or the frame receiver goes away
    async fn run(self: Box<Self>, ctx: ProducerContext) -> Result<()>;
}

/// Settings a factory may consult when creating a producer
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub room_id: RoomId,
    pub width: u32,
    pub height: u32,
    pub socket_path: String,
}

impl ProducerSettings {
    #[must_use]
    pub fn from_config(config: &Config, room_id: &RoomId) -> Self {
        Self {
            room_id: room_id.clone(),
            width: config.media.width,
            height: config.media.height,
            socket_path: config.media.socket_path(room_id.as_str()),
        }
    }
}

/// Creates the producer a room runs, by name
pub trait ProducerFactory: Send + Sync {
    fn create(&self, name: &str, settings: &ProducerSettings) -> Result<Box<dyn FrameProducer>>;
}

/// Producers shipped with the worker: `pattern` and `socket`
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinProducers {
    /// Run every room from an out-of-process producer
    pub use_unix_socket: bool,
}

impl ProducerFactory for BuiltinProducers {
    fn create(&self, name: &str, settings: &ProducerSettings) -> Result<Box<dyn FrameProducer>> {
        #[cfg(unix)]
        if self.use_unix_socket || name == "socket" {
            return Ok(Box::new(SocketProducer::new(&settings.socket_path)));
        }

        match name {
            "pattern" => Ok(Box::new(PatternProducer::default())),
            other => Err(Error::UnknownProducer(other.to_string())),
        }
    }
}
