//! Out-of-process frame import over a Unix domain socket
//!
//! Each record is length-delimited (4-byte big-endian length) and laid out as
//! `[u32 width][u32 height][u32 timestamp][width * height * 4 RGBA bytes]`,
//! all integers big-endian. Records may arrive split across arbitrary reads.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use std::path::PathBuf;
use tokio::net::UnixListener;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use super::{FrameProducer, InputEvent, ProducerContext};
use crate::error::{Error, Result};
use crate::media::{Frame, RgbaImage};

const HEADER_LEN: usize = 12;
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Listens on a socket path and forwards every record as a frame
pub struct SocketProducer {
    path: PathBuf,
}

impl SocketProducer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Decode one reassembled record
pub fn decode_record(mut record: BytesMut) -> Result<Frame> {
    if record.len() < HEADER_LEN {
        return Err(Error::InvalidFrame(format!(
            "record of {} bytes is shorter than its header",
            record.len()
        )));
    }
    let width = record.get_u32();
    let height = record.get_u32();
    let timestamp = record.get_u32();
    let image = RgbaImage::new(width, height, record.freeze())?;
    Ok(Frame { image, timestamp })
}

#[async_trait]
impl FrameProducer for SocketProducer {
    async fn run(self: Box<Self>, mut ctx: ProducerContext) -> Result<()> {
        // a previous worker may have left the socket file behind
        if self.path.exists() {
            tokio::fs::remove_file(&self.path).await?;
        }
        let listener = UnixListener::bind(&self.path)?;
        info!(room_id = %ctx.room_id, path = %self.path.display(), "Waiting for frame exporter");

        let result: Result<()> = async {
            let stream = tokio::select! {
                () = ctx.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?.0,
            };
            debug!(room_id = %ctx.room_id, "Frame exporter connected");

            let codec = LengthDelimitedCodec::builder()
                .max_frame_length(MAX_RECORD_LEN)
                .new_codec();
            let mut records = FramedRead::new(stream, codec);
            let mut input_open = true;

            loop {
                tokio::select! {
                    () = ctx.cancel.cancelled() => break,
                    // the exporter owns input handling; drain so peers never block
                    event = ctx.input.recv(), if input_open => match event {
                        Some(InputEvent::Disconnect { session }) => {
                            debug!(session_id = %session, "Peer left socket room");
                        }
                        Some(_) => {}
                        None => input_open = false,
                    },
                    record = records.next() => match record {
                        Some(Ok(record)) => match decode_record(record) {
                            Ok(frame) => {
                                if ctx.frames.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(room_id = %ctx.room_id, error = %e, "Skipping bad record"),
                        },
                        Some(Err(e)) => return Err(Error::Io(e)),
                        None => {
                            debug!(room_id = %ctx.room_id, "Frame exporter disconnected");
                            break;
                        }
                    },
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            debug!(path = %self.path.display(), error = %e, "Socket file already gone");
        }
        result
    }
}
