//! Video encoder seam
//!
//! Native encoders live outside this crate. They plug in through
//! [`EncoderFactory`]; the built-in factory only knows the diagnostic `raw`
//! codec, which passes I420 frames through untouched.

use bytes::Bytes;

use crate::config::VideoCodecConfig;
use crate::error::{Error, Result};

/// Frame encoder driven by the encoding pipeline.
///
/// `encode(Some(yuv))` feeds one I420 frame; `encode(None)` asks for
/// buffered output without new input. `Ok(None)` means nothing is ready
/// yet (the frame was buffered) and is not an error.
pub trait VideoEncoder: Send + 'static {
    fn encode(&mut self, yuv: Option<&[u8]>) -> Result<Option<Bytes>>;

    /// Release encoder resources. Called once, after all output was drained.
    fn shutdown(&mut self) -> Result<()>;
}

/// Creates encoders for a codec name
pub trait EncoderFactory: Send + Sync {
    fn create(
        &self,
        codec: &VideoCodecConfig,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoEncoder>>;
}

/// Encoders shipped with the worker
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinEncoders;

impl EncoderFactory for BuiltinEncoders {
    fn create(
        &self,
        codec: &VideoCodecConfig,
        _width: u32,
        _height: u32,
    ) -> Result<Box<dyn VideoEncoder>> {
        match codec.codec.to_lowercase().as_str() {
            "raw" => Ok(Box::new(RawEncoder::default())),
            other => Err(Error::UnsupportedCodec(other.to_string())),
        }
    }
}

/// Passthrough "encoder" emitting every I420 frame as-is
#[derive(Debug, Default)]
pub struct RawEncoder {
    closed: bool,
}

impl VideoEncoder for RawEncoder {
    fn encode(&mut self, yuv: Option<&[u8]>) -> Result<Option<Bytes>> {
        if self.closed {
            return Err(Error::Encoder("encoder already shut down".to_string()));
        }
        Ok(yuv.map(Bytes::copy_from_slice))
    }

    fn shutdown(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
