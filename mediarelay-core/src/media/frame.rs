//! Frame types exchanged between producer, pipeline and endpoints

use bytes::Bytes;

use crate::error::{Error, Result};

/// Packed 8-bit RGBA image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbaImage {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl RgbaImage {
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let expected = rgba_len(width, height);
        if data.len() != expected {
            return Err(Error::InvalidFrame(format!(
                "{width}x{height} RGBA needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }
}

pub(crate) const fn rgba_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 4
}

/// Raw frame from a producer; timestamp in RTP clock ticks
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbaImage,
    pub timestamp: u32,
}

/// Encoded bitstream for one frame. Samples flushed from the encoder's
/// backlog carry timestamp 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSample {
    pub data: Bytes,
    pub timestamp: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgba_size_is_checked() {
        assert!(RgbaImage::new(2, 2, vec![0u8; 16]).is_ok());
        assert!(matches!(
            RgbaImage::new(2, 2, vec![0u8; 15]),
            Err(Error::InvalidFrame(_))
        ));
    }
}
