//! RTP packetization of encoded samples

use bytes::Bytes;
use webrtc::rtp::codecs::g7xx::G711Payloader;
use webrtc::rtp::codecs::h264::H264Payloader;
use webrtc::rtp::codecs::opus::OpusPayloader;
use webrtc::rtp::packetizer::{new_packetizer, Packetizer, Payloader};
use webrtc::rtp::sequence::new_random_sequencer;
use webrtc::util::Marshal;

use crate::config::{AudioCodecConfig, VideoCodecConfig};
use crate::error::{Error, Result};

/// Outbound RTP stream of one media type
pub struct RtpTrack {
    packetizer: Box<dyn Packetizer + Send + Sync>,
    ssrc: u32,
    samples: u32,
}

impl RtpTrack {
    /// Video track. Every sample advances the RTP clock by `clock_rate / fps`.
    pub fn video(codec: &VideoCodecConfig, payload_type: u8, fps: u32, mtu: usize) -> Result<Self> {
        let payloader: Box<dyn Payloader + Send + Sync> = match codec.codec.to_lowercase().as_str() {
            // raw frames are carried in H.264 framing for diagnostics
            "h264" | "raw" => Box::<H264Payloader>::default(),
            other => return Err(Error::UnsupportedCodec(other.to_string())),
        };
        Ok(Self::new(payloader, payload_type, codec.clock_rate, codec.clock_rate / fps.max(1), mtu))
    }

    pub fn audio(codec: &AudioCodecConfig, payload_type: u8, mtu: usize) -> Result<Self> {
        let payloader: Box<dyn Payloader + Send + Sync> = match codec.codec.to_lowercase().as_str() {
            "opus" => Box::<OpusPayloader>::default(),
            "pcmu" | "pcma" | "g711" => Box::<G711Payloader>::default(),
            other => return Err(Error::UnsupportedCodec(other.to_string())),
        };
        let samples = codec.clock_rate * codec.frame_ms / 1000;
        Ok(Self::new(payloader, payload_type, codec.clock_rate, samples, mtu))
    }

    fn new(
        payloader: Box<dyn Payloader + Send + Sync>,
        payload_type: u8,
        clock_rate: u32,
        samples: u32,
        mtu: usize,
    ) -> Self {
        let ssrc = rand::random::<u32>();
        let packetizer = new_packetizer(
            mtu,
            payload_type,
            ssrc,
            payloader,
            Box::new(new_random_sequencer()),
            clock_rate,
        );
        Self {
            packetizer: Box::new(packetizer),
            ssrc,
            samples,
        }
    }

    #[must_use]
    pub const fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Split one sample into marshalled RTP packets
    pub fn packetize(&mut self, sample: &Bytes) -> Result<Vec<Bytes>> {
        self.packetizer
            .packetize(sample, self.samples)?
            .iter()
            .map(|packet| packet.marshal().map_err(Error::from))
            .collect()
    }
}
