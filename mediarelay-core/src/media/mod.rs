//! Raw frames, colour conversion and the encoding pipeline

pub mod encoder;
pub mod frame;
pub mod pipeline;
pub mod yuv;

pub use encoder::{BuiltinEncoders, EncoderFactory, RawEncoder, VideoEncoder};
pub use frame::{EncodedSample, Frame, RgbaImage};
pub use pipeline::{EncodingPipeline, FrameInput};
pub use yuv::YuvConverter;
