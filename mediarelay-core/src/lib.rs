//! Media relay worker core
//!
//! A coordinator drives the worker over a JSON control channel. Each `start`
//! binds an RTP egress endpoint for one peer and joins it to a room; each
//! room runs one frame producer through one encoding pipeline and fans the
//! encoded samples out to all of its endpoints.
//!
//! ## Architecture
//!
//! - **`ControlClient`**: correlated request/response over the control channel
//! - **`CommandHandler`**: session and room registry behind `start`/`quit`/`close_room`
//! - **`PortAllocator`**: round-robin pool of RTP/RTCP port pairs
//! - **`Room`**: producer, `EncodingPipeline` and fan-out to member endpoints
//! - **`RtpEndpoint`**: per-peer RTP session with its own sample queues
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mediarelay_core::{
//!     alert, BuiltinEncoders, BuiltinProducers, CommandHandler, Config, ControlClient,
//!     PortAllocator, RoomServices, UdpTransportFactory,
//! };
//!
//! let config = Arc::new(Config::load(Some("config.toml"))?);
//! let alerts = alert::from_config(&config.alert);
//! let client = ControlClient::new("coordinator", outbound_tx, alerts.clone());
//! let services = RoomServices {
//!     producers: Arc::new(BuiltinProducers::default()),
//!     encoders: Arc::new(BuiltinEncoders),
//!     config: config.clone(),
//!     alerts,
//! };
//! let ports = Arc::new(PortAllocator::new(&config.ports));
//! let handler = CommandHandler::new(client.clone(), ports, services, Arc::new(UdpTransportFactory))?;
//! handler.register();
//! // feed inbound text frames to `client.handle_message(..)`
//! ```

pub mod alert;
pub mod config;
pub mod control;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod logging;
pub mod media;
pub mod ports;
pub mod producer;
pub mod room;
pub mod types;

pub use alert::{spawn_guarded, AlertSink, LogAlertSink, PanicAlert, WebhookAlertSink};
pub use config::Config;
pub use control::{Callback, ControlClient, PacketHandler};
pub use endpoint::{
    EndpointSettings, EndpointState, EndpointStats, PacketTransport, RtpEndpoint, RtpTrack,
    TransportFactory, UdpTransportFactory,
};
pub use error::{Error, Result};
pub use handler::{CommandHandler, RegistryStats, Session};
pub use media::{
    BuiltinEncoders, EncodedSample, EncoderFactory, EncodingPipeline, Frame, FrameInput,
    RgbaImage, VideoEncoder, YuvConverter,
};
pub use ports::{PortAllocator, PortSuite};
pub use producer::{
    BuiltinProducers, FrameProducer, InputEvent, ProducerContext, ProducerFactory,
    ProducerSettings,
};
pub use room::{Room, RoomServices, RoomStats};
pub use types::{RoomId, SessionId};
