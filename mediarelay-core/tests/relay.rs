//! End-to-end scenarios through the control channel

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use mediarelay_core::config::VideoCodecConfig;
use mediarelay_core::{
    CommandHandler, Config, ControlClient, EncoderFactory, Frame, FrameProducer, LogAlertSink,
    PacketTransport, PortAllocator, ProducerContext, ProducerFactory, ProducerSettings, RgbaImage,
    RoomServices, TransportFactory, VideoEncoder,
};
use mediarelay_proto::{Command, ControlPacket, Payload, RoomStartCall, RoomStartRsp, SdpDescriptor};

#[derive(Default)]
struct RecordingTransports {
    packets: Arc<Mutex<Vec<(SocketAddr, usize)>>>,
    opened: Mutex<Vec<(SocketAddr, SocketAddr)>>,
}

struct RecordingTransport {
    peer: SocketAddr,
    packets: Arc<Mutex<Vec<(SocketAddr, usize)>>>,
}

#[async_trait]
impl PacketTransport for RecordingTransport {
    async fn send(&self, packet: &[u8]) -> mediarelay_core::Result<usize> {
        self.packets.lock().push((self.peer, packet.len()));
        Ok(packet.len())
    }

    async fn recv(&self, _buf: &mut [u8]) -> mediarelay_core::Result<usize> {
        std::future::pending().await
    }
}

#[async_trait]
impl TransportFactory for RecordingTransports {
    async fn open(
        &self,
        local_rtp: SocketAddr,
        _local_rtcp: SocketAddr,
        peer: SocketAddr,
    ) -> mediarelay_core::Result<Arc<dyn PacketTransport>> {
        self.opened.lock().push((local_rtp, peer));
        Ok(Arc::new(RecordingTransport {
            peer,
            packets: self.packets.clone(),
        }))
    }
}

/// Solid grey frames at the configured rate until cancelled
struct GreyProducer;

#[async_trait]
impl FrameProducer for GreyProducer {
    async fn run(self: Box<Self>, ctx: ProducerContext) -> mediarelay_core::Result<()> {
        let mut timestamp = 0u32;
        let mut tick = tokio::time::interval(Duration::from_millis(5));
        loop {
            tokio::select! {
                () = ctx.cancel.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    let pixels = vec![128u8; (ctx.width * ctx.height * 4) as usize];
                    let frame = Frame {
                        image: RgbaImage::new(ctx.width, ctx.height, pixels)?,
                        timestamp,
                    };
                    if ctx.frames.send(frame).await.is_err() {
                        return Ok(());
                    }
                    timestamp = timestamp.wrapping_add(ctx.ticks_per_frame());
                }
            }
        }
    }
}

struct GreyProducers;

impl ProducerFactory for GreyProducers {
    fn create(
        &self,
        _name: &str,
        _settings: &ProducerSettings,
    ) -> mediarelay_core::Result<Box<dyn FrameProducer>> {
        Ok(Box::new(GreyProducer))
    }
}

struct IdrEncoder;

impl VideoEncoder for IdrEncoder {
    fn encode(&mut self, yuv: Option<&[u8]>) -> mediarelay_core::Result<Option<Bytes>> {
        Ok(yuv.map(|_| Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88, 0x84])))
    }

    fn shutdown(&mut self) -> mediarelay_core::Result<()> {
        Ok(())
    }
}

struct IdrEncoders;

impl EncoderFactory for IdrEncoders {
    fn create(
        &self,
        _codec: &VideoCodecConfig,
        _width: u32,
        _height: u32,
    ) -> mediarelay_core::Result<Box<dyn VideoEncoder>> {
        Ok(Box::new(IdrEncoder))
    }
}

struct Worker {
    client: Arc<ControlClient>,
    handler: Arc<CommandHandler>,
    out: mpsc::Receiver<String>,
    transports: Arc<RecordingTransports>,
}

impl Worker {
    fn new() -> Self {
        let mut config = Config::default();
        config.ports.start = 10000;
        config.ports.end = 10002;
        config.media.width = 4;
        config.media.height = 4;
        let config = Arc::new(config);

        let alerts = Arc::new(LogAlertSink::default());
        let (tx, out) = mpsc::channel(32);
        let client = ControlClient::new("coordinator", tx, alerts.clone());
        let services = RoomServices {
            producers: Arc::new(GreyProducers),
            encoders: Arc::new(IdrEncoders),
            config: config.clone(),
            alerts,
        };
        let transports = Arc::new(RecordingTransports::default());
        let handler = CommandHandler::new(
            client.clone(),
            Arc::new(PortAllocator::new(&config.ports)),
            services,
            transports.clone(),
        )
        .unwrap();
        handler.register();

        Self {
            client,
            handler,
            out,
            transports,
        }
    }

    fn deliver(&self, packet: &ControlPacket) {
        self.client.handle_message(&packet.to_json().unwrap());
    }

    async fn next_packet(&mut self) -> ControlPacket {
        let raw = tokio::time::timeout(Duration::from_secs(2), self.out.recv())
            .await
            .expect("no packet from worker")
            .expect("control channel closed");
        ControlPacket::from_json(&raw).unwrap()
    }
}

fn start_packet(packet_id: &str, session: &str, addr: &str) -> ControlPacket {
    let call = RoomStartCall {
        name: "grey".to_string(),
        audio_payload_type: 101,
        video_payload_type: 102,
        zone: "udp".to_string(),
        addr: addr.to_string(),
    };
    let mut packet = ControlPacket::new(Command::Start, call.to_data().unwrap()).with_session(session);
    packet.packet_id = packet_id.to_string();
    packet
}

#[tokio::test]
async fn test_start_stream_quit() {
    let mut worker = Worker::new();

    worker.deliver(&start_packet("p-1", "session-1", "10.0.0.1:6000"));
    let started = worker.next_packet().await;
    assert_eq!(started.command(), Some(Command::Started));
    assert_eq!(started.packet_id, "p-1");
    assert_eq!(started.session_id, "session-1");

    let rsp = RoomStartRsp::from_data(&started.data).unwrap();
    assert!(!rsp.room_id.is_empty());
    assert!(rsp.room_id.ends_with("___grey"));
    let sdp = SdpDescriptor::from_data(&rsp.sdp).unwrap();
    assert_eq!(sdp.address, "127.0.0.1:10000");
    assert_eq!(sdp.audio_payload_type, 101);
    assert_eq!(sdp.video_payload_type, 102);

    let peer: SocketAddr = "10.0.0.1:6000".parse().unwrap();
    assert_eq!(
        worker.transports.opened.lock().as_slice(),
        &[("127.0.0.1:10000".parse().unwrap(), peer)]
    );

    // media flows to the peer
    tokio::time::timeout(Duration::from_secs(2), async {
        while worker.transports.packets.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no RTP packets sent");
    assert!(worker.transports.packets.lock().iter().all(|(to, _)| *to == peer));

    // the pool holds one pair only
    assert!(worker
        .handler
        .on_start(start_packet("p-2", "session-2", "10.0.0.2:6000"))
        .await
        .is_none());

    let quit = ControlPacket::new(Command::Quit, rsp.room_id.as_str()).with_session("session-1");
    worker.deliver(&quit);

    let closed = worker.next_packet().await;
    assert_eq!(closed.command(), Some(Command::CloseRoom));
    assert_eq!(closed.data, rsp.room_id);
    assert_eq!(worker.handler.stats().sessions, 0);
    assert_eq!(worker.handler.stats().ports_in_use, 0);

    // the released pair is handed out again
    worker.deliver(&start_packet("p-3", "session-3", "10.0.0.3:6000"));
    let restarted = worker.next_packet().await;
    assert_eq!(restarted.packet_id, "p-3");
    let rsp = RoomStartRsp::from_data(&restarted.data).unwrap();
    assert_eq!(
        SdpDescriptor::from_data(&rsp.sdp).unwrap().address,
        "127.0.0.1:10000"
    );

    worker.handler.shutdown();
    assert_eq!(worker.handler.stats().ports_in_use, 0);
}

#[tokio::test]
async fn test_worker_asks_coordinator_synchronously() {
    let mut worker = Worker::new();
    let client = worker.client.clone();

    let request = tokio::spawn(async move {
        client
            .send_sync(ControlPacket::new(Command::CloseRoom, "room-x").with_session("s"))
            .await
    });

    let outbound = worker.next_packet().await;
    assert_eq!(outbound.command(), Some(Command::CloseRoom));
    let mut ack = ControlPacket::new(Command::CloseRoom, "ack");
    ack.packet_id = outbound.packet_id.clone();
    worker.deliver(&ack);

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.data, "ack");
    assert_eq!(response.session_id, "s");
    assert_eq!(worker.client.pending_callbacks(), 0);
}
