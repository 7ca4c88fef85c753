//! Per-peer RTP egress endpoint
//!
//! ```text
//!  Idle ──start_client──► Connecting ──bound──► Streaming
//!   ▲                        │                     │
//!   └──────── failure ───────┘                     │ write failure / stop_client
//!                                                  ▼
//!            (any state) ──── stop_client ────► Stopped (terminal)
//! ```
//!
//! A live session owns one writer task per media type, each draining its own
//! bounded sample queue into the transport, and one reader task that turns
//! inbound datagrams into raw peer input.

pub mod rtp;
pub mod transport;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use mediarelay_proto::SdpDescriptor;

use crate::alert::{panic_message, spawn_guarded, AlertSink, PanicAlert};
use crate::config::{AudioCodecConfig, Config, EndpointConfig, VideoCodecConfig};
use crate::error::{Error, Result};
use crate::media::EncodedSample;
use crate::ports::PortSuite;
use crate::types::SessionId;

pub use self::rtp::RtpTrack;
pub use transport::{PacketTransport, TransportFactory, UdpTransportFactory};

const INPUT_BUFFER_LEN: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    Idle,
    Connecting,
    Streaming,
    Stopped,
}

/// Media parameters shared by every endpoint of a worker
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    pub local_ip: IpAddr,
    pub fps: u32,
    pub video: VideoCodecConfig,
    pub audio: AudioCodecConfig,
    pub queues: EndpointConfig,
}

impl EndpointSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let local_ip = config
            .media
            .local_ip
            .parse()
            .map_err(|_| Error::InvalidAddress(config.media.local_ip.clone()))?;
        Ok(Self {
            local_ip,
            fps: config.media.fps,
            video: config.encoder.video.clone(),
            audio: config.encoder.audio.clone(),
            queues: config.endpoint.clone(),
        })
    }
}

#[derive(Debug, Default)]
struct Counters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    samples_written: AtomicU64,
    write_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub session_id: String,
    pub state: EndpointState,
    pub rtp_port: u16,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub samples_written: u64,
    pub write_failures: u64,
}

#[derive(Debug, Clone, Copy)]
enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    const fn scope(self) -> &'static str {
        match self {
            Self::Video => "endpoint.video",
            Self::Audio => "endpoint.audio",
        }
    }
}

/// Sample queues of a bound session. Dropping it ends every task of the
/// session.
struct LiveSession {
    video_tx: mpsc::Sender<Bytes>,
    audio_tx: Option<mpsc::Sender<Bytes>>,
    cancel: CancellationToken,
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Stops the endpoint if a session task unwinds
struct StopOnPanic(Weak<RtpEndpoint>);

impl Drop for StopOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            if let Some(endpoint) = self.0.upgrade() {
                endpoint.stop_client();
            }
        }
    }
}

pub struct RtpEndpoint {
    session_id: SessionId,
    ports: PortSuite,
    video_payload_type: u8,
    audio_payload_type: u8,
    settings: Arc<EndpointSettings>,
    transports: Arc<dyn TransportFactory>,
    alerts: Arc<dyn AlertSink>,
    state: Mutex<EndpointState>,
    connected: AtomicBool,
    live: Mutex<Option<LiveSession>>,
    input: Mutex<Option<mpsc::Receiver<Bytes>>>,
    closed: CancellationToken,
    counters: Counters,
}

impl RtpEndpoint {
    pub fn new(
        session_id: SessionId,
        ports: PortSuite,
        video_payload_type: u8,
        audio_payload_type: u8,
        settings: Arc<EndpointSettings>,
        transports: Arc<dyn TransportFactory>,
        alerts: Arc<dyn AlertSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            ports,
            video_payload_type,
            audio_payload_type,
            settings,
            transports,
            alerts,
            state: Mutex::new(EndpointState::Idle),
            connected: AtomicBool::new(false),
            live: Mutex::new(None),
            input: Mutex::new(None),
            closed: CancellationToken::new(),
            counters: Counters::default(),
        })
    }

    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    #[must_use]
    pub const fn ports(&self) -> PortSuite {
        self.ports
    }

    #[must_use]
    pub fn state(&self) -> EndpointState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Local media description advertised to the peer
    #[must_use]
    pub fn sdp(&self) -> SdpDescriptor {
        SdpDescriptor {
            address: SocketAddr::new(self.settings.local_ip, self.ports.rtp).to_string(),
            audio_payload_type: self.audio_payload_type,
            video_payload_type: self.video_payload_type,
        }
    }

    /// Bind the session and start streaming to `peer` (`ip:port`).
    ///
    /// A streaming endpoint is halted and given the settle delay before it
    /// is rebound. On failure the endpoint falls back to `Idle`.
    pub async fn start_client(self: &Arc<Self>, peer: &str) -> Result<SdpDescriptor> {
        let peer: SocketAddr = peer
            .parse()
            .map_err(|_| Error::InvalidAddress(peer.to_string()))?;

        if self.closed.is_cancelled() {
            return Err(Error::EndpointStopped(self.session_id.to_string()));
        }

        if self.is_connected() {
            info!(session_id = %self.session_id, %peer, "Rebinding live endpoint");
            self.halt();
            tokio::time::sleep(self.settings.queues.settle_delay()).await;
        }

        self.transition(EndpointState::Connecting);

        match AssertUnwindSafe(self.connect(peer)).catch_unwind().await {
            Ok(Ok(live)) => {
                {
                    // stop_client marks Stopped under this lock before it
                    // halts, so either it sees `connected` or we see Stopped
                    let mut state = self.state.lock();
                    if *state == EndpointState::Stopped {
                        drop(state);
                        drop(live);
                        return Err(Error::EndpointStopped(self.session_id.to_string()));
                    }
                    *self.live.lock() = Some(live);
                    self.connected.store(true, Ordering::SeqCst);
                    *state = EndpointState::Streaming;
                }
                info!(
                    session_id = %self.session_id,
                    %peer,
                    rtp_port = self.ports.rtp,
                    "Endpoint streaming"
                );
                Ok(self.sdp())
            }
            Ok(Err(e)) => {
                warn!(session_id = %self.session_id, %peer, error = %e, "Failed to start endpoint");
                self.transition(EndpointState::Idle);
                Err(e)
            }
            Err(payload) => {
                self.alerts.report(PanicAlert {
                    service: self.alerts.service_name().to_string(),
                    context: self.session_id.to_string(),
                    scope: "endpoint.start".to_string(),
                    message: panic_message(payload.as_ref()),
                });
                self.stop_client();
                Err(Error::EndpointStopped(self.session_id.to_string()))
            }
        }
    }

    async fn connect(self: &Arc<Self>, peer: SocketAddr) -> Result<LiveSession> {
        let ip = self.settings.local_ip;
        let transport = self
            .transports
            .open(
                SocketAddr::new(ip, self.ports.rtp),
                SocketAddr::new(ip, self.ports.rtcp),
                peer,
            )
            .await?;

        let queues = &self.settings.queues;
        let video = RtpTrack::video(
            &self.settings.video,
            self.video_payload_type,
            self.settings.fps,
            queues.mtu,
        )?;
        let audio = if self.settings.audio.enabled() {
            Some(RtpTrack::audio(
                &self.settings.audio,
                self.audio_payload_type,
                queues.mtu,
            )?)
        } else {
            None
        };

        let cancel = CancellationToken::new();

        let (video_tx, video_rx) = mpsc::channel(queues.video_queue_capacity);
        self.spawn_writer(MediaKind::Video, video, video_rx, transport.clone(), cancel.clone());

        let audio_tx = audio.map(|track| {
            let (tx, rx) = mpsc::channel(queues.audio_queue_capacity);
            self.spawn_writer(MediaKind::Audio, track, rx, transport.clone(), cancel.clone());
            tx
        });

        let (input_tx, input_rx) = mpsc::channel(queues.input_queue_capacity);
        spawn_guarded(
            self.alerts.clone(),
            self.session_id.to_string(),
            "endpoint.input",
            read_input(
                self.session_id.clone(),
                transport,
                input_tx,
                queues.read_timeout(),
                cancel.clone(),
            ),
        );
        *self.input.lock() = Some(input_rx);

        Ok(LiveSession {
            video_tx,
            audio_tx,
            cancel,
        })
    }

    fn spawn_writer(
        self: &Arc<Self>,
        kind: MediaKind,
        mut track: RtpTrack,
        mut samples: mpsc::Receiver<Bytes>,
        transport: Arc<dyn PacketTransport>,
        cancel: CancellationToken,
    ) {
        let endpoint = Arc::downgrade(self);
        let session_id = self.session_id.clone();
        spawn_guarded(self.alerts.clone(), session_id.to_string(), kind.scope(), async move {
            let _guard = StopOnPanic(endpoint.clone());
            debug!(session_id = %session_id, ?kind, ssrc = track.ssrc(), "Sample writer started");

            loop {
                let sample = tokio::select! {
                    () = cancel.cancelled() => break,
                    sample = samples.recv() => match sample {
                        Some(sample) => sample,
                        None => break,
                    },
                };
                let Some(endpoint) = endpoint.upgrade() else {
                    break;
                };
                if let Err(e) = endpoint.write_sample(&mut track, &sample, transport.as_ref()).await {
                    endpoint.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(session_id = %session_id, ?kind, error = %e, "Sample write failed, stopping endpoint");
                    endpoint.stop_client();
                    break;
                }
            }

            debug!(session_id = %session_id, ?kind, "Sample writer finished");
        });
    }

    async fn write_sample(
        &self,
        track: &mut RtpTrack,
        sample: &Bytes,
        transport: &dyn PacketTransport,
    ) -> Result<()> {
        for packet in track.packetize(sample)? {
            let written = transport.send(&packet).await?;
            self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
            self.counters.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
        }
        self.counters.samples_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queue an encoded video sample, waiting while this endpoint's queue is
    /// full
    pub async fn push_video(&self, sample: &EncodedSample) -> Result<()> {
        let tx = self
            .live
            .lock()
            .as_ref()
            .map(|live| live.video_tx.clone())
            .ok_or(Error::Closed)?;
        tx.send(sample.data.clone()).await.map_err(|_| Error::Closed)
    }

    pub async fn push_audio(&self, sample: Bytes) -> Result<()> {
        let tx = self
            .live
            .lock()
            .as_ref()
            .and_then(|live| live.audio_tx.clone())
            .ok_or(Error::Closed)?;
        tx.send(sample).await.map_err(|_| Error::Closed)
    }

    /// Raw inbound peer input of the current session; can be taken once
    pub fn take_input(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.input.lock().take()
    }

    /// Stop streaming for good and fire the `closed` signal. Later calls are
    /// no-ops.
    pub fn stop_client(&self) {
        {
            let mut state = self.state.lock();
            if *state == EndpointState::Stopped {
                return;
            }
            *state = EndpointState::Stopped;
        }
        self.halt();
        self.closed.cancel();
        info!(session_id = %self.session_id, "Endpoint stopped");
    }

    /// Resolves once the endpoint reached `Stopped`
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.closed.is_cancelled()
    }

    #[must_use]
    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            session_id: self.session_id.to_string(),
            state: self.state(),
            rtp_port: self.ports.rtp,
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            samples_written: self.counters.samples_written.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
        }
    }

    /// Tear the live session down without touching the lifecycle state
    fn halt(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        drop(self.live.lock().take());
        debug!(session_id = %self.session_id, "Session halted");
    }

    fn transition(&self, next: EndpointState) {
        let mut state = self.state.lock();
        if *state != EndpointState::Stopped {
            *state = next;
        }
    }
}

async fn read_input(
    session_id: SessionId,
    transport: Arc<dyn PacketTransport>,
    input: mpsc::Sender<Bytes>,
    deadline: Duration,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; INPUT_BUFFER_LEN];
    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => break,
            read = tokio::time::timeout(deadline, transport.recv(&mut buf)) => read,
        };
        match read {
            Err(_) => {
                debug!(session_id = %session_id, "No inbound traffic before deadline, input ends");
                break;
            }
            Ok(Err(e)) => {
                debug!(session_id = %session_id, error = %e, "Inbound read failed, input ends");
                break;
            }
            Ok(Ok(n)) => match input.try_send(Bytes::copy_from_slice(&buf[..n])) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => trace!(session_id = %session_id, "Input queue full, dropping"),
                Err(TrySendError::Closed(_)) => break,
            },
        }
    }
}
