//! Room: one producer, one encoding pipeline, N egress endpoints
//!
//! ```text
//!  producer ─► frames ─► EncodingPipeline ─► broadcast ─┬─► endpoint A
//!     ▲                                                 └─► endpoint B
//!     └──── InputEvent ◄── per-endpoint input forwarders
//! ```
//!
//! Membership is only mutated under one lock. The room closes exactly once,
//! either when its last member leaves or when it is closed explicitly; after
//! that it never accepts members again.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::alert::{spawn_guarded, AlertSink};
use crate::config::Config;
use crate::endpoint::RtpEndpoint;
use crate::error::{Error, Result};
use crate::media::{EncodedSample, EncoderFactory, EncodingPipeline};
use crate::producer::{InputEvent, ProducerContext, ProducerFactory, ProducerSettings};
use crate::types::{RoomId, SessionId};

/// Collaborators a room needs to start its media
#[derive(Clone)]
pub struct RoomServices {
    pub producers: Arc<dyn ProducerFactory>,
    pub encoders: Arc<dyn EncoderFactory>,
    pub config: Arc<Config>,
    pub alerts: Arc<dyn AlertSink>,
}

struct Member {
    endpoint: Arc<RtpEndpoint>,
    player: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub room_id: String,
    pub producer: String,
    pub members: usize,
    pub running: bool,
}

pub struct Room {
    id: RoomId,
    producer: String,
    max_peers: usize,
    alerts: Arc<dyn AlertSink>,
    running: AtomicBool,
    members: Mutex<Vec<Member>>,
    input: Mutex<Option<mpsc::Sender<InputEvent>>>,
    cancel: CancellationToken,
    done_tx: Mutex<Option<oneshot::Sender<()>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Room {
    /// Create the room and start its media in the background
    pub fn start(id: RoomId, producer: impl Into<String>, services: &RoomServices) -> Arc<Self> {
        let producer = producer.into();
        let (input_tx, input_rx) = mpsc::channel(services.config.room.input_capacity.max(1));
        let (done_tx, done_rx) = oneshot::channel();

        let room = Arc::new(Self {
            id,
            producer,
            max_peers: services.config.room.max_peers,
            alerts: services.alerts.clone(),
            running: AtomicBool::new(true),
            members: Mutex::new(Vec::new()),
            input: Mutex::new(Some(input_tx)),
            cancel: CancellationToken::new(),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx: Mutex::new(Some(done_rx)),
        });

        info!(room_id = %room.id, producer = %room.producer, "Room created");

        spawn_guarded(
            services.alerts.clone(),
            room.id.to_string(),
            "room.media",
            run_media(Arc::downgrade(&room), services.clone(), input_rx),
        );

        room
    }

    #[must_use]
    pub const fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register a bound endpoint and forward its inbound input to the
    /// producer
    pub fn add_connection(self: &Arc<Self>, endpoint: Arc<RtpEndpoint>) -> Result<()> {
        let session = endpoint.session_id().clone();
        let player = {
            let mut members = self.members.lock();
            if !self.is_running() {
                return Err(Error::Closed);
            }
            if members.iter().any(|m| m.endpoint.session_id() == &session) {
                return Ok(());
            }
            if self.max_peers > 0 && members.len() >= self.max_peers {
                return Err(Error::RoomFull(self.id.to_string()));
            }
            // lowest slot nobody holds, so remaining players keep theirs
            let player = (0..=u8::MAX)
                .find(|slot| members.iter().all(|m| m.player != *slot))
                .unwrap_or(u8::MAX);
            members.push(Member {
                endpoint: endpoint.clone(),
                player,
            });
            player
        };

        info!(room_id = %self.id, session_id = %session, player, "Session joined room");

        if let Some(raw) = endpoint.take_input() {
            spawn_guarded(
                self.alerts.clone(),
                session.to_string(),
                "room.input",
                forward_input(Arc::downgrade(self), session, player, raw),
            );
        }
        Ok(())
    }

    /// Tell the producer a session left, then unregister it. Closes the
    /// room when it was the last member.
    pub fn remove_session(&self, session: &SessionId) -> bool {
        let now_empty = {
            let mut members = self.members.lock();
            let Some(index) = members.iter().position(|m| m.endpoint.session_id() == session) else {
                return false;
            };
            self.send_input(InputEvent::Disconnect {
                session: session.clone(),
            });
            members.remove(index);
            members.is_empty()
        };

        info!(room_id = %self.id, session_id = %session, "Session left room");

        if now_empty {
            self.close();
        }
        true
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    /// Whether any member is still streaming
    #[must_use]
    pub fn is_running_sessions(&self) -> bool {
        self.members.lock().iter().any(|m| m.endpoint.is_connected())
    }

    #[must_use]
    pub fn contains(&self, session: &SessionId) -> bool {
        self.members
            .lock()
            .iter()
            .any(|m| m.endpoint.session_id() == session)
    }

    /// Current member endpoints
    #[must_use]
    pub fn endpoints(&self) -> Vec<Arc<RtpEndpoint>> {
        self.members.lock().iter().map(|m| m.endpoint.clone()).collect()
    }

    /// Stop the producer, close the input queue and fire the done signal.
    /// Only the first call has an effect.
    pub fn close(&self) {
        {
            let _members = self.members.lock();
            if !self.running.swap(false, Ordering::SeqCst) {
                return;
            }
        }

        info!(room_id = %self.id, "Closing room");
        self.cancel.cancel();
        drop(self.input.lock().take());
        if let Some(done) = self.done_tx.lock().take() {
            let _ = done.send(());
        }
    }

    /// Done signal; resolves once the room closed. Can be taken once.
    pub fn take_done(&self) -> Option<oneshot::Receiver<()>> {
        self.done_rx.lock().take()
    }

    /// Hand a sample to every connected member. Each endpoint queue is
    /// awaited on its own; a full queue delays this call but never drops
    /// the sample for that endpoint.
    pub async fn broadcast(&self, sample: &EncodedSample) {
        let targets: Vec<Arc<RtpEndpoint>> = self
            .members
            .lock()
            .iter()
            .filter(|m| m.endpoint.is_connected())
            .map(|m| m.endpoint.clone())
            .collect();

        let results = join_all(targets.iter().map(|endpoint| endpoint.push_video(sample))).await;
        for (endpoint, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                trace!(room_id = %self.id, session_id = %endpoint.session_id(), error = %e, "Skipped endpoint");
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> RoomStats {
        RoomStats {
            room_id: self.id.to_string(),
            producer: self.producer.clone(),
            members: self.members.lock().len(),
            running: self.is_running(),
        }
    }

    fn send_input(&self, event: InputEvent) {
        if let Some(input) = self.input.lock().as_ref() {
            if input.try_send(event).is_err() {
                trace!(room_id = %self.id, "Room input queue full, dropping event");
            }
        }
    }
}

async fn forward_input(
    room: Weak<Room>,
    session: SessionId,
    player: u8,
    mut raw: mpsc::Receiver<bytes::Bytes>,
) {
    while let Some(bytes) = raw.recv().await {
        let Some(room) = room.upgrade() else {
            break;
        };
        if !room.is_running() || !room.contains(&session) {
            break;
        }
        match InputEvent::parse(&bytes, player, &session) {
            Ok(event) => room.send_input(event),
            Err(e) => debug!(session_id = %session, error = %e, "Ignoring peer input"),
        }
    }
    debug!(session_id = %session, "Peer input stream finished");
}

async fn run_media(room: Weak<Room>, services: RoomServices, input: mpsc::Receiver<InputEvent>) {
    let Some((room_id, producer_name, cancel)) = room
        .upgrade()
        .map(|r| (r.id.clone(), r.producer.clone(), r.cancel.clone()))
    else {
        return;
    };
    let config = &services.config;
    let (width, height) = (config.media.width, config.media.height);

    let settings = ProducerSettings::from_config(config, &room_id);
    let producer = match services.producers.create(&producer_name, &settings) {
        Ok(producer) => producer,
        Err(e) => {
            error!(room_id = %room_id, error = %e, "Room has no media");
            return;
        }
    };
    let encoder = match services.encoders.create(&config.encoder.video, width, height) {
        Ok(encoder) => encoder,
        Err(e) => {
            error!(room_id = %room_id, error = %e, "Room has no media");
            return;
        }
    };

    let (pipeline, mut output) = EncodingPipeline::start(
        room_id.to_string(),
        encoder,
        width,
        height,
        &config.pipeline,
        services.alerts.clone(),
    );
    let Some(pipeline_input) = pipeline.input() else {
        return;
    };

    let (frames_tx, mut frames_rx) = mpsc::channel(config.pipeline.input_capacity.max(1));
    let ctx = ProducerContext {
        room_id: room_id.clone(),
        width,
        height,
        fps: config.media.fps,
        clock_rate: config.encoder.video.clock_rate,
        frames: frames_tx,
        input,
        cancel: cancel.clone(),
    };
    let producer_room = room_id.clone();
    spawn_guarded(services.alerts.clone(), room_id.to_string(), "room.producer", async move {
        if let Err(e) = producer.run(ctx).await {
            warn!(room_id = %producer_room, error = %e, "Producer failed");
        }
    });

    debug!(room_id = %room_id, "Room media started");

    let forward = async {
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => break,
                frame = frames_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            match pipeline_input.offer(frame, &cancel).await {
                Ok(true) => {}
                Ok(false) | Err(_) => break,
            }
        }
        pipeline.stop().await;
    };

    let fan_out = async {
        while let Some(sample) = output.recv().await {
            // keep draining after the room is gone so the pipeline can stop
            if let Some(room) = room.upgrade() {
                room.broadcast(&sample).await;
            }
        }
    };

    tokio::join!(forward, fan_out);
    debug!(room_id = %room_id, "Room media stopped");
}
