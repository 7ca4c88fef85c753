//! Session registry and command handler
//!
//! One handler serves one control connection. It turns `start` into a bound
//! endpoint joined to a room, `quit` into the matching teardown, and
//! `close_room` into the teardown of a whole room. Rooms that close on their
//! own are reported back to the coordinator with a `close_room` packet.

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use mediarelay_proto::{Command, ControlPacket, Payload, RoomStartCall, RoomStartRsp, SdpDescriptor};

use crate::alert::spawn_guarded;
use crate::control::ControlClient;
use crate::endpoint::{EndpointSettings, EndpointStats, RtpEndpoint, TransportFactory};
use crate::error::{Error, Result};
use crate::ports::PortAllocator;
use crate::room::{Room, RoomServices, RoomStats};
use crate::types::{RoomId, SessionId};

/// A peer session: its endpoint and the room it streams from
pub struct Session {
    pub id: SessionId,
    pub endpoint: Arc<RtpEndpoint>,
    pub room: Weak<Room>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub sessions: usize,
    pub ports_in_use: usize,
    pub port_capacity: usize,
    pub rooms: Vec<RoomStats>,
    pub endpoints: Vec<EndpointStats>,
}

pub struct CommandHandler {
    client: Arc<ControlClient>,
    ports: Arc<PortAllocator>,
    services: RoomServices,
    transports: Arc<dyn TransportFactory>,
    endpoint_settings: Arc<EndpointSettings>,
    sessions: DashMap<SessionId, Session>,
    /// Sessions whose `start` is still binding
    starting: DashSet<SessionId>,
    rooms: DashMap<RoomId, Arc<Room>>,
    closed: AtomicBool,
}

/// Marks a session id as starting until dropped
struct StartReservation<'a> {
    starting: &'a DashSet<SessionId>,
    session_id: SessionId,
}

impl<'a> StartReservation<'a> {
    fn acquire(starting: &'a DashSet<SessionId>, session_id: &SessionId) -> Option<Self> {
        starting.insert(session_id.clone()).then(|| Self {
            starting,
            session_id: session_id.clone(),
        })
    }
}

impl Drop for StartReservation<'_> {
    fn drop(&mut self) {
        self.starting.remove(&self.session_id);
    }
}

impl CommandHandler {
    pub fn new(
        client: Arc<ControlClient>,
        ports: Arc<PortAllocator>,
        services: RoomServices,
        transports: Arc<dyn TransportFactory>,
    ) -> Result<Arc<Self>> {
        let endpoint_settings = Arc::new(EndpointSettings::from_config(&services.config)?);
        Ok(Arc::new(Self {
            client,
            ports,
            services,
            transports,
            endpoint_settings,
            sessions: DashMap::new(),
            starting: DashSet::new(),
            rooms: DashMap::new(),
            closed: AtomicBool::new(false),
        }))
    }

    /// Install the command handlers on the control client
    pub fn register(self: &Arc<Self>) {
        let handler = Arc::downgrade(self);
        self.client.receive(Command::Start, move |packet: ControlPacket| {
            let handler = handler.clone();
            async move {
                match handler.upgrade() {
                    Some(handler) => handler.on_start(packet).await,
                    None => None,
                }
            }
        });

        let handler = Arc::downgrade(self);
        self.client.receive(Command::Quit, move |packet: ControlPacket| {
            let handler = handler.upgrade();
            async move {
                if let Some(handler) = handler {
                    handler.on_quit(&packet);
                }
                None::<ControlPacket>
            }
        });

        let handler = Arc::downgrade(self);
        self.client.receive(Command::CloseRoom, move |packet: ControlPacket| {
            let handler = handler.upgrade();
            async move {
                if let Some(handler) = handler {
                    handler.on_close_room(&packet);
                }
                None::<ControlPacket>
            }
        });
    }

    /// Handle `start`. Any failure is logged and answered with no reply.
    pub async fn on_start(self: &Arc<Self>, packet: ControlPacket) -> Option<ControlPacket> {
        let call = match RoomStartCall::from_data(&packet.data) {
            Ok(call) => call,
            Err(e) => {
                warn!(session_id = %packet.session_id, error = %e, "Malformed start request");
                return None;
            }
        };
        if packet.session_id.is_empty() {
            warn!("Start request without session id");
            return None;
        }
        if self.is_closed() {
            debug!(session_id = %packet.session_id, "Start after shutdown ignored");
            return None;
        }
        let session_id = SessionId::from(packet.session_id.as_str());
        // reserve before checking the registry: a finished start is
        // registered before its reservation is released
        let Some(_reservation) = StartReservation::acquire(&self.starting, &session_id) else {
            warn!(session_id = %session_id, "Session is already starting");
            return None;
        };
        if self.sessions.contains_key(&session_id) {
            warn!(session_id = %session_id, "Session already started");
            return None;
        }

        match self.start_session(&session_id, &packet.room_id, &call).await {
            Ok((room_id, sdp)) => {
                info!(session_id = %session_id, room_id = %room_id, address = %sdp.address, "Session started");
                match started_reply(&room_id, &sdp) {
                    Ok(reply) => Some(reply.with_session(session_id.as_str())),
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "Failed to encode start reply");
                        None
                    }
                }
            }
            Err(e) => {
                warn!(session_id = %session_id, addr = %call.addr, error = %e, "Failed to start session");
                None
            }
        }
    }

    async fn start_session(
        self: &Arc<Self>,
        session_id: &SessionId,
        room_id: &str,
        call: &RoomStartCall,
    ) -> Result<(RoomId, SdpDescriptor)> {
        if !call.zone.is_empty() && call.zone != "udp" {
            debug!(session_id = %session_id, zone = %call.zone, "Treating peer network as udp");
        }

        let ports = self.ports.allot()?;
        let codecs = &self.services.config.encoder;
        let video_payload_type = match call.video_payload_type {
            0 => codecs.video.payload_type,
            pt => pt,
        };
        let audio_payload_type = match call.audio_payload_type {
            0 => codecs.audio.payload_type,
            pt => pt,
        };

        let endpoint = RtpEndpoint::new(
            session_id.clone(),
            ports,
            video_payload_type,
            audio_payload_type,
            self.endpoint_settings.clone(),
            self.transports.clone(),
            self.services.alerts.clone(),
        );

        let sdp = match endpoint.start_client(&call.addr).await {
            Ok(sdp) => sdp,
            Err(e) => {
                self.ports.release(ports.rtp);
                return Err(e);
            }
        };

        if self.is_closed() {
            endpoint.stop_client();
            self.ports.release(ports.rtp);
            return Err(Error::Closed);
        }

        let room = self.room_for(room_id, &call.name);
        if let Err(e) = room.add_connection(endpoint.clone()) {
            endpoint.stop_client();
            self.ports.release(ports.rtp);
            if room.is_empty() {
                room.close();
            }
            return Err(e);
        }

        self.sessions.insert(
            session_id.clone(),
            Session {
                id: session_id.clone(),
                endpoint: endpoint.clone(),
                room: Arc::downgrade(&room),
            },
        );
        self.watch_endpoint(endpoint);

        // shutdown either sees the session above or is seen here
        if self.is_closed() {
            self.detach_session(session_id);
            return Err(Error::Closed);
        }

        Ok((room.id().clone(), sdp))
    }

    /// Running room for `room_id`, created when unknown or closed. An empty
    /// id creates a new room.
    fn room_for(self: &Arc<Self>, room_id: &str, producer: &str) -> Arc<Room> {
        let id = if room_id.is_empty() {
            RoomId::generate(producer)
        } else {
            RoomId::from(room_id)
        };
        let producer = if producer.is_empty() {
            id.producer_name().unwrap_or_default().to_string()
        } else {
            producer.to_string()
        };

        let (room, created) = match self.rooms.entry(id.clone()) {
            Entry::Occupied(entry) if entry.get().is_running() => (entry.get().clone(), false),
            Entry::Occupied(mut entry) => {
                let room = Room::start(id, producer, &self.services);
                entry.insert(room.clone());
                (room, true)
            }
            Entry::Vacant(entry) => {
                let room = Room::start(id, producer, &self.services);
                entry.insert(room.clone());
                (room, true)
            }
        };

        if created {
            self.watch_room(&room);
        }
        room
    }

    /// Forget the room once it closed and tell the coordinator
    fn watch_room(self: &Arc<Self>, room: &Arc<Room>) {
        let Some(done) = room.take_done() else {
            return;
        };
        let handler = Arc::downgrade(self);
        let watched = Arc::downgrade(room);
        let room_id = room.id().clone();

        spawn_guarded(
            self.services.alerts.clone(),
            room_id.to_string(),
            "registry.room",
            async move {
                if done.await.is_err() {
                    return;
                }
                let Some(handler) = handler.upgrade() else {
                    return;
                };
                handler
                    .rooms
                    .remove_if(&room_id, |_, room| std::ptr::eq(Arc::as_ptr(room), watched.as_ptr()));
                info!(room_id = %room_id, "Room closed");

                if let Err(e) = handler
                    .client
                    .send(ControlPacket::close_room(room_id.as_str()), None)
                    .await
                {
                    debug!(room_id = %room_id, error = %e, "Could not report closed room");
                }
            },
        );
    }

    /// Detach the session once its endpoint stops on its own
    fn watch_endpoint(self: &Arc<Self>, endpoint: Arc<RtpEndpoint>) {
        let handler = Arc::downgrade(self);
        spawn_guarded(
            self.services.alerts.clone(),
            endpoint.session_id().to_string(),
            "registry.endpoint",
            async move {
                endpoint.closed().await;
                if let Some(handler) = handler.upgrade() {
                    handler.detach_session(endpoint.session_id());
                }
            },
        );
    }

    /// Handle `quit`: tear down the packet's session
    pub fn on_quit(&self, packet: &ControlPacket) {
        let session_id = SessionId::from(packet.session_id.as_str());
        if !self.detach_session(&session_id) {
            debug!(session_id = %session_id, room_id = %packet.data, "Quit for unknown session");
        }
    }

    /// Handle `close_room`: tear down every session of the room, then the
    /// room itself
    pub fn on_close_room(&self, packet: &ControlPacket) {
        let room_id = if packet.data.is_empty() {
            RoomId::from(packet.room_id.as_str())
        } else {
            RoomId::from(packet.data.as_str())
        };
        let Some(room) = self.rooms.get(&room_id).map(|r| r.value().clone()) else {
            debug!(room_id = %room_id, "Close for unknown room");
            return;
        };

        for endpoint in room.endpoints() {
            self.detach_session(endpoint.session_id());
        }
        room.close();
    }

    /// Stop the session's endpoint, release its ports and leave its room.
    /// Returns false when the session is unknown.
    pub fn detach_session(&self, session_id: &SessionId) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };

        session.endpoint.stop_client();
        self.ports.release(session.endpoint.ports().rtp);
        if let Some(room) = session.room.upgrade() {
            room.remove_session(&session.id);
        }
        info!(session_id = %session_id, "Session detached");
        true
    }

    /// Tear down every session and room of this connection. Starts still in
    /// flight are torn down when they finish.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let sessions: Vec<SessionId> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for session_id in &sessions {
            self.detach_session(session_id);
        }
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|r| r.value().clone()).collect();
        for room in rooms {
            room.close();
        }
        info!(client = %self.client.id(), sessions = sessions.len(), "Command handler shut down");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            sessions: self.sessions.len(),
            ports_in_use: self.ports.in_use(),
            port_capacity: self.ports.capacity(),
            rooms: self.rooms.iter().map(|r| r.value().stats()).collect(),
            endpoints: self.sessions.iter().map(|s| s.endpoint.stats()).collect(),
        }
    }
}

fn started_reply(room_id: &RoomId, sdp: &SdpDescriptor) -> Result<ControlPacket> {
    let rsp = RoomStartRsp {
        room_id: room_id.to_string(),
        sdp: sdp.to_data()?,
    };
    Ok(ControlPacket::new(Command::Started, rsp.to_data()?).with_room(room_id.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LogAlertSink;
    use crate::endpoint::transport::testing::MockTransportFactory;
    use crate::room::testing;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        handler: Arc<CommandHandler>,
        client: Arc<ControlClient>,
        out: mpsc::Receiver<String>,
        transports: Arc<MockTransportFactory>,
        ports: Arc<PortAllocator>,
    }

    fn fixture(port_end: u16) -> Fixture {
        let mut config = testing::config();
        config.ports.start = 10000;
        config.ports.end = port_end;
        let (services, _events) = testing::services(config.clone(), 0);

        let (tx, out) = mpsc::channel(16);
        let client = ControlClient::new("coordinator", tx, Arc::new(LogAlertSink::default()));
        let ports = Arc::new(PortAllocator::new(&config.ports));
        let transports = Arc::new(MockTransportFactory::default());
        let handler =
            CommandHandler::new(client.clone(), ports.clone(), services, transports.clone()).unwrap();
        handler.register();
        Fixture {
            handler,
            client,
            out,
            transports,
            ports,
        }
    }

    fn start(session: &str, room: &str, addr: &str) -> ControlPacket {
        let call = RoomStartCall {
            name: "scripted".to_string(),
            audio_payload_type: 0,
            video_payload_type: 0,
            zone: String::new(),
            addr: addr.to_string(),
        };
        ControlPacket::new(Command::Start, call.to_data().unwrap())
            .with_session(session)
            .with_room(room)
    }

    async fn next_packet(out: &mut mpsc::Receiver<String>) -> ControlPacket {
        let raw = tokio::time::timeout(Duration::from_secs(2), out.recv())
            .await
            .unwrap()
            .unwrap();
        ControlPacket::from_json(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_two_sessions_share_a_room() {
        let fx = fixture(10010);

        let first = fx.handler.on_start(start("s1", "", "10.0.0.1:6000")).await.unwrap();
        let rsp = RoomStartRsp::from_data(&first.data).unwrap();
        assert_eq!(first.room_id, rsp.room_id);
        assert!(rsp.room_id.ends_with("___scripted"));
        let sdp = SdpDescriptor::from_data(&rsp.sdp).unwrap();
        assert_eq!(sdp.address, "127.0.0.1:10000");
        assert_eq!(sdp.video_payload_type, 102);

        let second = fx
            .handler
            .on_start(start("s2", &rsp.room_id, "10.0.0.2:6000"))
            .await
            .unwrap();
        assert_eq!(RoomStartRsp::from_data(&second.data).unwrap().room_id, rsp.room_id);

        let stats = fx.handler.stats();
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.ports_in_use, 2);
        assert_eq!(stats.rooms.len(), 1);
        assert_eq!(stats.rooms[0].members, 2);

        // duplicate start for a live session gets no reply
        assert!(fx.handler.on_start(start("s1", "", "10.0.0.1:6000")).await.is_none());
        assert_eq!(fx.ports.in_use(), 2);
    }

    #[tokio::test]
    async fn test_failures_answer_nothing_and_leak_nothing() {
        let fx = fixture(10002);

        assert!(fx.handler.on_start(start("s1", "", "10.0.0.1:6000")).await.is_some());
        // pool exhausted
        assert!(fx.handler.on_start(start("s2", "", "10.0.0.2:6000")).await.is_none());
        assert_eq!(fx.ports.in_use(), 1);

        fx.handler.detach_session(&SessionId::from("s1"));
        fx.transports.fail_bind.store(true, Ordering::SeqCst);
        assert!(fx.handler.on_start(start("s3", "", "10.0.0.3:6000")).await.is_none());
        assert_eq!(fx.ports.in_use(), 0);
        assert_eq!(fx.handler.session_count(), 0);

        let mut bad = start("s4", "", "10.0.0.4:6000");
        bad.data = "{".to_string();
        assert!(fx.handler.on_start(bad).await.is_none());
    }

    #[tokio::test]
    async fn test_quit_closes_room_and_notifies_coordinator() {
        let mut fx = fixture(10010);

        let mut request = start("s1", "", "10.0.0.1:6000");
        request.packet_id = "req-1".to_string();
        fx.client.handle_message(&request.to_json().unwrap());
        let started = next_packet(&mut fx.out).await;
        assert_eq!(started.command(), Some(Command::Started));
        assert_eq!(started.packet_id, "req-1");
        assert_eq!(started.session_id, "s1");
        let room_id = RoomId::from(started.room_id.as_str());
        assert!(fx.handler.room(&room_id).is_some());

        let quit = ControlPacket::new(Command::Quit, room_id.as_str()).with_session("s1");
        fx.client.handle_message(&quit.to_json().unwrap());

        let closed = next_packet(&mut fx.out).await;
        assert_eq!(closed.command(), Some(Command::CloseRoom));
        assert_eq!(closed.data, room_id.as_str());
        assert_eq!(closed.room_id, room_id.as_str());
        assert!(fx.handler.room(&room_id).is_none());
        assert_eq!(fx.ports.in_use(), 0);
    }

    #[tokio::test]
    async fn test_endpoint_failure_detaches_session() {
        let mut fx = fixture(10010);
        let started = fx.handler.on_start(start("s1", "", "10.0.0.1:6000")).await.unwrap();
        let room_id = RoomId::from(started.room_id.as_str());

        let transport = fx.transports.transport("10.0.0.1:6000").unwrap();
        transport.fail_writes.store(true, Ordering::SeqCst);
        let room = fx.handler.room(&room_id).unwrap();
        room.broadcast(&crate::endpoint::testing::sample()).await;

        let closed = next_packet(&mut fx.out).await;
        assert_eq!(closed.command(), Some(Command::CloseRoom));
        assert_eq!(fx.handler.session_count(), 0);
        assert_eq!(fx.ports.in_use(), 0);
    }

    #[tokio::test]
    async fn test_close_room_from_coordinator() {
        let fx = fixture(10010);
        let first = fx.handler.on_start(start("s1", "", "10.0.0.1:6000")).await.unwrap();
        fx.handler
            .on_start(start("s2", &first.room_id, "10.0.0.2:6000"))
            .await
            .unwrap();
        let room_id = RoomId::from(first.room_id.as_str());
        let room = fx.handler.room(&room_id).unwrap();

        fx.handler.on_close_room(&ControlPacket::close_room(room_id.as_str()));
        assert!(!room.is_running());
        assert_eq!(fx.handler.session_count(), 0);
        assert_eq!(fx.ports.in_use(), 0);

        // a closed room id starts a fresh room
        let again = fx
            .handler
            .on_start(start("s3", room_id.as_str(), "10.0.0.3:6000"))
            .await
            .unwrap();
        assert_eq!(again.room_id, room_id.as_str());
        assert!(fx.handler.room(&room_id).unwrap().is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_starts_for_one_session_keep_one_endpoint() {
        let fx = fixture(10010);
        fx.transports.open_delay_ms.store(20, Ordering::SeqCst);

        let first = {
            let handler = fx.handler.clone();
            tokio::spawn(async move { handler.on_start(start("s1", "r1", "10.0.0.1:6000")).await })
        };
        let second = {
            let handler = fx.handler.clone();
            tokio::spawn(async move { handler.on_start(start("s1", "r1", "10.0.0.2:6000")).await })
        };
        let (first, second) = (first.await.unwrap(), second.await.unwrap());

        assert_eq!(usize::from(first.is_some()) + usize::from(second.is_some()), 1);
        assert_eq!(fx.handler.session_count(), 1);
        assert_eq!(fx.ports.in_use(), 1);

        assert!(fx.handler.detach_session(&SessionId::from("s1")));
        assert_eq!(fx.ports.in_use(), 0);

        // the id is free again once the session is gone
        fx.transports.open_delay_ms.store(0, Ordering::SeqCst);
        assert!(fx.handler.on_start(start("s1", "r1", "10.0.0.3:6000")).await.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_start_in_flight() {
        let fx = fixture(10010);
        fx.transports.open_delay_ms.store(50, Ordering::SeqCst);

        let pending = {
            let handler = fx.handler.clone();
            tokio::spawn(async move { handler.on_start(start("s1", "", "10.0.0.1:6000")).await })
        };
        // the pair is allotted before the transport opens
        tokio::time::timeout(Duration::from_secs(2), async {
            while fx.ports.in_use() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        fx.handler.shutdown();
        assert!(pending.await.unwrap().is_none());
        assert_eq!(fx.handler.session_count(), 0);
        assert_eq!(fx.ports.in_use(), 0);
        assert!(fx.handler.stats().rooms.iter().all(|r| !r.running));

        // later starts are refused outright
        assert!(fx.handler.on_start(start("s2", "", "10.0.0.2:6000")).await.is_none());
        assert_eq!(fx.ports.in_use(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let fx = fixture(10010);
        fx.handler.on_start(start("s1", "", "10.0.0.1:6000")).await.unwrap();
        fx.handler.on_start(start("s2", "", "10.0.0.2:6000")).await.unwrap();

        fx.handler.shutdown();
        assert_eq!(fx.handler.session_count(), 0);
        assert_eq!(fx.ports.in_use(), 0);
        assert!(fx.handler.stats().rooms.iter().all(|r| !r.running));
    }
}
