//! Correlated request/response client for the control channel
//!
//! Outbound requests get a fresh `packet_id`. An inbound packet whose
//! `packet_id` matches a pending request completes that request and is not
//! dispatched any further; everything else goes to the handler registered
//! for its command. Every dispatch runs in its own guarded task.

use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use mediarelay_proto::{Command, ControlPacket};

use crate::alert::{spawn_guarded, AlertSink};
use crate::error::{Error, Result};

/// Completion of an outbound request
pub type Callback = Box<dyn FnOnce(ControlPacket) + Send + Sync>;

/// Handles unsolicited packets of one command.
///
/// Returning `None` sends no reply. A returned packet is sent back with the
/// request's `packet_id` and `session_id`.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle(&self, packet: ControlPacket) -> Option<ControlPacket>;
}

#[async_trait]
impl<F, Fut> PacketHandler for F
where
    F: Fn(ControlPacket) -> Fut + Send + Sync,
    Fut: Future<Output = Option<ControlPacket>> + Send + 'static,
{
    async fn handle(&self, packet: ControlPacket) -> Option<ControlPacket> {
        self(packet).await
    }
}

struct Pending {
    session_id: String,
    callback: Callback,
}

pub struct ControlClient {
    id: String,
    outbound: mpsc::Sender<String>,
    handlers: DashMap<Command, Arc<dyn PacketHandler>>,
    pending: DashMap<String, Pending>,
    alerts: Arc<dyn AlertSink>,
    closed: AtomicBool,
}

impl ControlClient {
    /// `outbound` carries serialized packets to the transport
    pub fn new(
        id: impl Into<String>,
        outbound: mpsc::Sender<String>,
        alerts: Arc<dyn AlertSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            outbound,
            handlers: DashMap::new(),
            pending: DashMap::new(),
            alerts,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register the handler for inbound packets carrying `command`
    pub fn receive<H>(&self, command: Command, handler: H)
    where
        H: PacketHandler + 'static,
    {
        self.handlers.insert(command, Arc::new(handler));
    }

    /// Send `packet` under a new correlation id; `callback` runs once with
    /// the matching response. Returns the correlation id.
    pub async fn send(&self, mut packet: ControlPacket, callback: Option<Callback>) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let packet_id = Uuid::new_v4().to_string();
        packet.packet_id.clone_from(&packet_id);
        let json = packet.to_json()?;

        if let Some(callback) = callback {
            self.pending.insert(
                packet_id.clone(),
                Pending {
                    session_id: packet.session_id.clone(),
                    callback,
                },
            );
        }

        if self.outbound.send(json).await.is_err() {
            self.pending.remove(&packet_id);
            return Err(Error::Closed);
        }
        trace!(client = %self.id, command = %packet.id, packet_id = %packet_id, "Packet sent");
        Ok(packet_id)
    }

    /// Send `packet` and wait for its response
    pub async fn send_sync(&self, packet: ControlPacket) -> Result<ControlPacket> {
        let (tx, rx) = oneshot::channel();
        self.send(
            packet,
            Some(Box::new(move |response| {
                let _ = tx.send(response);
            })),
        )
        .await?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Process one inbound message
    pub fn handle_message(self: &Arc<Self>, raw: &str) {
        let packet = match ControlPacket::from_json(raw) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(client = %self.id, error = %e, "Dropping malformed control message");
                return;
            }
        };

        if let Some((packet_id, pending)) = self.pending.remove(&packet.packet_id) {
            let mut response = packet;
            response.packet_id = packet_id;
            response.session_id = pending.session_id;
            let context = response.session_id.clone();
            spawn_guarded(self.alerts.clone(), context, "control.callback", async move {
                (pending.callback)(response);
            });
            return;
        }

        let handler = packet
            .command()
            .and_then(|command| self.handlers.get(&command).map(|h| h.value().clone()));
        let Some(handler) = handler else {
            debug!(client = %self.id, command = %packet.id, "No handler for control packet");
            return;
        };

        let client = self.clone();
        let context = if packet.session_id.is_empty() {
            self.id.clone()
        } else {
            packet.session_id.clone()
        };
        spawn_guarded(self.alerts.clone(), context, "control.dispatch", async move {
            let packet_id = packet.packet_id.clone();
            let session_id = packet.session_id.clone();
            if let Some(mut reply) = handler.handle(packet).await {
                reply.packet_id = packet_id;
                reply.session_id = session_id;
                client.reply(reply).await;
            }
        });
    }

    async fn reply(&self, reply: ControlPacket) {
        match reply.to_json() {
            Ok(json) => {
                if self.outbound.send(json).await.is_err() {
                    debug!(client = %self.id, "Reply dropped, control channel closed");
                }
            }
            Err(e) => warn!(client = %self.id, error = %e, "Failed to encode reply"),
        }
    }

    /// Requests still waiting for a response
    #[must_use]
    pub fn pending_callbacks(&self) -> usize {
        self.pending.len()
    }

    /// Refuse further sends and drop all pending callbacks
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pending.clear();
        debug!(client = %self.id, "Control client closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::testing::RecordingAlertSink;
    use crate::alert::LogAlertSink;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn client() -> (Arc<ControlClient>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (
            ControlClient::new("test", tx, Arc::new(LogAlertSink::default())),
            rx,
        )
    }

    async fn next_packet(rx: &mut mpsc::Receiver<String>) -> ControlPacket {
        let raw = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        ControlPacket::from_json(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_response_goes_to_callback_not_handler() {
        let (client, mut out) = client();
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        client.receive(Command::Started, move |_packet: ControlPacket| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                None::<ControlPacket>
            }
        });

        let (tx, rx) = oneshot::channel();
        let request = ControlPacket::new(Command::Start, "{}").with_session("s1");
        let packet_id = client
            .send(
                request,
                Some(Box::new(move |response| {
                    let _ = tx.send(response);
                })),
            )
            .await
            .unwrap();
        assert_eq!(client.pending_callbacks(), 1);
        assert_eq!(next_packet(&mut out).await.packet_id, packet_id);

        let mut response = ControlPacket::new(Command::Started, "ok").with_session("other");
        response.packet_id.clone_from(&packet_id);
        client.handle_message(&response.to_json().unwrap());

        let received = rx.await.unwrap();
        assert_eq!(received.packet_id, packet_id);
        assert_eq!(received.session_id, "s1");
        assert_eq!(received.data, "ok");
        assert_eq!(client.pending_callbacks(), 0);

        // same response again: no callback left, so the handler takes it
        client.handle_message(&response.to_json().unwrap());
        tokio::time::timeout(Duration::from_secs(2), async {
            while handled.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_reply_keeps_correlation() {
        let (client, mut out) = client();
        client.receive(Command::Start, |packet: ControlPacket| async move {
            Some(ControlPacket::new(Command::Started, format!("re:{}", packet.data)))
        });

        let mut request = ControlPacket::new(Command::Start, "hello").with_session("s9");
        request.packet_id = "p1".to_string();
        client.handle_message(&request.to_json().unwrap());

        let reply = next_packet(&mut out).await;
        assert_eq!(reply.command(), Some(Command::Started));
        assert_eq!(reply.data, "re:hello");
        assert_eq!(reply.packet_id, "p1");
        assert_eq!(reply.session_id, "s9");
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_later_packets() {
        let (client, mut out) = client();
        let release = Arc::new(tokio::sync::Notify::new());
        let gate = release.clone();
        client.receive(Command::Start, move |_packet: ControlPacket| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Some(ControlPacket::new(Command::Started, "slow"))
            }
        });
        client.receive(Command::Quit, |_packet: ControlPacket| async {
            Some(ControlPacket::new(Command::CloseRoom, "fast"))
        });

        client.handle_message(&ControlPacket::new(Command::Start, "{}").to_json().unwrap());
        client.handle_message(&ControlPacket::new(Command::Quit, "room").to_json().unwrap());

        // the quit reply arrives while start is still parked
        let first = next_packet(&mut out).await;
        assert_eq!(first.command(), Some(Command::CloseRoom));
        assert_eq!(first.data, "fast");

        release.notify_one();
        let second = next_packet(&mut out).await;
        assert_eq!(second.command(), Some(Command::Started));
        assert_eq!(second.data, "slow");
    }

    #[tokio::test]
    async fn test_empty_reply_and_unknown_input_send_nothing() {
        let (client, mut out) = client();
        client.receive(Command::Quit, |_packet: ControlPacket| async { None::<ControlPacket> });

        client.handle_message(&ControlPacket::new(Command::Quit, "room").to_json().unwrap());
        client.handle_message("{not json");
        client.handle_message(r#"{"id":"dance","packet_id":"x"}"#);

        let nothing = tokio::time::timeout(Duration::from_millis(50), out.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_send_sync_and_close() {
        let (client, mut out) = client();

        let responder = {
            let client = client.clone();
            tokio::spawn(async move {
                let request = next_packet(&mut out).await;
                let mut response = ControlPacket::new(Command::Started, "done");
                response.packet_id = request.packet_id;
                client.handle_message(&response.to_json().unwrap());
                out
            })
        };

        let response = client
            .send_sync(ControlPacket::new(Command::Start, "{}").with_session("s1"))
            .await
            .unwrap();
        assert_eq!(response.data, "done");
        assert_eq!(response.session_id, "s1");
        let _out = responder.await.unwrap();

        // an unanswered request fails once the client closes
        let waiting = {
            let client = client.clone();
            tokio::spawn(async move { client.send_sync(ControlPacket::new(Command::Start, "{}")).await })
        };
        while client.pending_callbacks() == 0 {
            tokio::task::yield_now().await;
        }
        client.close();
        assert!(matches!(waiting.await.unwrap(), Err(Error::Closed)));
        assert!(matches!(
            client.send(ControlPacket::new(Command::Start, "{}"), None).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let (tx, mut out) = mpsc::channel(16);
        let sink = Arc::new(RecordingAlertSink::default());
        let client = ControlClient::new("test", tx, sink.clone());

        let calls = Arc::new(Mutex::new(0));
        let seen = calls.clone();
        client.receive(Command::Start, move |packet: ControlPacket| {
            let seen = seen.clone();
            async move {
                *seen.lock() += 1;
                assert!(packet.data != "explode", "handler exploded");
                Some(ControlPacket::new(Command::Started, ""))
            }
        });

        client.handle_message(
            &ControlPacket::new(Command::Start, "explode")
                .with_session("s1")
                .to_json()
                .unwrap(),
        );
        client.handle_message(&ControlPacket::new(Command::Start, "fine").to_json().unwrap());

        assert_eq!(next_packet(&mut out).await.command(), Some(Command::Started));
        tokio::time::timeout(Duration::from_secs(2), async {
            while sink.alerts.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*calls.lock(), 2);
        let alerts = sink.alerts.lock();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].context, "s1");
        assert_eq!(alerts[0].scope, "control.dispatch");
    }
}
