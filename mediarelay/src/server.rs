//! Control listener
//!
//! Every coordinator connection upgrades to a WebSocket carrying JSON control
//! packets as text frames. A connection gets its own `ControlClient` and
//! `CommandHandler`; all connections share one port pool.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use mediarelay_core::{
    AlertSink, BuiltinEncoders, BuiltinProducers, CommandHandler, Config, ControlClient,
    PortAllocator, RegistryStats, RoomServices, TransportFactory, UdpTransportFactory,
};

/// Outbound control packets buffered per connection
const OUTBOUND_CAPACITY: usize = 1000;

#[derive(Clone)]
struct AppState {
    ports: Arc<PortAllocator>,
    services: RoomServices,
    transports: Arc<dyn TransportFactory>,
    alerts: Arc<dyn AlertSink>,
    handlers: Arc<DashMap<String, Arc<CommandHandler>>>,
}

#[derive(Debug, Serialize)]
struct WorkerStats {
    connections: usize,
    ports_in_use: usize,
    port_capacity: usize,
    handlers: Vec<RegistryStats>,
}

pub struct RelayServer {
    config: Arc<Config>,
    alerts: Arc<dyn AlertSink>,
}

impl RelayServer {
    pub fn new(config: Arc<Config>, alerts: Arc<dyn AlertSink>) -> Self {
        Self { config, alerts }
    }

    /// Serve control connections until a shutdown signal arrives
    pub async fn run(self) -> anyhow::Result<()> {
        let services = RoomServices {
            producers: Arc::new(BuiltinProducers {
                use_unix_socket: self.config.media.use_unix_socket,
            }),
            encoders: Arc::new(BuiltinEncoders),
            config: self.config.clone(),
            alerts: self.alerts.clone(),
        };
        let state = AppState {
            ports: Arc::new(PortAllocator::new(&self.config.ports)),
            services,
            transports: Arc::new(UdpTransportFactory),
            alerts: self.alerts.clone(),
            handlers: Arc::new(DashMap::new()),
        };

        let app = Router::new()
            .route(&self.config.server.path, get(control_socket))
            .route("/stats", get(stats))
            .with_state(state.clone());

        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(%addr, path = %self.config.server.path, "Control listener ready");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        // connections still open when the listener stopped
        for handler in state.handlers.iter() {
            handler.shutdown();
        }
        info!("Media relay worker stopped");
        Ok(())
    }
}

async fn control_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(64 * 1024)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
    let client = ControlClient::new(connection_id.clone(), tx, state.alerts.clone());

    let handler = match CommandHandler::new(
        client.clone(),
        state.ports.clone(),
        state.services.clone(),
        state.transports.clone(),
    ) {
        Ok(handler) => handler,
        Err(e) => {
            error!(connection_id = %connection_id, error = %e, "Failed to create command handler");
            return;
        }
    };
    handler.register();
    state.handlers.insert(connection_id.clone(), handler.clone());
    info!(connection_id = %connection_id, "Coordinator connected");

    let (mut sink, mut stream) = socket.split();

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!(connection_id = %writer_id, error = %e, "Control socket write failed");
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => client.handle_message(text.as_str()),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => client.handle_message(text),
                Err(_) => warn!(connection_id = %connection_id, "Ignoring non UTF-8 control frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Control socket read failed");
                break;
            }
        }
    }

    client.close();
    handler.shutdown();
    state.handlers.remove(&connection_id);
    writer.abort();
    info!(connection_id = %connection_id, "Coordinator disconnected");
}

async fn stats(State(state): State<AppState>) -> Json<WorkerStats> {
    let handlers: Vec<RegistryStats> = state.handlers.iter().map(|h| h.stats()).collect();
    Json(WorkerStats {
        connections: handlers.len(),
        ports_in_use: state.ports.in_use(),
        port_capacity: state.ports.capacity(),
        handlers,
    })
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
