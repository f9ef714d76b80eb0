//! WebSocket endpoint that streams buffer frames to subscribers.
//!
//! Clients connect to `/ws`, send JSON subscribe/unsubscribe messages and
//! receive binary broadcast frames. The server runs on its own runtime
//! thread so PTY reader threads never share a scheduler with sockets.

use std::net::IpAddr;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use crossbeam_channel::RecvTimeoutError;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::governor::ConnectionPermit;
use crate::governor::ResourceGovernor;
use crate::hub::ConnectionId;
use crate::hub::Outbox;
use crate::hub::SubscriptionHub;

/// Grace period for open connections once shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const SEND_TIMEOUT: Duration = Duration::from_secs(15);
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Running server; dropping it without [`WsServerHandle::shutdown`] leaves
/// the thread serving until the process exits.
pub struct WsServerHandle {
    stop: watch::Sender<bool>,
    stopped: crossbeam_channel::Receiver<()>,
    thread: Option<thread::JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl WsServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn ws_url(&self) -> String {
        format_ws_url(&self.local_addr)
    }

    /// Stops accepting connections and closes open ones. Waits at most
    /// twice the drain timeout before leaving the thread behind.
    pub fn shutdown(mut self) {
        let _ = self.stop.send(true);
        match self.stopped.recv_timeout(DRAIN_TIMEOUT * 2) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let panicked = self.thread.take().is_some_and(|t| t.join().is_err());
                if panicked {
                    warn!("WS server thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(addr = %self.local_addr, "WS server did not stop in time");
            }
        }
    }
}

struct Endpoint {
    hub: Arc<SubscriptionHub>,
    governor: Arc<ResourceGovernor>,
    stop: watch::Receiver<bool>,
}

/// Binds on the caller's thread so address errors surface here, then serves
/// on a dedicated runtime thread.
pub fn start_ws_server(
    hub: Arc<SubscriptionHub>,
    governor: Arc<ResourceGovernor>,
    config: &DaemonConfig,
) -> Result<WsServerHandle, DaemonError> {
    let (listener, local_addr) = bind_listener(config.listen(), config.allow_remote())?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let (stopped_tx, stopped_rx) = crossbeam_channel::bounded(1);

    let endpoint = Arc::new(Endpoint {
        hub,
        governor,
        stop: stop_rx,
    });

    let thread = thread::Builder::new()
        .name("termcast-ws".to_string())
        .spawn(move || {
            match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("termcast-ws-worker")
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime.block_on(serve(listener, endpoint)),
                Err(e) => error!(error = %e, "Failed to build WS runtime"),
            }
            let _ = stopped_tx.send(());
        })
        .map_err(|source| DaemonError::Io {
            operation: "spawn ws thread",
            source,
        })?;

    Ok(WsServerHandle {
        stop: stop_tx,
        stopped: stopped_rx,
        thread: Some(thread),
        local_addr,
    })
}

async fn serve(listener: std::net::TcpListener, endpoint: Arc<Endpoint>) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "Failed to register WS listener");
            return;
        }
    };
    if let Ok(addr) = listener.local_addr() {
        info!(ws = %format_ws_url(&addr), "WS server listening");
    }

    let mut stop = endpoint.stop.clone();
    let mut drain = endpoint.stop.clone();
    let router = Router::new()
        .route("/ws", get(upgrade))
        .with_state(endpoint);
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stop.changed().await;
            })
            .await
    });

    tokio::select! {
        result = &mut server => log_server_exit(result),
        _ = drain.changed() => {
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut server).await {
                Ok(result) => log_server_exit(result),
                Err(_) => {
                    warn!(timeout_ms = DRAIN_TIMEOUT.as_millis(), "WS drain timed out; aborting");
                    server.abort();
                }
            }
        }
    }
}

fn log_server_exit(result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => debug!("WS server stopped"),
        Ok(Err(e)) => error!(error = %e, "WS server failed"),
        Err(e) => error!(error = %e, "WS server task failed"),
    }
}

async fn upgrade(State(endpoint): State<Arc<Endpoint>>, ws: WebSocketUpgrade) -> Response {
    let permit = match endpoint.governor.acquire_connection() {
        Ok(permit) => permit,
        Err(e) => {
            let body = json!({ "error": "limit_reached", "message": e.to_string() });
            return (StatusCode::SERVICE_UNAVAILABLE, body.to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| async move {
        Viewer::open(endpoint, permit).run(socket).await;
    })
    .into_response()
}

/// One connected client. Holding the permit keeps its connection slot.
struct Viewer {
    endpoint: Arc<Endpoint>,
    connection: ConnectionId,
    outbox: Arc<Outbox>,
    _permit: ConnectionPermit,
}

impl Viewer {
    fn open(endpoint: Arc<Endpoint>, permit: ConnectionPermit) -> Self {
        let (connection, outbox) = endpoint.hub.register_connection();
        debug!(connection, "WS connection opened");
        Self {
            endpoint,
            connection,
            outbox,
            _permit: permit,
        }
    }

    async fn run(self, mut socket: WebSocket) {
        let connection = self.connection;
        let mut stop = self.endpoint.stop.clone();
        let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                frame = self.outbox.recv() => {
                    let Some(frame) = frame else { break };
                    if !send_bounded(&mut socket, Message::Binary(frame.to_vec())).await {
                        debug!(connection, "Dropping slow or broken WS connection");
                        break;
                    }
                }
                _ = ping.tick() => {
                    if !send_bounded(&mut socket, Message::Ping(Vec::new())).await {
                        break;
                    }
                }
                incoming = socket.recv() => {
                    let Some(Ok(incoming)) = incoming else { break };
                    if !self.on_message(&mut socket, incoming).await {
                        break;
                    }
                }
            }
        }

        self.endpoint.hub.on_connection_closed(connection);
    }

    /// Returns `false` when the connection should close.
    async fn on_message(&self, socket: &mut WebSocket, message: Message) -> bool {
        match message {
            Message::Text(text) => {
                self.endpoint
                    .hub
                    .handle_control_message(self.connection, &text);
                true
            }
            Message::Ping(payload) => send_bounded(socket, Message::Pong(payload)).await,
            Message::Binary(_) => {
                debug!(connection = self.connection, "Ignoring binary frame from client");
                true
            }
            Message::Pong(_) => true,
            Message::Close(_) => false,
        }
    }
}

async fn send_bounded(socket: &mut WebSocket, message: Message) -> bool {
    matches!(
        tokio::time::timeout(SEND_TIMEOUT, socket.send(message)).await,
        Ok(Ok(()))
    )
}

fn bind_listener(
    listen: &str,
    allow_remote: bool,
) -> Result<(std::net::TcpListener, SocketAddr), DaemonError> {
    let invalid = |message: String| DaemonError::InvalidListen { message };
    let addr = listen
        .to_socket_addrs()
        .map_err(|e| invalid(format!("{listen}: {e}")))?
        .next()
        .ok_or_else(|| invalid(format!("{listen}: no address")))?;

    if !allow_remote && !addr.ip().is_loopback() {
        return Err(invalid(format!(
            "{addr} is not a loopback address; set TERMCAST_WS_ALLOW_REMOTE=1 to allow it"
        )));
    }

    let io = |operation: &'static str| move |source: std::io::Error| DaemonError::Io { operation, source };
    let listener = std::net::TcpListener::bind(addr).map_err(io("bind ws listener"))?;
    listener
        .set_nonblocking(true)
        .map_err(io("configure ws listener"))?;
    let local_addr = listener.local_addr().map_err(io("read ws address"))?;
    Ok((listener, local_addr))
}

fn format_ws_url(addr: &SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(ip) => format!("ws://{}:{}/ws", ip, addr.port()),
        IpAddr::V6(ip) => format!("ws://[{}]:{}/ws", ip, addr.port()),
    }
}
