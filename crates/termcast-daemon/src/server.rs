//! Wiring of the daemon: one manager, one hub, one governor, one pump.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::info;
use tracing::warn;

use crate::cancel::CancellationToken;
use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::governor::ResourceGovernor;
use crate::hub::FrameSource;
use crate::hub::SubscriptionHub;
use crate::pump::spawn_broadcast_pump;
use crate::session::SessionManager;
use crate::signal_handler::SignalHandler;
use crate::ws_server::WsServerHandle;
use crate::ws_server::start_ws_server;

const SHUTDOWN_POLL: Duration = Duration::from_secs(1);

/// A running daemon. Components are constructed here and handed to each
/// other explicitly.
pub struct Daemon {
    manager: Arc<SessionManager>,
    hub: Arc<SubscriptionHub>,
    governor: Arc<ResourceGovernor>,
    ws: WsServerHandle,
    pump: JoinHandle<()>,
    pump_token: CancellationToken,
}

impl Daemon {
    pub fn start(config: &DaemonConfig) -> Result<Self, DaemonError> {
        let governor = Arc::new(ResourceGovernor::new(
            config.max_sessions(),
            config.max_connections(),
        ));
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let manager = Arc::new(SessionManager::new(
            config,
            Arc::clone(&governor),
            events_tx,
        ));
        manager.remove_exited_sessions();

        let source: Arc<dyn FrameSource> = manager.clone();
        let hub = Arc::new(SubscriptionHub::new(source, config.outbox_capacity()));

        let pump_token = CancellationToken::new();
        let pump = spawn_broadcast_pump(
            events_rx,
            Arc::clone(&hub),
            config.broadcast_interval(),
            pump_token.clone(),
        )?;

        let ws = match start_ws_server(Arc::clone(&hub), Arc::clone(&governor), config) {
            Ok(ws) => ws,
            Err(e) => {
                pump_token.cancel();
                let _ = pump.join();
                return Err(e);
            }
        };

        info!(
            ws = %ws.ws_url(),
            control_dir = %config.control_dir().display(),
            max_sessions = config.max_sessions(),
            max_connections = config.max_connections(),
            "Daemon started"
        );

        Ok(Self {
            manager,
            hub,
            governor,
            ws,
            pump,
            pump_token,
        })
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn hub(&self) -> &Arc<SubscriptionHub> {
        &self.hub
    }

    pub fn governor(&self) -> &Arc<ResourceGovernor> {
        &self.governor
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.ws.local_addr()
    }

    pub fn ws_url(&self) -> String {
        self.ws.ws_url()
    }

    /// Stops accepting viewers, flushes pending titles, kills owned
    /// sessions and stops the pump.
    pub fn shutdown(self) {
        self.ws.shutdown();
        self.manager.shutdown();
        self.pump_token.cancel();
        if self.pump.join().is_err() {
            warn!("Broadcast pump panicked");
        }
        info!("Daemon stopped");
    }
}

/// Runs until SIGINT or SIGTERM.
pub fn run_daemon(config: DaemonConfig) -> Result<(), DaemonError> {
    let shutdown = CancellationToken::new();
    let _signals = SignalHandler::setup(shutdown.clone())?;
    let daemon = Daemon::start(&config)?;
    while !shutdown.wait_timeout(SHUTDOWN_POLL) {}
    daemon.shutdown();
    Ok(())
}
