use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::server::{ForwardServer, ServerContext};
use crate::models::forward::ResolvedForward;
use crate::models::notify::NotifyData;
use crate::models::protocol::Protocol;
use crate::models::status::{ServerStatus, StatusCell};
use crate::monitor::backpressure::{AcceptFlag, BackpressureController};

/// All forward servers of one protocol, started and stopped together.
///
/// For TCP the group also owns the accept switch and, when bandwidth
/// monitoring is on, the backpressure task that drives it.
pub struct ServerGroup {
    protocol: Protocol,
    forwards: Vec<ResolvedForward>,
    ctx: Arc<ServerContext>,
    status: StatusCell,
    servers: DashMap<u16, Arc<ForwardServer>>,
    accept: Arc<AcceptFlag>,
    token: CancellationToken,
    tasks: TaskTracker,
}

impl ServerGroup {
    /// `accept` must be the same flag the servers in `ctx` read.
    pub fn new(forwards: Vec<ResolvedForward>, ctx: Arc<ServerContext>, accept: Arc<AcceptFlag>) -> Self {
        Self {
            protocol: ctx.protocol,
            forwards,
            ctx,
            status: StatusCell::new(),
            servers: DashMap::new(),
            accept,
            token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn status(&self) -> ServerStatus {
        self.status.get()
    }

    pub fn network_accept(&self) -> bool {
        self.accept.get()
    }

    /// Port and status of every registered server, sorted by port.
    pub fn servers(&self) -> Vec<(u16, ServerStatus)> {
        let mut list: Vec<_> = self.servers.iter().map(|e| (*e.key(), e.value().status())).collect();
        list.sort_unstable_by_key(|(port, _)| *port);
        list
    }

    /// Start the group. Backpressure, if given, runs until the group stops.
    /// Does nothing unless the group is still `Ready`.
    pub async fn start(self: &Arc<Self>, backpressure: Option<(BackpressureController, mpsc::Receiver<NotifyData>)>) {
        if !self.status.transition(ServerStatus::Ready, ServerStatus::WaitStart) {
            debug!(protocol = %self.protocol, status = %self.status(), "Group start ignored");
            return;
        }

        if let Some((controller, rx)) = backpressure {
            let group = Arc::clone(self);
            let token = self.token.clone();
            self.tasks.spawn(controller.run(rx, group, token));
        }

        self.start_all_servers().await;
        info!(protocol = %self.protocol, servers = self.servers.len(), "Server group started");
    }

    /// Build and start one server per forward. A port claimed by an earlier
    /// forward is a conflict and is skipped; a server that fails to start
    /// stays registered so its failure remains visible.
    pub async fn start_all_servers(&self) -> bool {
        if !self.status.transition(ServerStatus::WaitStart, ServerStatus::Running) {
            warn!(protocol = %self.protocol, status = %self.status(), "Start all servers ignored");
            return false;
        }

        for forward in &self.forwards {
            let port = forward.listen_port;
            let server = match self.servers.entry(port) {
                Entry::Occupied(_) => {
                    error!(protocol = %self.protocol, port = port, "Port conflict, forward skipped");
                    continue;
                }
                Entry::Vacant(slot) => {
                    let server = Arc::new(ForwardServer::new(forward.clone(), Arc::clone(&self.ctx)));
                    slot.insert(Arc::clone(&server));
                    server
                }
            };

            if let Err(e) = server.start().await {
                error!(protocol = %self.protocol, port = port, error = %e, "Failed to start forward server");
            }
        }
        true
    }

    /// Stop every server concurrently and forget them. Only acts while running.
    pub async fn stop_all_servers(&self) {
        if !self.status.transition(ServerStatus::Running, ServerStatus::WaitStop) {
            return;
        }

        let servers: Vec<Arc<ForwardServer>> = self.servers.iter().map(|e| Arc::clone(e.value())).collect();
        join_all(servers.iter().map(|s| s.stop())).await;
        self.servers.clear();
        info!(protocol = %self.protocol, stopped = servers.len(), "All forward servers stopped");
    }

    /// Bring servers back after `stop_all_servers`. Only acts while in `WaitStop`.
    pub async fn restart_all_servers(&self) {
        if !self.status.transition(ServerStatus::WaitStop, ServerStatus::WaitStart) {
            debug!(protocol = %self.protocol, status = %self.status(), "Restart ignored");
            return;
        }
        self.start_all_servers().await;
        info!(protocol = %self.protocol, servers = self.servers.len(), "Forward servers restarted");
    }

    /// Stop servers and background tasks. Safe to call more than once.
    ///
    /// The backpressure task is drained first so it cannot restart servers
    /// behind this call.
    pub async fn stop(&self) {
        self.token.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        self.stop_all_servers().await;
        if !self.status.transition(ServerStatus::WaitStop, ServerStatus::Stopping) {
            return;
        }
        self.status.transition(ServerStatus::Stopping, ServerStatus::Finished);
        info!(protocol = %self.protocol, "Server group stopped");
    }
}
