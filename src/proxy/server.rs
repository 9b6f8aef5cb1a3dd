use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::listener::bind_tcp_listener;
use super::proxy_protocol;
use super::registry::ConnectionRegistry;
use super::relay::{relay, RelayEnd};
use crate::analytics::alerting::{AlertEvent, AlertManager};
use crate::models::forward::{ListenerPlan, ResolvedForward};
use crate::models::protocol::Protocol;
use crate::models::rule::CountRule;
use crate::models::status::{ServerStatus, StatusCell};
use crate::monitor::backpressure::AcceptFlag;
use crate::protection::admission::{AdmissionGate, Denial};
use crate::storage::sqlite::SqliteStore;

/// Pause after a failed accept so a full fd table does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("port {0}: no listener can be opened for the configured destinations")]
    NoListener(u16),

    #[error("port {port}: failed to bind {addr}: {source}")]
    Bind {
        port: u16,
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Everything a forward server shares with the rest of its group.
pub struct ServerContext {
    pub protocol: Protocol,
    pub gate: Arc<AdmissionGate>,
    pub store: Arc<SqliteStore>,
    pub alerts: Arc<AlertManager>,
    /// Bandwidth switch; only TCP groups carry one.
    pub accept: Option<Arc<AcceptFlag>>,
    /// Brute-force thresholds for forwards that define none of their own.
    pub count_rules: Vec<CountRule>,
    pub connect_timeout: Duration,
    pub shutdown_grace: Duration,
    pub proxy_header_timeout: Duration,
    pub ipv4_supported: bool,
    pub ipv6_supported: bool,
}

/// Listeners for one forward rule plus the relays they spawned.
pub struct ForwardServer {
    forward: ResolvedForward,
    ctx: Arc<ServerContext>,
    status: StatusCell,
    token: CancellationToken,
    accept_loops: TaskTracker,
    connections: TaskTracker,
    registry: Arc<ConnectionRegistry>,
    local_addrs: Mutex<Vec<SocketAddr>>,
}

impl ForwardServer {
    pub fn new(forward: ResolvedForward, ctx: Arc<ServerContext>) -> Self {
        Self {
            forward,
            ctx,
            status: StatusCell::new(),
            token: CancellationToken::new(),
            accept_loops: TaskTracker::new(),
            connections: TaskTracker::new(),
            registry: Arc::new(ConnectionRegistry::new()),
            local_addrs: Mutex::new(Vec::new()),
        }
    }

    pub fn port(&self) -> u16 {
        self.forward.listen_port
    }

    pub fn status(&self) -> ServerStatus {
        self.status.get()
    }

    /// Bound listener addresses; empty unless running.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.local_addrs.lock().clone()
    }

    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Bind every planned listener and start accepting.
    ///
    /// Either all listeners come up or none do. A server that fails to start
    /// ends in `Finished`. Calling start on a server that already left
    /// `Ready` does nothing.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        if !self.status.transition(ServerStatus::Ready, ServerStatus::WaitStart) {
            debug!(port = self.port(), status = %self.status(), "Start ignored");
            return Ok(());
        }

        let port = self.port();
        let plans = self.forward.plan(self.ctx.ipv4_supported, self.ctx.ipv6_supported);
        if plans.is_empty() {
            self.status.transition(ServerStatus::WaitStart, ServerStatus::Finished);
            return Err(ServerError::NoListener(port));
        }

        let mut bound = Vec::with_capacity(plans.len());
        for plan in plans {
            match bind_tcp_listener(plan.listen) {
                Ok(listener) => bound.push((listener, plan)),
                Err(source) => {
                    // Listeners bound so far close when `bound` drops.
                    self.status.transition(ServerStatus::WaitStart, ServerStatus::Finished);
                    return Err(ServerError::Bind {
                        port,
                        addr: plan.listen,
                        source,
                    });
                }
            }
        }

        let mut addrs = Vec::with_capacity(bound.len());
        for (listener, plan) in bound {
            let local = listener.local_addr().unwrap_or(plan.listen);
            addrs.push(local);
            info!(
                protocol = %self.ctx.protocol,
                listen = %local,
                target = %plan.target,
                bridged = plan.bridged,
                src_proxy = plan.src_proxy,
                dest_proxy = plan.dest_proxy.is_some(),
                "Forward listener started"
            );
            let this = Arc::clone(self);
            self.accept_loops.spawn(this.accept_loop(listener, plan));
        }
        *self.local_addrs.lock() = addrs;

        self.status.transition(ServerStatus::WaitStart, ServerStatus::Running);
        Ok(())
    }

    /// Close listeners, give open relays the grace period, then force-close
    /// the rest. Only acts on a running server.
    pub async fn stop(&self) {
        if !self.status.transition(ServerStatus::Running, ServerStatus::Stopping) {
            debug!(port = self.port(), status = %self.status(), "Stop ignored");
            return;
        }

        self.token.cancel();
        self.accept_loops.close();
        self.accept_loops.wait().await;
        self.local_addrs.lock().clear();

        self.connections.close();
        tokio::select! {
            _ = self.connections.wait() => {}
            _ = tokio::time::sleep(self.ctx.shutdown_grace) => {
                let closed = self.registry.close_all();
                warn!(
                    port = self.port(),
                    connections = closed,
                    "Grace period elapsed, force closing connections"
                );
                self.connections.wait().await;
            }
        }

        self.status.transition(ServerStatus::Stopping, ServerStatus::Finished);
        info!(protocol = %self.ctx.protocol, port = self.port(), "Forward server stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, plan: ListenerPlan) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.token.cancelled() => break,
                res = listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(listen = %plan.listen, error = %e, "Failed to accept TCP connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
            };

            if let Some(accept) = &self.ctx.accept {
                if !accept.get() {
                    debug!(peer = %peer, "Not accepting new connections, dropping");
                    drop(stream);
                    continue;
                }
            }

            let span = info_span!("conn", protocol = %self.ctx.protocol, peer = %peer, target = %plan.target);
            let this = Arc::clone(&self);
            self.connections
                .spawn(async move { this.handle_connection(stream, peer, plan).await }.instrument(span));
        }
        debug!(listen = %plan.listen, "Accept loop finished");
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr, plan: ListenerPlan) {
        let remote = if plan.src_proxy {
            match proxy_protocol::read_header(&mut stream, self.ctx.proxy_header_timeout).await {
                Ok(Some(addr)) => {
                    debug!(proxied = %addr, "Client address taken from PROXY header");
                    addr
                }
                Ok(None) => peer,
                Err(e) => {
                    warn!(error = %e, "Bad PROXY header, dropping connection");
                    return;
                }
            }
        } else {
            peer
        };
        let remote = SocketAddr::new(remote.ip().to_canonical(), remote.port());
        let target = plan.target;
        let target_str = target.to_string();
        let is_ssh = self.ctx.protocol == Protocol::Ssh;

        let count_rules = if self.forward.count_rules.is_empty() {
            &self.ctx.count_rules
        } else {
            &self.forward.count_rules
        };

        // SSH attempts are in the history before the next check runs.
        let (decision, record_id) = if is_ssh {
            let admission = self.ctx.gate.check_recorded(remote.ip(), &target_str, count_rules);
            (admission.decision, admission.record_id)
        } else {
            (self.ctx.gate.check(remote.ip(), &target_str, count_rules), None)
        };

        let allowed = match decision {
            Ok(allowed) => allowed,
            Err(denial) => {
                info!(remote = %remote, reason = %denial, "Connection rejected");
                if let Denial::BruteForce { seconds, new_ban: true } = denial {
                    self.ctx.alerts.notify(
                        AlertEvent::SshBanned,
                        format!("{} banned for {}s after repeated attempts on {}", remote.ip(), seconds, target_str),
                    );
                }
                return;
            }
        };

        let mut backend = match tokio::time::timeout(self.ctx.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to connect to backend");
                self.reject_attempt(record_id, "; backend unreachable");
                return;
            }
            Err(_) => {
                warn!(timeout_ms = self.ctx.connect_timeout.as_millis() as u64, "Backend connect timed out");
                self.reject_attempt(record_id, "; backend timed out");
                return;
            }
        };

        if let Some(version) = plan.dest_proxy {
            let local = stream.local_addr().unwrap_or(plan.listen);
            if let Err(e) = proxy_protocol::write_header(&mut backend, version, remote, local).await {
                warn!(error = %e, "Failed to send PROXY header to backend");
                self.reject_attempt(record_id, "; PROXY header failed");
                return;
            }
        }

        let cancel = CancellationToken::new();
        let _guard = match self.registry.register(remote, target, cancel.clone()) {
            Ok(guard) => guard,
            Err(e) => {
                error!(error = %e, "Connection registry conflict, dropping connection");
                self.reject_attempt(record_id, "; duplicate client address");
                return;
            }
        };

        if is_ssh {
            self.ctx.alerts.notify(
                AlertEvent::SshAllowed,
                format!("{} -> {}: {}", remote.ip(), target_str, allowed),
            );
        }
        info!(remote = %remote, reason = %allowed, "Connection accepted");

        let started = Instant::now();
        let end = relay(stream, backend, cancel).await;
        let elapsed = started.elapsed();
        info!(duration_ms = elapsed.as_millis() as u64, end = %end, "Connection closed");

        if let Some(id) = record_id {
            let suffix = match end {
                RelayEnd::Cancelled => "; force closed",
                RelayEnd::Client | RelayEnd::Backend => "; closed normally",
            };
            if let Err(e) = self.ctx.store.update_connection_record(id, elapsed.as_millis() as i64, suffix) {
                warn!(record_id = id, error = %e, "Failed to update SSH connection record");
            }
        }
    }

    /// Mark an admitted SSH attempt as refused after the fact.
    fn reject_attempt(&self, record_id: Option<i64>, mark_suffix: &str) {
        let Some(id) = record_id else {
            return;
        };
        if let Err(e) = self.ctx.store.reject_connection_record(id, mark_suffix) {
            warn!(record_id = id, error = %e, "Failed to update SSH connection record");
        }
    }
}
