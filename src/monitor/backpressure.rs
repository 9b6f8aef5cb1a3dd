use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analytics::alerting::{AlertEvent, AlertManager};
use crate::config::settings::BandwidthConfig;
use crate::models::notify::NotifyData;
use crate::models::status::ServerStatus;
use crate::proxy::group::ServerGroup;

/// Spans narrower than this (capped by the configured span) are too noisy to act on.
const MIN_ACTIONABLE_SPAN_SECS: u64 = 30;

/// Group-wide "accept new connections" switch read by every TCP server.
#[derive(Debug)]
pub struct AcceptFlag(AtomicBool);

impl AcceptFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(true))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns true only when the value actually changed.
    pub fn set(&self, accept: bool) -> bool {
        self.0.swap(accept, Ordering::AcqRel) != accept
    }
}

impl Default for AcceptFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureAction {
    None,
    StopAllServers,
    RestartAllServers,
}

/// Turns bandwidth verdicts into accept-flag flips and listener teardown.
pub struct BackpressureController {
    min_span_secs: u64,
    stop_accept_limit: chrono::Duration,
    stop_accept_since: Option<DateTime<Utc>>,
    accept: Arc<AcceptFlag>,
    alerts: Arc<AlertManager>,
}

impl BackpressureController {
    pub fn new(config: &BandwidthConfig, accept: Arc<AcceptFlag>, alerts: Arc<AlertManager>) -> Self {
        Self {
            min_span_secs: MIN_ACTIONABLE_SPAN_SECS.min(config.statistical_time_span_secs),
            stop_accept_limit: chrono::Duration::seconds(config.stop_accept_time_limit_secs as i64),
            stop_accept_since: None,
            accept,
            alerts,
        }
    }

    pub fn stop_accept_since(&self) -> Option<DateTime<Utc>> {
        self.stop_accept_since
    }

    /// Apply one verdict. `group_status` is the group's state right now.
    pub fn on_notify(
        &mut self,
        data: &NotifyData,
        group_status: ServerStatus,
        now: DateTime<Utc>,
    ) -> BackpressureAction {
        if (data.span_seconds.ceil() as u64) < self.min_span_secs {
            debug!(span_secs = data.span_seconds, "Bandwidth span too narrow, ignored");
            return BackpressureAction::None;
        }

        if !data.is_ok {
            if self.accept.set(false) {
                warn!(
                    sent_bps = data.bytes_sent_per_second,
                    recv_bps = data.bytes_recv_per_second,
                    "Bandwidth over limit, refusing new TCP connections"
                );
                self.alerts.notify(
                    AlertEvent::TcpNotAccepting,
                    format!(
                        "bandwidth over limit (sent {}/{} B/s, recv {}/{} B/s), new TCP connections refused",
                        data.bytes_sent_per_second, data.sent_limit, data.bytes_recv_per_second, data.recv_limit
                    ),
                );
            }

            match self.stop_accept_since {
                None => self.stop_accept_since = Some(now),
                Some(since) if since + self.stop_accept_limit < now && group_status == ServerStatus::Running => {
                    warn!(
                        since = %since,
                        limit_secs = self.stop_accept_limit.num_seconds(),
                        "Bandwidth over limit for too long, closing all TCP listeners"
                    );
                    self.alerts.notify(
                        AlertEvent::TcpListenersDown,
                        format!("bandwidth over limit since {}, all TCP listeners closed", since),
                    );
                    return BackpressureAction::StopAllServers;
                }
                Some(_) => {}
            }
            return BackpressureAction::None;
        }

        if !data.uses_stable_baseline {
            return BackpressureAction::None;
        }

        self.stop_accept_since = None;
        if self.accept.set(true) {
            info!("Bandwidth back under limit, accepting new TCP connections");
            self.alerts.notify(AlertEvent::TcpReaccepting, "bandwidth back under limit, accepting TCP connections");
        }

        if group_status == ServerStatus::WaitStop {
            BackpressureAction::RestartAllServers
        } else {
            BackpressureAction::None
        }
    }

    /// Consume verdicts until cancelled or the monitor closes the channel.
    /// Actions run inline, so verdicts arriving during a teardown wait.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<NotifyData>,
        group: Arc<ServerGroup>,
        token: CancellationToken,
    ) {
        loop {
            let data = tokio::select! {
                _ = token.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(data) => data,
                    None => break,
                },
            };

            match self.on_notify(&data, group.status(), Utc::now()) {
                BackpressureAction::None => {}
                BackpressureAction::StopAllServers => group.stop_all_servers().await,
                BackpressureAction::RestartAllServers => group.restart_all_servers().await,
            }
        }
        debug!("Backpressure controller stopped");
    }
}
