use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, error, info, warn};

/// Operator-facing events. Delivery is best effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertEvent {
    ServiceStarted,
    ServiceStopped,
    TcpNotAccepting,
    TcpListenersDown,
    TcpReaccepting,
    SshBanned,
    SshAllowed,
}

impl AlertEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertEvent::ServiceStarted => "service_started",
            AlertEvent::ServiceStopped => "service_stopped",
            AlertEvent::TcpNotAccepting => "tcp_not_accepting",
            AlertEvent::TcpListenersDown => "tcp_listeners_down",
            AlertEvent::TcpReaccepting => "tcp_reaccepting",
            AlertEvent::SshBanned => "ssh_banned",
            AlertEvent::SshAllowed => "ssh_allowed",
        }
    }

    /// Dropped in quiet mode.
    fn is_informational(&self) -> bool {
        matches!(self, AlertEvent::ServiceStarted | AlertEvent::SshAllowed)
    }
}

/// Posts JSON alerts to a webhook.
///
/// `notify` never blocks the caller: the request runs on its own task and
/// any failure is logged and dropped.
pub struct AlertManager {
    webhook_url: Option<String>,
    enabled: bool,
    quiet: bool,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl AlertManager {
    pub fn new(webhook_url: Option<String>, enabled: bool, quiet: bool) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(5))
            .build_http();
        Self {
            webhook_url,
            enabled,
            quiet,
            client,
        }
    }

    /// A manager that only logs. Used when alerting is not configured.
    pub fn disabled() -> Self {
        Self::new(None, false, false)
    }

    pub fn notify(self: &Arc<Self>, event: AlertEvent, message: impl Into<String>) {
        let message = message.into();
        if !self.enabled || (self.quiet && event.is_informational()) {
            debug!(event = event.as_str(), msg = %message, "Alert suppressed");
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.send_alert(event, &message).await;
        });
    }

    pub async fn send_alert(&self, event: AlertEvent, message: &str) {
        let event_type = event.as_str();

        let url = match &self.webhook_url {
            Some(u) if !u.is_empty() => u.clone(),
            _ => {
                info!(event = event_type, msg = message, "Alert (no webhook configured)");
                return;
            }
        };

        let payload = serde_json::json!({
            "event": event_type,
            "message": message,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "source": "bastion-gate"
        });

        let req = match hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(&url)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(payload.to_string())))
        {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to build alert request: {}", e);
                return;
            }
        };

        match tokio::time::timeout(Duration::from_secs(10), self.client.request(req)).await {
            Ok(Ok(resp)) => {
                info!(
                    status = resp.status().as_u16(),
                    event = event_type,
                    "Alert sent to webhook"
                );
            }
            Ok(Err(e)) => {
                warn!(error = %e, event = event_type, "Failed to send alert to webhook");
            }
            Err(_) => {
                warn!(event = event_type, "Alert webhook request timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(AlertEvent::TcpListenersDown.as_str(), "tcp_listeners_down");
        assert!(AlertEvent::SshAllowed.is_informational());
        assert!(!AlertEvent::SshBanned.is_informational());
    }

    #[tokio::test]
    async fn test_webhook_receives_payload() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut total = 0;
            loop {
                let n = sock.read(&mut buf[total..]).await.unwrap();
                total += n;
                let text = String::from_utf8_lossy(&buf[..total]);
                if n == 0 || text.contains("\"source\":\"bastion-gate\"") {
                    break;
                }
            }
            sock.write_all(b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..total]).to_string()
        });

        let manager = AlertManager::new(Some(format!("http://{}/hook", addr)), true, false);
        manager.send_alert(AlertEvent::SshBanned, "203.0.113.9 banned").await;

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.contains("\"event\":\"ssh_banned\""));
    }
}
