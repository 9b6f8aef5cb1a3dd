use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
#[error("connection from {0} is already registered")]
pub struct DuplicateConnection(pub SocketAddr);

/// Live state of one relayed connection.
pub struct ActiveConnection {
    pub target: SocketAddr,
    pub connected_at: Instant,
    cancel: CancellationToken,
}

/// Active relays of one forward server, keyed by client address.
///
/// Used on shutdown to force-close whatever outlives the grace period.
#[derive(Default)]
pub struct ConnectionRegistry {
    active: DashMap<SocketAddr, ActiveConnection>,
    /// Set by `close_all`; late registrations are cancelled on arrival.
    closed: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. The entry lives as long as the returned guard.
    pub fn register(
        self: &Arc<Self>,
        remote: SocketAddr,
        target: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<ConnectionGuard, DuplicateConnection> {
        match self.active.entry(remote) {
            Entry::Occupied(_) => Err(DuplicateConnection(remote)),
            Entry::Vacant(slot) => {
                slot.insert(ActiveConnection {
                    target,
                    connected_at: Instant::now(),
                    cancel: cancel.clone(),
                });
                if self.closed.load(Ordering::SeqCst) {
                    cancel.cancel();
                }
                debug!(remote = %remote, target = %target, "Connection registered");
                Ok(ConnectionGuard {
                    registry: Arc::clone(self),
                    remote,
                })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Signal every registered relay to close. Returns how many were signalled.
    pub fn close_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut closed = 0;
        for entry in self.active.iter() {
            entry.value().cancel.cancel();
            closed += 1;
        }
        closed
    }

    fn remove(&self, remote: &SocketAddr) {
        if let Some((_, conn)) = self.active.remove(remote) {
            debug!(
                remote = %remote,
                target = %conn.target,
                duration_secs = conn.connected_at.elapsed().as_secs(),
                "Connection removed"
            );
        }
    }
}

/// Removes its registry entry when dropped.
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    remote: SocketAddr,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.remote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_duplicate_remote_is_rejected() {
        let registry = Arc::new(ConnectionRegistry::new());
        let target = addr("10.0.0.2:22");
        let _guard = registry
            .register(addr("198.51.100.1:5000"), target, CancellationToken::new())
            .unwrap();
        assert!(registry
            .register(addr("198.51.100.1:5000"), target, CancellationToken::new())
            .is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_guard_drop_unregisters() {
        let registry = Arc::new(ConnectionRegistry::new());
        let guard = registry
            .register(addr("198.51.100.1:5000"), addr("10.0.0.2:22"), CancellationToken::new())
            .unwrap();
        drop(guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_all_cancels_tokens() {
        let registry = Arc::new(ConnectionRegistry::new());
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let _ga = registry.register(addr("198.51.100.1:1"), addr("10.0.0.2:22"), a.clone()).unwrap();
        let _gb = registry.register(addr("198.51.100.2:1"), addr("10.0.0.2:22"), b.clone()).unwrap();

        assert_eq!(registry.close_all(), 2);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());

        let late = CancellationToken::new();
        let _gl = registry.register(addr("198.51.100.3:1"), addr("10.0.0.2:22"), late.clone()).unwrap();
        assert!(late.is_cancelled());
    }
}
