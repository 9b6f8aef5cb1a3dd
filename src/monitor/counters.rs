use std::io;

use parking_lot::Mutex;
use sysinfo::Networks;

/// Cumulative byte counters of one network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IfaceCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

/// Source of interface counters. Swappable so tests can feed fixed values.
pub trait CounterSource: Send + Sync {
    fn read(&self, iface: &str) -> io::Result<IfaceCounters>;
}

/// Host interface counters through `sysinfo`.
pub struct SystemCounters {
    networks: Mutex<Networks>,
}

impl SystemCounters {
    pub fn new() -> Self {
        Self {
            networks: Mutex::new(Networks::new_with_refreshed_list()),
        }
    }
}

impl Default for SystemCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for SystemCounters {
    /// Interfaces that appeared after startup are picked up by a list refresh.
    fn read(&self, iface: &str) -> io::Result<IfaceCounters> {
        let mut networks = self.networks.lock();
        networks.refresh();
        if !networks.list().contains_key(iface) {
            networks.refresh_list();
        }

        let data = networks.list().get(iface).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("interface '{}' not found", iface))
        })?;
        Ok(IfaceCounters {
            bytes_sent: data.total_transmitted(),
            bytes_recv: data.total_received(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_interface_is_not_found() {
        let source = SystemCounters::new();
        let err = source.read("no-such-iface0").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_loopback_counters_never_decrease() {
        let source = SystemCounters::new();
        let first = source.read("lo").unwrap();
        let second = source.read("lo").unwrap();
        assert!(second.bytes_sent >= first.bytes_sent);
        assert!(second.bytes_recv >= first.bytes_recv);
    }
}
