use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a forward server or a server group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerStatus {
    Ready = 0,
    WaitStart = 1,
    Running = 2,
    WaitStop = 3,
    Stopping = 4,
    Finished = 5,
}

impl ServerStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServerStatus::Ready,
            1 => ServerStatus::WaitStart,
            2 => ServerStatus::Running,
            3 => ServerStatus::WaitStop,
            4 => ServerStatus::Stopping,
            _ => ServerStatus::Finished,
        }
    }

    /// Forward path plus the `WaitStop -> WaitStart` restart edge. Servers
    /// may skip `WaitStop`, and a failed start ends in `Finished`.
    pub fn can_transition(self, to: ServerStatus) -> bool {
        use ServerStatus::*;
        matches!(
            (self, to),
            (Ready, WaitStart)
                | (WaitStart, Running)
                | (WaitStart, Finished)
                | (Running, WaitStop)
                | (Running, Stopping)
                | (WaitStop, Stopping)
                | (WaitStop, WaitStart)
                | (Stopping, Finished)
        )
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Ready => "ready",
            ServerStatus::WaitStart => "wait-start",
            ServerStatus::Running => "running",
            ServerStatus::WaitStop => "wait-stop",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Atomic holder for a [`ServerStatus`]; every change is a compare-and-swap.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ServerStatus::Ready as u8))
    }

    pub fn get(&self) -> ServerStatus {
        ServerStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move `from -> to` if currently in `from`. Returns false (and changes
    /// nothing) when the current state differs or the edge is not allowed.
    pub fn transition(&self, from: ServerStatus, to: ServerStatus) -> bool {
        if !from.can_transition(to) {
            return false;
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}
