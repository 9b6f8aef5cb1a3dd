use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One SSH connection attempt, accepted or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: i64,
    pub from: String,
    pub to: String,
    pub accepted: bool,
    pub time: DateTime<Utc>,
    pub duration_millis: Option<i64>,
    pub mark: String,
}

/// Cumulative interface byte counters at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfaceSample {
    pub time: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanEntry {
    pub id: i64,
    pub subject: String,
    pub start_at: Option<DateTime<Utc>>,
    pub stop_at: Option<DateTime<Utc>>,
}

impl BanEntry {
    /// Open-ended on either side when the bound is unset.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.start_at.map_or(true, |start| now >= start) && self.stop_at.map_or(true, |stop| now <= stop)
    }
}

/// Geographic dimension of a location ban.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationDimension {
    Nation,
    Province,
    City,
    Isp,
}

impl LocationDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationDimension::Nation => "nation",
            LocationDimension::Province => "province",
            LocationDimension::City => "city",
            LocationDimension::Isp => "isp",
        }
    }
}

impl fmt::Display for LocationDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
