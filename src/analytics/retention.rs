use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::settings::RetentionConfig;
use crate::storage::sqlite::{SqliteStore, StoreResult};

/// Sweeps more often than this would only contend with live writers.
const MIN_INTERVAL_SECS: u64 = 300;

/// Periodically drops SSH connection records past their retention window.
pub struct RetentionSweeper {
    store: Arc<SqliteStore>,
    every: Duration,
    keep: chrono::Duration,
}

impl RetentionSweeper {
    pub fn new(config: &RetentionConfig, store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            every: Duration::from_secs(config.interval_secs.max(MIN_INTERVAL_SECS)),
            keep: chrono::Duration::days(config.connection_record_days as i64),
        }
    }

    pub fn interval(&self) -> Duration {
        self.every
    }

    /// Delete records older than the retention window. Returns rows removed.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let removed = self.store.purge_connection_records(now - self.keep)?;
        if removed > 0 {
            info!(removed = removed, keep_days = self.keep.num_days(), "Old connection records purged");
        }
        Ok(removed)
    }

    /// Run until cancelled. The first sweep happens immediately.
    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()) {
                        warn!(error = %e, "Connection record sweep failed");
                    }
                }
            }
        }
        debug!("Retention sweeper stopped");
    }
}
