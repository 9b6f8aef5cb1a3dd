use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::counters::CounterSource;
use crate::config::settings::BandwidthConfig;
use crate::models::notify::NotifyData;
use crate::models::record::IfaceSample;
use crate::storage::sqlite::{SqliteStore, StoreError};

/// Per-subscriber buffer. A full buffer drops deliveries for that subscriber.
const SUBSCRIBER_BUFFER: usize = 16;

/// Newest sample older than this means the sampler is stuck; skip evaluation.
const STALE_SAMPLE_SECS: i64 = 60;

/// Samples are always kept at least this long.
const MIN_RETENTION_SECS: i64 = 90 * 24 * 3600;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("interface '{iface}' unavailable: {source}")]
    Interface {
        iface: String,
        #[source]
        source: std::io::Error,
    },
    #[error("subscriber '{0}' already registered")]
    DuplicateSubscriber(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Samples an interface's byte counters and publishes throughput verdicts.
///
/// With no interface configured the monitor still hands out subscriptions
/// and honours `stop`, but never publishes.
pub struct BandwidthMonitor {
    config: BandwidthConfig,
    store: Arc<SqliteStore>,
    counters: Arc<dyn CounterSource>,
    subscribers: DashMap<String, mpsc::Sender<NotifyData>>,
    token: CancellationToken,
    tasks: TaskTracker,
}

impl BandwidthMonitor {
    /// Fails when an interface is configured but cannot be read.
    pub fn new(
        config: BandwidthConfig,
        store: Arc<SqliteStore>,
        counters: Arc<dyn CounterSource>,
    ) -> Result<Self, MonitorError> {
        if !config.interface_name.is_empty() {
            counters
                .read(&config.interface_name)
                .map_err(|source| MonitorError::Interface {
                    iface: config.interface_name.clone(),
                    source,
                })?;
        }
        Ok(Self {
            config,
            store,
            counters,
            subscribers: DashMap::new(),
            token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        !self.config.interface_name.is_empty()
    }

    pub fn add_subscriber(&self, name: &str) -> Result<mpsc::Receiver<NotifyData>, MonitorError> {
        use dashmap::mapref::entry::Entry;

        match self.subscribers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(MonitorError::DuplicateSubscriber(name.to_string())),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
                slot.insert(tx);
                debug!(subscriber = name, "Bandwidth subscriber added");
                Ok(rx)
            }
        }
    }

    /// Spawn the sampler, evaluator and sweeper loops.
    pub fn start(self: &Arc<Self>) {
        if !self.is_enabled() {
            info!("No interface configured, bandwidth monitor idle");
            return;
        }

        let cycle = Duration::from_secs(self.config.data_collection_cycle_secs);
        let period = Duration::from_secs(self.config.statistical_period_secs);

        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            this.run_every(cycle, "sampler", |m| {
                if let Err(e) = m.sample_once(Utc::now()) {
                    warn!(error = %e, "Interface sampling failed");
                }
            })
            .await
        });

        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            this.run_every(period, "evaluator", |m| match m.evaluate_once(Utc::now()) {
                Ok(Some(data)) => m.publish(&data),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Bandwidth evaluation failed"),
            })
            .await
        });

        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            this.run_every(period * 10, "sweeper", |m| {
                if let Err(e) = m.sweep_once(Utc::now()) {
                    warn!(error = %e, "Interface sample sweep failed");
                }
            })
            .await
        });

        info!(
            iface = %self.config.interface_name,
            cycle_secs = cycle.as_secs(),
            period_secs = period.as_secs(),
            span_secs = self.config.statistical_time_span_secs,
            "Bandwidth monitor started"
        );
    }

    async fn run_every(&self, every: Duration, name: &'static str, work: impl Fn(&Self)) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => work(self),
            }
        }
        debug!(task = name, "Bandwidth monitor task stopped");
    }

    /// Cancel every loop, wait for them, then close all subscriptions.
    pub async fn stop(&self) {
        self.token.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.subscribers.clear();
        info!("Bandwidth monitor stopped");
    }

    pub fn sample_once(&self, now: DateTime<Utc>) -> Result<IfaceSample, MonitorError> {
        let iface = &self.config.interface_name;
        let counters = self.counters.read(iface).map_err(|source| MonitorError::Interface {
            iface: iface.clone(),
            source,
        })?;
        let sample = IfaceSample {
            time: now,
            bytes_sent: counters.bytes_sent,
            bytes_recv: counters.bytes_recv,
        };
        self.store.add_iface_sample(&sample)?;
        Ok(sample)
    }

    /// Compare the newest sample with the one a full span earlier. Falls back
    /// to the oldest sample (unstable baseline) when history is too short.
    /// `Ok(None)` means this cycle has nothing trustworthy to report.
    pub fn evaluate_once(&self, now: DateTime<Utc>) -> Result<Option<NotifyData>, MonitorError> {
        let newest = match self.store.newest_iface_sample() {
            Ok(s) => s,
            Err(StoreError::NotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if now - newest.time > chrono::Duration::seconds(STALE_SAMPLE_SECS) {
            debug!(newest = %newest.time, "Newest interface sample is stale, skipping");
            return Ok(None);
        }

        let span = chrono::Duration::seconds(self.config.statistical_time_span_secs as i64);
        let (baseline, stable) = match self.store.iface_sample_before(newest.time - span) {
            Ok(s) => (s, true),
            Err(StoreError::NotFound) => (self.store.oldest_iface_sample()?, false),
            Err(e) => return Err(e.into()),
        };

        let span_seconds = (newest.time - baseline.time).num_milliseconds() as f64 / 1000.0;
        if span_seconds <= 0.0 {
            return Ok(None);
        }

        let rate = |to: u64, from: u64| (to.saturating_sub(from) as f64 / span_seconds).ceil() as u64;
        let data = NotifyData::from_rates(
            rate(newest.bytes_sent, baseline.bytes_sent),
            rate(newest.bytes_recv, baseline.bytes_recv),
            self.config.sent_limit,
            self.config.recv_limit,
            span_seconds,
            stable,
        );
        debug!(
            sent_bps = data.bytes_sent_per_second,
            recv_bps = data.bytes_recv_per_second,
            span_secs = span_seconds,
            stable = stable,
            ok = data.is_ok,
            "Bandwidth evaluated"
        );
        Ok(Some(data))
    }

    /// Non-blocking fan-out. Closed subscribers are dropped.
    pub fn publish(&self, data: &NotifyData) {
        let mut closed = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.value().try_send(data.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscriber = %entry.key(), "Subscriber buffer full, delivery dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(entry.key().clone()),
            }
        }
        for name in closed {
            self.subscribers.remove(&name);
        }
    }

    pub fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize, MonitorError> {
        let span_secs = self.config.statistical_time_span_secs as i64;
        let keep = chrono::Duration::seconds(std::cmp::max(span_secs * 3, MIN_RETENTION_SECS));
        let removed = self.store.purge_iface_samples(now - keep)?;
        if removed > 0 {
            info!(removed = removed, "Old interface samples purged");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults;
    use crate::monitor::counters::IfaceCounters;
    use parking_lot::Mutex;

    struct FakeCounters(Mutex<IfaceCounters>);

    impl CounterSource for FakeCounters {
        fn read(&self, iface: &str) -> std::io::Result<IfaceCounters> {
            if iface == "missing0" {
                return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such interface"));
            }
            Ok(*self.0.lock())
        }
    }

    fn config(iface: &str, span: u64) -> BandwidthConfig {
        BandwidthConfig {
            interface_name: iface.into(),
            sent_limit: 1000,
            recv_limit: 0,
            statistical_time_span_secs: span,
            ..defaults::default_bandwidth_config()
        }
    }

    fn monitor(iface: &str, span: u64) -> (tempfile::TempDir, Arc<SqliteStore>, Arc<FakeCounters>, BandwidthMonitor) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("bw.db").to_str().unwrap()).unwrap());
        let counters = Arc::new(FakeCounters(Mutex::new(IfaceCounters::default())));
        let monitor = BandwidthMonitor::new(config(iface, span), store.clone(), counters.clone()).unwrap();
        (dir, store, counters, monitor)
    }

    fn push(store: &SqliteStore, at: DateTime<Utc>, sent: u64, recv: u64) {
        store
            .add_iface_sample(&IfaceSample { time: at, bytes_sent: sent, bytes_recv: recv })
            .unwrap();
    }

    #[test]
    fn test_missing_interface_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("bw.db").to_str().unwrap()).unwrap());
        let counters = Arc::new(FakeCounters(Mutex::new(IfaceCounters::default())));
        let err = BandwidthMonitor::new(config("missing0", 60), store, counters).err().unwrap();
        assert!(matches!(err, MonitorError::Interface { .. }));
    }

    #[test]
    fn test_stable_baseline_over_limit() {
        let (_dir, store, _c, monitor) = monitor("eth0", 60);
        let now = Utc::now();
        push(&store, now - chrono::Duration::seconds(100), 0, 0);
        push(&store, now - chrono::Duration::seconds(60), 10_000, 0);
        push(&store, now, 100_000, 6_000);

        let data = monitor.evaluate_once(now).unwrap().unwrap();
        assert!(data.uses_stable_baseline);
        assert_eq!(data.span_seconds, 60.0);
        assert_eq!(data.bytes_sent_per_second, 1500);
        assert_eq!(data.bytes_recv_per_second, 100);
        assert!(!data.is_sent_ok);
        assert!(data.is_recv_ok);
        assert!(!data.is_ok);
    }

    #[test]
    fn test_short_history_falls_back_to_oldest() {
        let (_dir, store, _c, monitor) = monitor("eth0", 1800);
        let now = Utc::now();
        push(&store, now - chrono::Duration::seconds(30), 0, 0);
        push(&store, now, 3001, 0);

        let data = monitor.evaluate_once(now).unwrap().unwrap();
        assert!(!data.uses_stable_baseline);
        assert_eq!(data.bytes_sent_per_second, 101);
        assert!(data.is_ok);
    }

    #[test]
    fn test_skips_stale_or_single_sample() {
        let (_dir, store, _c, monitor) = monitor("eth0", 60);
        let now = Utc::now();
        assert!(monitor.evaluate_once(now).unwrap().is_none());

        push(&store, now, 10, 10);
        assert!(monitor.evaluate_once(now).unwrap().is_none());

        assert!(monitor
            .evaluate_once(now + chrono::Duration::seconds(61))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_counter_reset_yields_zero_rate() {
        let (_dir, store, _c, monitor) = monitor("eth0", 60);
        let now = Utc::now();
        push(&store, now - chrono::Duration::seconds(60), 50_000, 50_000);
        push(&store, now, 10, 10);

        let data = monitor.evaluate_once(now).unwrap().unwrap();
        assert_eq!(data.bytes_sent_per_second, 0);
        assert!(data.is_ok);
    }

    #[test]
    fn test_sample_and_sweep() {
        let (_dir, store, counters, monitor) = monitor("eth0", 60);
        let now = Utc::now();
        *counters.0.lock() = IfaceCounters { bytes_sent: 42, bytes_recv: 7 };
        monitor.sample_once(now).unwrap();
        assert_eq!(store.newest_iface_sample().unwrap().bytes_sent, 42);

        push(&store, now - chrono::Duration::days(91), 1, 1);
        assert_eq!(monitor.sweep_once(now).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_publish_never_blocks_and_stop_closes() {
        let (_dir, _store, _c, monitor) = monitor("", 60);
        let mut fast = monitor.add_subscriber("fast").unwrap();
        let _slow = monitor.add_subscriber("slow").unwrap();
        assert!(matches!(
            monitor.add_subscriber("fast"),
            Err(MonitorError::DuplicateSubscriber(_))
        ));

        let data = NotifyData::from_rates(1, 1, 0, 0, 60.0, true);
        for _ in 0..(SUBSCRIBER_BUFFER + 5) {
            monitor.publish(&data);
            assert_eq!(fast.try_recv().unwrap(), data);
        }
        monitor.publish(&data);
        assert_eq!(fast.recv().await.unwrap(), data);

        monitor.stop().await;
        while fast.try_recv().is_ok() {}
        assert!(fast.recv().await.is_none());
    }
}
