use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

use crate::models::protocol::Protocol;
use crate::models::record::{BanEntry, ConnectionRecord, IfaceSample, LocationDimension};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Bans, SSH connection history and interface samples.
///
/// Timestamps are stored as unix milliseconds so range queries stay numeric.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn new(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS ip_bans (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                scope       TEXT NOT NULL,
                ip          TEXT NOT NULL,
                start_at    INTEGER,
                stop_at     INTEGER,
                reason      TEXT,
                created_at  TEXT DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS location_bans (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                scope       TEXT NOT NULL,
                dimension   TEXT NOT NULL,
                subject     TEXT NOT NULL,
                start_at    INTEGER,
                stop_at     INTEGER,
                reason      TEXT,
                created_at  TEXT DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS connection_records (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                from_addr       TEXT NOT NULL,
                to_addr         TEXT NOT NULL,
                accepted        INTEGER NOT NULL,
                time            INTEGER NOT NULL,
                duration_millis INTEGER,
                mark            TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS iface_samples (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                time        INTEGER NOT NULL,
                bytes_sent  INTEGER NOT NULL,
                bytes_recv  INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ip_bans_lookup ON ip_bans(scope, ip);
            CREATE INDEX IF NOT EXISTS idx_location_bans_lookup ON location_bans(scope, dimension, subject);
            CREATE INDEX IF NOT EXISTS idx_records_pair_time ON connection_records(from_addr, to_addr, time);
            CREATE INDEX IF NOT EXISTS idx_records_time ON connection_records(time);
            CREATE INDEX IF NOT EXISTS idx_iface_time ON iface_samples(time);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ----------------------------------------------------------------
    // Bans
    // ----------------------------------------------------------------

    pub fn add_ip_ban(
        &self,
        scope: Protocol,
        ip: &str,
        start_at: Option<DateTime<Utc>>,
        stop_at: Option<DateTime<Utc>>,
        reason: Option<&str>,
    ) -> StoreResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ip_bans (scope, ip, start_at, stop_at, reason) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![scope.as_str(), ip, start_at.map(to_millis), stop_at.map(to_millis), reason],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn add_location_ban(
        &self,
        scope: Protocol,
        dimension: LocationDimension,
        subject: &str,
        start_at: Option<DateTime<Utc>>,
        stop_at: Option<DateTime<Utc>>,
        reason: Option<&str>,
    ) -> StoreResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO location_bans (scope, dimension, subject, start_at, stop_at, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                scope.as_str(),
                dimension.as_str(),
                subject,
                start_at.map(to_millis),
                stop_at.map(to_millis),
                reason
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recently created ban for `ip`. Older entries are ignored.
    pub fn latest_ip_ban(&self, scope: Protocol, ip: &str) -> StoreResult<BanEntry> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, ip, start_at, stop_at FROM ip_bans
             WHERE scope = ?1 AND ip = ?2 ORDER BY id DESC LIMIT 1",
            params![scope.as_str(), ip],
            ban_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    pub fn latest_location_ban(
        &self,
        scope: Protocol,
        dimension: LocationDimension,
        subject: &str,
    ) -> StoreResult<BanEntry> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, subject, start_at, stop_at FROM location_bans
             WHERE scope = ?1 AND dimension = ?2 AND subject = ?3 ORDER BY id DESC LIMIT 1",
            params![scope.as_str(), dimension.as_str(), subject],
            ban_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    /// Latest-wins ban check. An empty subject is never banned.
    pub fn is_ip_banned(&self, scope: Protocol, ip: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        if ip.is_empty() {
            return Ok(false);
        }
        match self.latest_ip_ban(scope, ip) {
            Ok(ban) => Ok(ban.is_active(now)),
            Err(StoreError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn is_location_banned(
        &self,
        scope: Protocol,
        dimension: LocationDimension,
        subject: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        if subject.is_empty() {
            return Ok(false);
        }
        match self.latest_location_ban(scope, dimension, subject) {
            Ok(ban) => Ok(ban.is_active(now)),
            Err(StoreError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ----------------------------------------------------------------
    // Connection records
    // ----------------------------------------------------------------

    pub fn add_connection_record(
        &self,
        from: &str,
        to: &str,
        accepted: bool,
        time: DateTime<Utc>,
        mark: &str,
    ) -> StoreResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO connection_records (from_addr, to_addr, accepted, time, mark)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![from, to, accepted, to_millis(time), mark],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Fill in the session duration and append `mark_suffix` to the mark.
    pub fn update_connection_record(&self, id: i64, duration_millis: i64, mark_suffix: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE connection_records SET duration_millis = ?1, mark = mark || ?2 WHERE id = ?3",
            params![duration_millis, mark_suffix, id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Turn an accepted attempt into a refused one, appending `mark_suffix`.
    pub fn reject_connection_record(&self, id: i64, mark_suffix: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE connection_records SET accepted = 0, mark = mark || ?1 WHERE id = ?2",
            params![mark_suffix, id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Records for `from -> to` strictly newer than `after`, oldest first.
    pub fn find_recent_records(
        &self,
        from: &str,
        to: &str,
        after: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ConnectionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, from_addr, to_addr, accepted, time, duration_millis, mark
             FROM connection_records
             WHERE from_addr = ?1 AND to_addr = ?2 AND time > ?3
             ORDER BY time ASC LIMIT ?4",
        )?;
        let rows = stmt.query_map(params![from, to, to_millis(after), limit as i64], |row| {
            Ok(ConnectionRecord {
                id: row.get(0)?,
                from: row.get(1)?,
                to: row.get(2)?,
                accepted: row.get(3)?,
                time: from_millis(row.get(4)?),
                duration_millis: row.get(5)?,
                mark: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_connection_record(&self, id: i64) -> StoreResult<ConnectionRecord> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, from_addr, to_addr, accepted, time, duration_millis, mark
             FROM connection_records WHERE id = ?1",
            params![id],
            |row| {
                Ok(ConnectionRecord {
                    id: row.get(0)?,
                    from: row.get(1)?,
                    to: row.get(2)?,
                    accepted: row.get(3)?,
                    time: from_millis(row.get(4)?),
                    duration_millis: row.get(5)?,
                    mark: row.get(6)?,
                })
            },
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    pub fn purge_connection_records(&self, older_than: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM connection_records WHERE time < ?1",
            params![to_millis(older_than)],
        )?;
        Ok(n)
    }

    // ----------------------------------------------------------------
    // Interface samples
    // ----------------------------------------------------------------

    pub fn add_iface_sample(&self, sample: &IfaceSample) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO iface_samples (time, bytes_sent, bytes_recv) VALUES (?1, ?2, ?3)",
            params![
                to_millis(sample.time),
                sample.bytes_sent as i64,
                sample.bytes_recv as i64
            ],
        )?;
        Ok(())
    }

    pub fn newest_iface_sample(&self) -> StoreResult<IfaceSample> {
        self.query_sample("SELECT time, bytes_sent, bytes_recv FROM iface_samples ORDER BY time DESC, id DESC LIMIT 1", None)
    }

    pub fn oldest_iface_sample(&self) -> StoreResult<IfaceSample> {
        self.query_sample("SELECT time, bytes_sent, bytes_recv FROM iface_samples ORDER BY time ASC, id ASC LIMIT 1", None)
    }

    /// Newest sample taken at or before `time`.
    pub fn iface_sample_before(&self, time: DateTime<Utc>) -> StoreResult<IfaceSample> {
        self.query_sample(
            "SELECT time, bytes_sent, bytes_recv FROM iface_samples WHERE time <= ?1 ORDER BY time DESC, id DESC LIMIT 1",
            Some(to_millis(time)),
        )
    }

    pub fn purge_iface_samples(&self, older_than: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM iface_samples WHERE time < ?1",
            params![to_millis(older_than)],
        )?;
        Ok(n)
    }

    fn query_sample(&self, sql: &str, bound: Option<i64>) -> StoreResult<IfaceSample> {
        let conn = self.conn.lock();
        let map = |row: &Row<'_>| {
            Ok(IfaceSample {
                time: from_millis(row.get(0)?),
                bytes_sent: row.get::<_, i64>(1)?.max(0) as u64,
                bytes_recv: row.get::<_, i64>(2)?.max(0) as u64,
            })
        };
        let found = match bound {
            Some(t) => conn.query_row(sql, params![t], map),
            None => conn.query_row(sql, [], map),
        };
        found.optional()?.ok_or(StoreError::NotFound)
    }
}

fn ban_from_row(row: &Row<'_>) -> rusqlite::Result<BanEntry> {
    Ok(BanEntry {
        id: row.get(0)?,
        subject: row.get(1)?,
        start_at: row.get::<_, Option<i64>>(2)?.map(from_millis),
        stop_at: row.get::<_, Option<i64>>(3)?.map(from_millis),
    })
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = SqliteStore::new(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_ip_ban_latest_wins() {
        let (_dir, store) = store();
        let now = Utc::now();

        store
            .add_ip_ban(Protocol::Ssh, "203.0.113.9", None, None, Some("manual"))
            .unwrap();
        assert!(store.is_ip_banned(Protocol::Ssh, "203.0.113.9", now).unwrap());

        // A newer, already expired entry overrides the permanent one.
        store
            .add_ip_ban(Protocol::Ssh, "203.0.113.9", None, Some(now - Duration::minutes(1)), None)
            .unwrap();
        assert!(!store.is_ip_banned(Protocol::Ssh, "203.0.113.9", now).unwrap());
    }

    #[test]
    fn test_ban_scope_and_empty_subject() {
        let (_dir, store) = store();
        let now = Utc::now();

        store.add_ip_ban(Protocol::Tcp, "198.51.100.1", None, None, None).unwrap();
        assert!(!store.is_ip_banned(Protocol::Ssh, "198.51.100.1", now).unwrap());
        assert!(!store.is_ip_banned(Protocol::Tcp, "", now).unwrap());

        store
            .add_location_ban(Protocol::Tcp, LocationDimension::Nation, "Atlantis", None, None, None)
            .unwrap();
        assert!(store
            .is_location_banned(Protocol::Tcp, LocationDimension::Nation, "Atlantis", now)
            .unwrap());
        assert!(!store
            .is_location_banned(Protocol::Tcp, LocationDimension::City, "Atlantis", now)
            .unwrap());
        assert!(matches!(
            store.latest_location_ban(Protocol::Tcp, LocationDimension::Isp, "x"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_connection_records_window_and_update() {
        let (_dir, store) = store();
        let now = Utc::now();

        for i in 0..4 {
            store
                .add_connection_record("1.1.1.1", "10.0.0.2:22", true, now - Duration::seconds(300 - i * 100), "ok")
                .unwrap();
        }
        store
            .add_connection_record("2.2.2.2", "10.0.0.2:22", true, now, "other")
            .unwrap();

        let recent = store
            .find_recent_records("1.1.1.1", "10.0.0.2:22", now - Duration::seconds(150), 10)
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].time < recent[1].time);

        let id = recent[1].id;
        store.update_connection_record(id, 1234, "; closed normally").unwrap();
        let updated = store.get_connection_record(id).unwrap();
        assert_eq!(updated.duration_millis, Some(1234));
        assert_eq!(updated.mark, "ok; closed normally");

        assert!(matches!(
            store.update_connection_record(9999, 1, ""),
            Err(StoreError::NotFound)
        ));

        let first = recent[0].id;
        store.reject_connection_record(first, "; backend unreachable").unwrap();
        let rejected = store.get_connection_record(first).unwrap();
        assert!(!rejected.accepted);
        assert_eq!(rejected.mark, "ok; backend unreachable");
        assert!(matches!(
            store.reject_connection_record(9999, ""),
            Err(StoreError::NotFound)
        ));

        let purged = store.purge_connection_records(now - Duration::seconds(150)).unwrap();
        assert_eq!(purged, 2);
    }

    #[test]
    fn test_iface_sample_queries() {
        let (_dir, store) = store();
        assert!(matches!(store.newest_iface_sample(), Err(StoreError::NotFound)));

        let base = Utc::now() - Duration::seconds(100);
        for i in 0..5 {
            store
                .add_iface_sample(&IfaceSample {
                    time: base + Duration::seconds(i * 20),
                    bytes_sent: (i as u64) * 1000,
                    bytes_recv: (i as u64) * 500,
                })
                .unwrap();
        }

        assert_eq!(store.newest_iface_sample().unwrap().bytes_sent, 4000);
        assert_eq!(store.oldest_iface_sample().unwrap().bytes_sent, 0);
        let before = store.iface_sample_before(base + Duration::seconds(50)).unwrap();
        assert_eq!(before.bytes_sent, 2000);
        assert!(matches!(
            store.iface_sample_before(base - Duration::seconds(1)),
            Err(StoreError::NotFound)
        ));

        assert_eq!(store.purge_iface_samples(base + Duration::seconds(30)).unwrap(), 2);
    }
}
