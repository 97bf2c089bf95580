//! Durable nameplate store and the code allocator.
//!
//! One row per active code. A row is live while `now <= created_at +
//! ttl_seconds` and it has not been consumed; expired rows are deleted
//! lazily on first contact and by the periodic sweeper. Writes are
//! serialized through the connection lock; the allocator holds that lock
//! across its load-then-insert critical section.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};

use crate::api::PlateStatus;

/// Errors from the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// 1000 consecutive allocation attempts collided.
    #[error("exhausted allocating nameplate")]
    AllocationExhausted,
}

/// Which side of a pairing is claiming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Host,
    Connector,
}

impl Side {
    /// Accepts `host`/`a` and `connect`/`connector`/`b`, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "host" | "a" => Some(Side::Host),
            "connect" | "connector" | "b" => Some(Side::Connector),
            _ => None,
        }
    }

    fn bit(self) -> i64 {
        match self {
            Side::Host => 1,
            Side::Connector => 2,
        }
    }
}

/// One row of the `nameplates` table.
#[derive(Debug, Clone)]
pub struct NameplateRow {
    pub nameplate: String,
    /// Wall-clock seconds (UTC) at allocation.
    pub created_at: i64,
    pub ttl_seconds: i64,
    /// bit 0 = host claimed, bit 1 = connector claimed.
    pub claimed_mask: i64,
    pub consumed: bool,
    pub fail_count: i64,
    pub last_ip: Option<String>,
}

impl NameplateRow {
    pub fn expires_at(&self) -> i64 {
        self.created_at + self.ttl_seconds
    }

    pub fn expired(&self, now: i64) -> bool {
        now > self.expires_at()
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nameplates(
  nameplate TEXT PRIMARY KEY,
  created_at INTEGER NOT NULL,
  ttl_seconds INTEGER NOT NULL,
  claimed_mask INTEGER NOT NULL DEFAULT 0,
  consumed INTEGER NOT NULL DEFAULT 0,
  fail_count INTEGER NOT NULL DEFAULT 0,
  last_ip TEXT
);
CREATE INDEX IF NOT EXISTS idx_nameplates_created ON nameplates(created_at);
";

/// Handle to the nameplate table. Cheap to clone; all clones share one
/// serialized connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (or creates) the database file with WAL journaling and a
    /// five-second busy timeout.
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Atomic insert; fails if the code is already present.
    pub fn insert(
        &self,
        nameplate: &str,
        ttl: Duration,
        now: i64,
        ip: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO nameplates(nameplate, created_at, ttl_seconds, claimed_mask, consumed, fail_count, last_ip)
             VALUES(?1, ?2, ?3, 0, 0, 0, ?4)",
            params![nameplate, now, ttl.as_secs() as i64, ip],
        )?;
        Ok(())
    }

    /// Loads a row, or `None` if the code is unknown.
    pub fn load(&self, nameplate: &str) -> Result<Option<NameplateRow>, StoreError> {
        let conn = self.conn.lock();
        Self::load_locked(&conn, nameplate)
    }

    fn load_locked(
        conn: &Connection,
        nameplate: &str,
    ) -> Result<Option<NameplateRow>, StoreError> {
        let row = conn
            .query_row(
                "SELECT nameplate, created_at, ttl_seconds, claimed_mask, consumed, fail_count, last_ip
                 FROM nameplates WHERE nameplate=?1",
                params![nameplate],
                |r| {
                    Ok(NameplateRow {
                        nameplate: r.get(0)?,
                        created_at: r.get(1)?,
                        ttl_seconds: r.get(2)?,
                        claimed_mask: r.get(3)?,
                        consumed: r.get::<_, i64>(4)? != 0,
                        fail_count: r.get(5)?,
                        last_ip: r.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// The claim state machine.
    ///
    /// `Failed` is intentionally uniform across missing, expired, consumed,
    /// and bad-side inputs; expired rows are deleted on contact, and
    /// repeated or unrecognized claims bump the fail counter.
    pub fn claim(
        &self,
        nameplate: &str,
        side: &str,
        now: i64,
        ip: &str,
    ) -> Result<(PlateStatus, Option<NameplateRow>), StoreError> {
        let conn = self.conn.lock();

        let Some(mut row) = Self::load_locked(&conn, nameplate)? else {
            return Ok((PlateStatus::Failed, None));
        };
        if row.expired(now) {
            conn.execute("DELETE FROM nameplates WHERE nameplate=?1", params![nameplate])?;
            return Ok((PlateStatus::Failed, None));
        }
        if row.consumed {
            return Ok((PlateStatus::Failed, Some(row)));
        }

        let Some(side) = Side::parse(side) else {
            conn.execute(
                "UPDATE nameplates SET fail_count = fail_count + 1 WHERE nameplate=?1",
                params![nameplate],
            )?;
            row.fail_count += 1;
            return Ok((PlateStatus::Failed, Some(row)));
        };

        let new_mask = row.claimed_mask | side.bit();
        if new_mask == row.claimed_mask {
            // Same side claiming twice.
            conn.execute(
                "UPDATE nameplates SET fail_count = fail_count + 1 WHERE nameplate=?1",
                params![nameplate],
            )?;
            row.fail_count += 1;
            return Ok((PlateStatus::Failed, Some(row)));
        }

        conn.execute(
            "UPDATE nameplates SET claimed_mask=?1, last_ip=?2 WHERE nameplate=?3",
            params![new_mask, ip, nameplate],
        )?;
        row.claimed_mask = new_mask;
        row.last_ip = Some(ip.to_string());

        if new_mask == 3 {
            Ok((PlateStatus::Paired, Some(row)))
        } else {
            Ok((PlateStatus::Waiting, Some(row)))
        }
    }

    /// Marks a code consumed. Idempotent.
    pub fn consume(&self, nameplate: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE nameplates SET consumed=1 WHERE nameplate=?1",
            params![nameplate],
        )?;
        Ok(())
    }

    /// Marks a code consumed and bumps the fail counter exactly once across
    /// any number of calls.
    pub fn fail_and_consume(&self, nameplate: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE nameplates
                SET fail_count = fail_count + CASE WHEN consumed=0 THEN 1 ELSE 0 END,
                    consumed   = 1
              WHERE nameplate = ?1",
            params![nameplate],
        )?;
        Ok(())
    }

    /// Deletes expired and consumed rows; returns how many went away.
    pub fn sweep(&self, now: i64) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM nameplates WHERE (created_at + ttl_seconds) < ?1 OR consumed=1",
            params![now],
        )?;
        Ok(n)
    }

    /// Allocates a fresh nameplate of `digits` decimal digits.
    ///
    /// Samples uniformly, reclaiming rows that are expired or consumed, and
    /// gives up after 1000 collisions. Load-then-insert happens under the
    /// store lock.
    pub fn allocate(
        &self,
        digits: u32,
        ttl: Duration,
        now: i64,
        ip: &str,
    ) -> Result<(String, i64), StoreError> {
        let space = 10u64.pow(digits);
        let conn = self.conn.lock();

        for _ in 0..1000 {
            let n = rand::thread_rng().gen_range(0..space);
            let code = format!("{:0width$}", n, width = digits as usize);

            if let Some(row) = Self::load_locked(&conn, &code)? {
                if !row.expired(now) && !row.consumed {
                    continue; // occupied
                }
                conn.execute("DELETE FROM nameplates WHERE nameplate=?1", params![code])?;
            }
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO nameplates(nameplate, created_at, ttl_seconds, claimed_mask, consumed, fail_count, last_ip)
                 VALUES(?1, ?2, ?3, 0, 0, 0, ?4)",
                params![code, now, ttl.as_secs() as i64, ip],
            )?;
            if inserted == 1 {
                return Ok((code, now + ttl.as_secs() as i64));
            }
        }
        Err(StoreError::AllocationExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(600);

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn insert_then_load() {
        let s = store();
        s.insert("250", TTL, 1000, "10.0.0.1").unwrap();
        let row = s.load("250").unwrap().unwrap();
        assert_eq!(row.created_at, 1000);
        assert_eq!(row.ttl_seconds, 600);
        assert_eq!(row.claimed_mask, 0);
        assert!(!row.consumed);
        assert_eq!(row.last_ip.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn duplicate_insert_fails() {
        let s = store();
        s.insert("250", TTL, 1000, "ip").unwrap();
        assert!(s.insert("250", TTL, 1000, "ip").is_err());
    }

    #[test]
    fn claim_walks_waiting_then_paired() {
        let s = store();
        s.insert("250", TTL, 1000, "ip").unwrap();

        let (st, row) = s.claim("250", "connect", 1001, "1.1.1.1").unwrap();
        assert_eq!(st, PlateStatus::Waiting);
        assert_eq!(row.unwrap().claimed_mask, 2);

        let (st, row) = s.claim("250", "host", 1002, "2.2.2.2").unwrap();
        assert_eq!(st, PlateStatus::Paired);
        let row = row.unwrap();
        assert_eq!(row.claimed_mask, 3);
        assert_eq!(row.last_ip.as_deref(), Some("2.2.2.2"));
    }

    #[test]
    fn claim_accepts_side_aliases() {
        let s = store();
        s.insert("111", TTL, 0, "ip").unwrap();
        let (st, _) = s.claim("111", "A", 1, "ip").unwrap();
        assert_eq!(st, PlateStatus::Waiting);
        let (st, _) = s.claim("111", "Connector", 2, "ip").unwrap();
        assert_eq!(st, PlateStatus::Paired);
    }

    #[test]
    fn claim_missing_row_fails_uniformly() {
        let s = store();
        let (st, row) = s.claim("404", "host", 1, "ip").unwrap();
        assert_eq!(st, PlateStatus::Failed);
        assert!(row.is_none());
    }

    #[test]
    fn claim_expired_row_deletes_it() {
        let s = store();
        s.insert("250", Duration::from_secs(1), 1000, "ip").unwrap();

        let (st, _) = s.claim("250", "host", 1002, "ip").unwrap();
        assert_eq!(st, PlateStatus::Failed);
        assert!(s.load("250").unwrap().is_none());

        // A second claim fails the same way.
        let (st, _) = s.claim("250", "host", 1003, "ip").unwrap();
        assert_eq!(st, PlateStatus::Failed);
    }

    #[test]
    fn claim_same_side_twice_bumps_fail_count() {
        let s = store();
        s.insert("250", TTL, 1000, "ip").unwrap();
        s.claim("250", "host", 1001, "ip").unwrap();

        let (st, row) = s.claim("250", "host", 1002, "ip").unwrap();
        assert_eq!(st, PlateStatus::Failed);
        assert_eq!(row.unwrap().fail_count, 1);
        // Mask is monotonic: the dup claim did not change it.
        assert_eq!(s.load("250").unwrap().unwrap().claimed_mask, 1);
    }

    #[test]
    fn claim_bad_side_bumps_fail_count() {
        let s = store();
        s.insert("250", TTL, 1000, "ip").unwrap();
        let (st, row) = s.claim("250", "sideways", 1001, "ip").unwrap();
        assert_eq!(st, PlateStatus::Failed);
        assert_eq!(row.unwrap().fail_count, 1);
    }

    #[test]
    fn consumed_row_rejects_further_claims() {
        let s = store();
        s.insert("250", TTL, 1000, "ip").unwrap();
        s.consume("250").unwrap();
        let (st, row) = s.claim("250", "host", 1001, "ip").unwrap();
        assert_eq!(st, PlateStatus::Failed);
        assert!(row.unwrap().consumed);
    }

    #[test]
    fn consume_is_idempotent() {
        let s = store();
        s.insert("250", TTL, 1000, "ip").unwrap();
        s.consume("250").unwrap();
        s.consume("250").unwrap();
        assert!(s.load("250").unwrap().unwrap().consumed);
    }

    #[test]
    fn fail_and_consume_increments_once() {
        let s = store();
        s.insert("250", TTL, 1000, "ip").unwrap();

        s.fail_and_consume("250").unwrap();
        s.fail_and_consume("250").unwrap();
        s.fail_and_consume("250").unwrap();

        let row = s.load("250").unwrap().unwrap();
        assert!(row.consumed);
        assert_eq!(row.fail_count, 1);
    }

    #[test]
    fn fail_after_consume_does_not_increment() {
        let s = store();
        s.insert("250", TTL, 1000, "ip").unwrap();
        s.consume("250").unwrap();
        s.fail_and_consume("250").unwrap();
        assert_eq!(s.load("250").unwrap().unwrap().fail_count, 0);
    }

    #[test]
    fn sweep_removes_expired_and_consumed() {
        let s = store();
        s.insert("100", Duration::from_secs(10), 1000, "ip").unwrap();
        s.insert("200", TTL, 1000, "ip").unwrap();
        s.insert("300", TTL, 1000, "ip").unwrap();
        s.consume("300").unwrap();

        let n = s.sweep(1011).unwrap();
        assert_eq!(n, 2);
        assert!(s.load("100").unwrap().is_none());
        assert!(s.load("200").unwrap().is_some());
        assert!(s.load("300").unwrap().is_none());
    }

    #[test]
    fn allocate_yields_zero_padded_unique_codes() {
        let s = store();
        let (code, expires) = s.allocate(3, TTL, 5000, "ip").unwrap();
        assert_eq!(code.len(), 3);
        assert!(code.bytes().all(|b| b.is_ascii_digit()));
        assert_eq!(expires, 5000 + 600);

        let row = s.load(&code).unwrap().unwrap();
        assert_eq!(row.created_at, 5000);
    }

    #[test]
    fn allocate_reclaims_expired_codes() {
        let s = store();
        // Fill the whole 3-digit space with expired rows.
        for n in 0..1000 {
            s.insert(&format!("{n:03}"), Duration::from_secs(1), 0, "ip")
                .unwrap();
        }
        let (code, _) = s.allocate(3, TTL, 10_000, "ip").unwrap();
        let row = s.load(&code).unwrap().unwrap();
        assert_eq!(row.created_at, 10_000);
        assert_eq!(row.claimed_mask, 0);
    }

    #[test]
    fn allocate_exhausts_when_space_is_full() {
        let s = store();
        for n in 0..1000 {
            s.insert(&format!("{n:03}"), TTL, 1000, "ip").unwrap();
        }
        match s.allocate(3, TTL, 1001, "ip") {
            Err(StoreError::AllocationExhausted) => {}
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
}
