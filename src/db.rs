use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, params};
use uuid::Uuid;

use crate::error::AdError;
use crate::models::ad::{Ad, Gender, Platform};

/// Durable ad store. The single connection behind a mutex keeps SQLite's
/// serializable transactions, which is what the `MAX(version)+1` allocation
/// requires; the distributed lock already serializes writers across
/// replicas, so per-process contention here is negligible.
pub struct AdDb {
    conn: Mutex<Connection>,
}

impl AdDb {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Private throwaway database, used by tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS ads (
                id         TEXT PRIMARY KEY,
                title      TEXT NOT NULL,
                content    TEXT NOT NULL,
                start_at   TEXT NOT NULL,
                end_at     TEXT NOT NULL,
                age_start  INTEGER NOT NULL,
                age_end    INTEGER NOT NULL,
                gender     TEXT NOT NULL,
                country    TEXT NOT NULL,
                platform   TEXT NOT NULL,
                version    INTEGER NOT NULL,
                is_active  INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_ads_version ON ads(version);
            CREATE INDEX IF NOT EXISTS idx_ads_active ON ads(is_active);
            ",
        )?;
        Ok(())
    }

    /// Allocate `MAX(version)+1` and persist the ad in one transaction.
    ///
    /// Returns `None` when a row with this id already exists: the caller is
    /// retrying a create that already committed, and the retry must succeed
    /// without burning a version or appending to the log again.
    pub fn insert_with_next_version(&self, ad: &mut Ad) -> Result<Option<u64>, AdError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM ads WHERE id = ?1",
                params![ad.id.to_string()],
                |_| Ok(()),
            )
            .map(|_| true)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(false),
                other => Err(other),
            })?;
        if exists {
            return Ok(None);
        }

        let max: u64 = tx.query_row("SELECT COALESCE(MAX(version), 0) FROM ads", [], |r| {
            r.get(0)
        })?;
        let version = max + 1;
        ad.version = version;

        tx.execute(
            "INSERT INTO ads (id, title, content, start_at, end_at, age_start, age_end,
                              gender, country, platform, version, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, ?12)",
            params![
                ad.id.to_string(),
                ad.title,
                ad.content,
                ad.start_at.to_rfc3339(),
                ad.end_at.to_rfc3339(),
                ad.age_start,
                ad.age_end,
                encode_set(&ad.gender)?,
                encode_set(&ad.country)?,
                encode_set(&ad.platform)?,
                version,
                ad.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(Some(version))
    }

    /// Turn the active row for `ad_id` into a tombstone carrying a freshly
    /// allocated version, and compact every older tombstone in the same
    /// transaction. Returns `None` when no active row exists (the delete
    /// lost a race with another delete or the expiry task).
    pub fn tombstone_with_next_version(&self, ad_id: Uuid) -> Result<Option<u64>, AdError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let max: u64 = tx.query_row("SELECT COALESCE(MAX(version), 0) FROM ads", [], |r| {
            r.get(0)
        })?;
        let version = max + 1;

        let changed = tx.execute(
            "UPDATE ads SET is_active = 0, version = ?1 WHERE id = ?2 AND is_active = 1",
            params![version, ad_id.to_string()],
        )?;
        if changed == 0 {
            return Ok(None);
        }

        tx.execute(
            "DELETE FROM ads WHERE version < ?1 AND is_active = 0",
            params![version],
        )?;
        tx.commit()?;
        Ok(Some(version))
    }

    /// Consistent snapshot for restore: `MAX(version)` over every row
    /// (tombstones included) plus all active ads, read in one transaction.
    pub fn snapshot(&self) -> Result<(u64, Vec<Ad>), AdError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let applied: u64 = tx.query_row("SELECT COALESCE(MAX(version), 0) FROM ads", [], |r| {
            r.get(0)
        })?;

        let mut stmt = tx.prepare(
            "SELECT id, title, content, start_at, end_at, age_start, age_end,
                    gender, country, platform, version, is_active, created_at
             FROM ads WHERE is_active = 1 ORDER BY version ASC",
        )?;
        let ads = stmt
            .query_map([], ad_from_row)?
            .collect::<rusqlite::Result<Vec<Ad>>>()?;
        drop(stmt);
        tx.commit()?;

        Ok((applied, ads))
    }

    /// Number of rows, tombstones included. Used by tests to observe
    /// compaction.
    pub fn row_count(&self) -> Result<usize, AdError> {
        let conn = self.conn.lock().unwrap();
        let count: usize = conn.query_row("SELECT COUNT(*) FROM ads", [], |r| r.get(0))?;
        Ok(count)
    }
}

fn encode_set<T: serde::Serialize>(set: &[T]) -> Result<String, rusqlite::Error> {
    serde_json::to_string(set).map_err(|e| {
        rusqlite::Error::ToSqlConversionFailure(Box::new(e))
    })
}

fn decode_json<T: serde::de::DeserializeOwned>(idx: usize, raw: String) -> rusqlite::Result<T> {
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn decode_time(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn ad_from_row(row: &Row<'_>) -> rusqlite::Result<Ad> {
    let id_raw: String = row.get(0)?;
    let id = Uuid::from_str(&id_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    Ok(Ad {
        id,
        title: row.get(1)?,
        content: row.get(2)?,
        start_at: decode_time(3, row.get(3)?)?,
        end_at: decode_time(4, row.get(4)?)?,
        age_start: row.get(5)?,
        age_end: row.get(6)?,
        gender: decode_json::<Vec<Gender>>(7, row.get(7)?)?,
        country: decode_json::<Vec<String>>(8, row.get(8)?)?,
        platform: decode_json::<Vec<Platform>>(9, row.get(9)?)?,
        version: row.get(10)?,
        is_active: row.get(11)?,
        created_at: decode_time(12, row.get(12)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mock_ad;

    #[test]
    fn versions_are_allocated_contiguously() {
        let db = AdDb::open_in_memory().unwrap();
        for expected in 1..=3u64 {
            let mut ad = mock_ad(0);
            let version = db.insert_with_next_version(&mut ad).unwrap().unwrap();
            assert_eq!(version, expected);
            assert_eq!(ad.version, expected);
        }
    }

    #[test]
    fn reinserting_an_existing_id_is_a_noop() {
        let db = AdDb::open_in_memory().unwrap();
        let mut ad = mock_ad(0);
        db.insert_with_next_version(&mut ad).unwrap().unwrap();

        let mut retry = ad.clone();
        assert!(db.insert_with_next_version(&mut retry).unwrap().is_none());
        let (applied, ads) = db.snapshot().unwrap();
        assert_eq!(applied, 1);
        assert_eq!(ads.len(), 1);
    }

    #[test]
    fn tombstone_allocates_a_fresh_version_and_compacts() {
        let db = AdDb::open_in_memory().unwrap();
        let mut a = mock_ad(0);
        let mut b = mock_ad(0);
        db.insert_with_next_version(&mut a).unwrap().unwrap();
        db.insert_with_next_version(&mut b).unwrap().unwrap();

        let v3 = db.tombstone_with_next_version(a.id).unwrap().unwrap();
        assert_eq!(v3, 3);
        // a's tombstone row is still there to sequence the delete.
        assert_eq!(db.row_count().unwrap(), 2);

        let v4 = db.tombstone_with_next_version(b.id).unwrap().unwrap();
        assert_eq!(v4, 4);
        // Compaction dropped a's older tombstone; only b's remains.
        assert_eq!(db.row_count().unwrap(), 1);
    }

    #[test]
    fn tombstoning_a_missing_or_inactive_ad_returns_none() {
        let db = AdDb::open_in_memory().unwrap();
        assert!(
            db.tombstone_with_next_version(Uuid::new_v4())
                .unwrap()
                .is_none()
        );

        let mut ad = mock_ad(0);
        db.insert_with_next_version(&mut ad).unwrap().unwrap();
        db.tombstone_with_next_version(ad.id).unwrap().unwrap();
        assert!(
            db.tombstone_with_next_version(ad.id)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn snapshot_reports_max_version_across_tombstones() {
        let db = AdDb::open_in_memory().unwrap();
        let mut a = mock_ad(0);
        let mut b = mock_ad(0);
        db.insert_with_next_version(&mut a).unwrap().unwrap();
        db.insert_with_next_version(&mut b).unwrap().unwrap();
        db.tombstone_with_next_version(a.id).unwrap().unwrap();

        let (applied, ads) = db.snapshot().unwrap();
        assert_eq!(applied, 3);
        assert_eq!(ads.len(), 1);
        assert_eq!(ads[0].id, b.id);
        assert_eq!(ads[0].version, 2);
    }

    #[test]
    fn snapshot_round_trips_every_field() {
        let db = AdDb::open_in_memory().unwrap();
        let mut ad = mock_ad(0);
        db.insert_with_next_version(&mut ad).unwrap().unwrap();

        let (_, ads) = db.snapshot().unwrap();
        let got = &ads[0];
        assert_eq!(got.id, ad.id);
        assert_eq!(got.title, ad.title);
        assert_eq!(got.content, ad.content);
        assert_eq!(got.age_start, ad.age_start);
        assert_eq!(got.age_end, ad.age_end);
        assert_eq!(got.gender, ad.gender);
        assert_eq!(got.country, ad.country);
        assert_eq!(got.platform, ad.platform);
        assert_eq!(got.start_at.timestamp(), ad.start_at.timestamp());
        assert_eq!(got.created_at.timestamp(), ad.created_at.timestamp());
        assert!(got.is_active);
    }
}
