use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;

use super::{CheckpointStore, RecordStore, StoreError};
use crate::record::Record;

/// Alternative record-store backend: one SQLite file, `INSERT OR IGNORE`
/// giving the id dedup and the database's own locking replacing the sidecar
/// lock file. A connection is opened per operation so the store handle stays
/// cheap to clone across workers.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS records (
                id                  TEXT PRIMARY KEY,
                acceptance_rate     TEXT,
                institution         TEXT,
                program             TEXT,
                degree_type         TEXT,
                degree_country      TEXT,
                decision            TEXT,
                notification_date   TEXT,
                notification_method TEXT,
                undergrad_gpa       REAL,
                gre_general         INTEGER,
                gre_verbal          INTEGER,
                analytical_writing  REAL,
                notes               TEXT,
                timeline_event      TEXT,
                timeline_date       TEXT,
                scraped_at          TEXT
            );
            CREATE TABLE IF NOT EXISTS checkpoints (
                key  TEXT PRIMARY KEY,
                page INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }
}

impl RecordStore for SqliteStore {
    fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.connect()?;
        Self::init_schema(&conn)
    }

    fn merge(&self, batch: &[Record]) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let conn = self.connect()?;
        Self::init_schema(&conn)?;

        let tx = conn.unchecked_transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO records
                 (id, acceptance_rate, institution, program, degree_type, degree_country,
                  decision, notification_date, notification_method, undergrad_gpa,
                  gre_general, gre_verbal, analytical_writing, notes,
                  timeline_event, timeline_date, scraped_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            )?;
            for r in batch {
                written += stmt.execute(rusqlite::params![
                    r.id,
                    r.acceptance_rate,
                    r.institution,
                    r.program,
                    r.degree_type,
                    r.degree_country,
                    r.decision,
                    r.notification_date,
                    r.notification_method,
                    r.undergrad_gpa,
                    r.gre_general,
                    r.gre_verbal,
                    r.analytical_writing,
                    r.notes,
                    r.timeline_event,
                    r.timeline_date,
                    r.scraped_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    fn read_all(&self) -> Result<Vec<Record>, StoreError> {
        let conn = self.connect()?;
        Self::init_schema(&conn)?;

        let mut stmt = conn.prepare(
            "SELECT id, acceptance_rate, institution, program, degree_type, degree_country,
                    decision, notification_date, notification_method, undergrad_gpa,
                    gre_general, gre_verbal, analytical_writing, notes,
                    timeline_event, timeline_date, scraped_at
             FROM records ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Record {
                    id: row.get(0)?,
                    acceptance_rate: row.get(1)?,
                    institution: row.get(2)?,
                    program: row.get(3)?,
                    degree_type: row.get(4)?,
                    degree_country: row.get(5)?,
                    decision: row.get(6)?,
                    notification_date: row.get(7)?,
                    notification_method: row.get(8)?,
                    undergrad_gpa: row.get(9)?,
                    gre_general: row.get(10)?,
                    gre_verbal: row.get(11)?,
                    analytical_writing: row.get(12)?,
                    notes: row.get(13)?,
                    timeline_event: row.get(14)?,
                    timeline_date: row.get(15)?,
                    scraped_at: row.get(16)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ── Checkpoint ──

/// Checkpoint row in the same database, keyed per worker partition.
#[derive(Debug, Clone)]
pub struct SqliteCheckpoint {
    store: SqliteStore,
    key: String,
}

impl SqliteCheckpoint {
    pub fn new(store: SqliteStore, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }
}

impl CheckpointStore for SqliteCheckpoint {
    fn load(&self) -> Result<Option<u32>, StoreError> {
        let conn = self.store.connect()?;
        SqliteStore::init_schema(&conn)?;
        let page = conn
            .query_row(
                "SELECT page FROM checkpoints WHERE key = ?1",
                [&self.key],
                |row| row.get::<_, u32>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(page)
    }

    fn save(&self, page: u32) -> Result<(), StoreError> {
        let conn = self.store.connect()?;
        SqliteStore::init_schema(&conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO checkpoints (key, page) VALUES (?1, ?2)",
            rusqlite::params![self.key, page],
        )?;
        Ok(())
    }
}
