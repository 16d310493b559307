use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rusqlite::{params_from_iter, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info, warn};

use crate::record::{Scalar, VesselRecord, IDENTITY_KEY};

pub const TABLE: &str = "vessels";

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS vessels (
            SHIP_ID             TEXT PRIMARY KEY,
            SHIPNAME            TEXT,
            IMO                 TEXT,
            MMSI                TEXT,
            CALLSIGN            TEXT,
            FLAG                TEXT,
            TYPE_NAME           TEXT,
            STATUS_NAME         TEXT,
            DESTINATION         TEXT,
            LAT                 REAL,
            LON                 REAL,
            SPEED               REAL,
            COURSE              REAL,
            HEADING             REAL,
            DRAUGHT             REAL,
            LENGTH              REAL,
            WIDTH               REAL,
            DWT                 REAL,
            GT                  REAL,
            ETA                 TEXT,
            ETA_UPDATED         TEXT,
            FIRST_POS_TIMESTAMP TEXT,
            LAST_POS            TEXT,
            LAUNCH_DATE         TEXT,
            created_at          TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_vessels_imo ON vessels(IMO);
        CREATE INDEX IF NOT EXISTS idx_vessels_mmsi ON vessels(MMSI);
        ",
    )?;
    Ok(())
}

/// Fails when the vessels table is missing; nothing useful can run without it.
pub fn verify_schema(conn: &Connection) -> Result<()> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [TABLE],
            |r| r.get(0),
        )
        .optional()?;
    if found.is_none() {
        bail!("Required table `{}` is missing (run `vessel_sync init`)", TABLE);
    }
    Ok(())
}

/// Upper-cased column names of the vessels table.
pub fn table_columns(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", TABLE))?;
    let cols = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cols.into_iter().map(|c| c.to_ascii_uppercase()).collect())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl UpsertStats {
    pub fn saved(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Insert-or-update every record inside one transaction. A bad record rolls
/// back its own savepoint and is counted; connection-level faults roll back
/// the whole batch and are returned.
pub fn upsert_batch(conn: &Connection, records: &[VesselRecord]) -> rusqlite::Result<UpsertStats> {
    let columns = table_columns(conn)?;
    let mut tx = conn.unchecked_transaction()?;
    let mut stats = UpsertStats::default();

    for record in records {
        let sp = tx.savepoint()?;
        match upsert_one(&sp, &columns, record) {
            Ok(outcome) => {
                sp.commit()?;
                match outcome {
                    Upserted::Inserted => stats.inserted += 1,
                    Upserted::Updated => stats.updated += 1,
                    Upserted::Unchanged => stats.unchanged += 1,
                }
            }
            Err(RecordError::Fatal(e)) => {
                drop(sp);
                // tx rolls back on drop
                return Err(e);
            }
            Err(RecordError::Rejected(reason)) => {
                drop(sp);
                warn!(ship_id = ?record.get(IDENTITY_KEY), "Record not saved: {}", reason);
                stats.failed += 1;
            }
        }
    }

    tx.commit()?;
    info!(
        inserted = stats.inserted,
        updated = stats.updated,
        unchanged = stats.unchanged,
        failed = stats.failed,
        "Upsert batch committed"
    );
    Ok(stats)
}

enum Upserted {
    Inserted,
    Updated,
    Unchanged,
}

enum RecordError {
    /// Only this record is affected.
    Rejected(String),
    /// The transaction itself is unusable.
    Fatal(rusqlite::Error),
}

impl From<rusqlite::Error> for RecordError {
    fn from(e: rusqlite::Error) -> Self {
        if is_connection_fault(&e) {
            RecordError::Fatal(e)
        } else {
            RecordError::Rejected(e.to_string())
        }
    }
}

fn is_connection_fault(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::CannotOpen
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::ReadOnly
        )
    )
}

fn upsert_one(
    conn: &Connection,
    columns: &HashSet<String>,
    record: &VesselRecord,
) -> Result<Upserted, RecordError> {
    let ship_id = match record.get(IDENTITY_KEY).and_then(Scalar::as_key) {
        Some(id) => id,
        None => return Err(RecordError::Rejected("no identity key".into())),
    };

    let mut fields: Vec<(&str, &Scalar)> = Vec::new();
    for (key, value) in record {
        if key == IDENTITY_KEY {
            continue;
        }
        if columns.contains(key.as_str()) {
            fields.push((key.as_str(), value));
        } else {
            debug!(field = key.as_str(), "Dropping field with no column");
        }
    }

    let exists = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE {} = ?1", TABLE, IDENTITY_KEY),
            [&ship_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    if exists {
        if fields.is_empty() {
            info!(ship_id = ship_id.as_str(), "No updatable fields, skipping");
            return Ok(Upserted::Unchanged);
        }
        let assignments: Vec<String> = fields
            .iter()
            .enumerate()
            .map(|(i, (k, _))| format!("\"{}\" = ?{}", k, i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            TABLE,
            assignments.join(", "),
            IDENTITY_KEY,
            fields.len() + 1
        );
        let ship_id_value = Scalar::Text(ship_id);
        let params = fields
            .iter()
            .map(|(_, v)| *v)
            .chain(std::iter::once(&ship_id_value));
        conn.execute(&sql, params_from_iter(params))?;
        Ok(Upserted::Updated)
    } else {
        let ship_id_value = Scalar::Text(ship_id);
        let names: Vec<String> = std::iter::once(IDENTITY_KEY)
            .chain(fields.iter().map(|(k, _)| *k))
            .map(|k| format!("\"{}\"", k))
            .collect();
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            TABLE,
            names.join(", "),
            placeholders.join(", ")
        );
        let params = std::iter::once(&ship_id_value).chain(fields.iter().map(|(_, v)| *v));
        conn.execute(&sql, params_from_iter(params))?;
        Ok(Upserted::Inserted)
    }
}

// ── Stats ──

pub struct VesselRow {
    pub ship_id: String,
    pub name: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub speed: Option<f64>,
}

pub fn count(conn: &Connection) -> Result<usize> {
    let n: usize = conn.query_row(&format!("SELECT COUNT(*) FROM {}", TABLE), [], |r| r.get(0))?;
    Ok(n)
}

pub fn fetch_recent(conn: &Connection, limit: usize) -> Result<Vec<VesselRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT SHIP_ID, SHIPNAME, LAT, LON, SPEED FROM {} ORDER BY rowid DESC LIMIT {}",
        TABLE, limit
    ))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(VesselRow {
                ship_id: row.get(0)?,
                name: row.get(1)?,
                lat: row.get(2)?,
                lon: row.get(3)?,
                speed: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
