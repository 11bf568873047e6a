//! SQLite storage for shifts and completed study records

use crate::record::{AddOutcome, CompletedStudyRecord, ShiftId, ShiftSummary, StudyTypeTotal};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unknown shift: {0}")]
    UnknownShift(ShiftId),
    #[error("Shift already ended: {0}")]
    ShiftEnded(ShiftId),
}

/// Where completed studies go.
///
/// The router writes through this trait only, so tests and alternative
/// back ends can stand in for [`ShiftStore`].
pub trait RecordSink: Send {
    /// Open a new shift starting at `at`
    fn start_shift(&mut self, at: DateTime<Utc>) -> Result<ShiftId, StoreError>;

    /// Add a record to an open shift
    fn add_record(
        &mut self,
        shift: ShiftId,
        record: &CompletedStudyRecord,
    ) -> Result<AddOutcome, StoreError>;
}

/// SQLite-backed shift store
pub struct ShiftStore {
    conn: Connection,
}

impl ShiftStore {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS shifts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT NOT NULL,
                ended_at TEXT
            );

            -- One row per accession per shift; re-dictations do not double count
            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                shift_id INTEGER NOT NULL REFERENCES shifts(id),
                accession TEXT NOT NULL,
                study_type TEXT NOT NULL,
                rvu REAL NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                UNIQUE(shift_id, accession)
            );

            CREATE INDEX IF NOT EXISTS idx_records_shift ON records(shift_id, completed_at);
            "#,
        )?;
        Ok(())
    }

    /// Close a shift
    pub fn end_shift(&mut self, shift: ShiftId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE shifts SET ended_at = ?1 WHERE id = ?2 AND ended_at IS NULL",
            params![at.to_rfc3339(), shift.0],
        )?;

        if updated == 0 {
            return match self.shift_bounds(shift)? {
                Some(_) => Err(StoreError::ShiftEnded(shift)),
                None => Err(StoreError::UnknownShift(shift)),
            };
        }

        info!("Ended {}", shift);
        Ok(())
    }

    /// Most recently started shift that has not been ended
    pub fn latest_open_shift(&self) -> Result<Option<ShiftId>, StoreError> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM shifts WHERE ended_at IS NULL ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id.map(ShiftId))
    }

    /// All records of a shift, ordered by completion time
    pub fn records_for_shift(&self, shift: ShiftId) -> Result<Vec<CompletedStudyRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT accession, study_type, rvu, started_at, completed_at
             FROM records WHERE shift_id = ?1
             ORDER BY completed_at, id",
        )?;

        let rows = stmt.query_map(params![shift.0], |row| {
            Ok(CompletedStudyRecord {
                accession: row.get(0)?,
                study_type: row.get(1)?,
                rvu: row.get(2)?,
                started_at: parse_timestamp(row.get(3)?, 3)?,
                completed_at: parse_timestamp(row.get(4)?, 4)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Totals for a shift
    pub fn shift_summary(&self, shift: ShiftId) -> Result<ShiftSummary, StoreError> {
        let (started_at, ended_at) = self
            .shift_bounds(shift)?
            .ok_or(StoreError::UnknownShift(shift))?;

        let records = self.records_for_shift(shift)?;

        let mut totals: HashMap<&str, StudyTypeTotal> = HashMap::new();
        for record in &records {
            let entry = totals
                .entry(record.study_type.as_str())
                .or_insert_with(|| StudyTypeTotal {
                    study_type: record.study_type.clone(),
                    count: 0,
                    rvu: 0.0,
                });
            entry.count += 1;
            entry.rvu += record.rvu;
        }

        let mut by_type: Vec<StudyTypeTotal> = totals.into_values().collect();
        by_type.sort_by(|a, b| {
            b.rvu
                .total_cmp(&a.rvu)
                .then_with(|| a.study_type.cmp(&b.study_type))
        });

        Ok(ShiftSummary {
            shift_id: shift,
            started_at,
            ended_at,
            study_count: records.len(),
            total_rvu: records.iter().map(|r| r.rvu).sum(),
            by_type,
        })
    }

    fn shift_bounds(
        &self,
        shift: ShiftId,
    ) -> Result<Option<(DateTime<Utc>, Option<DateTime<Utc>>)>, StoreError> {
        let bounds = self
            .conn
            .query_row(
                "SELECT started_at, ended_at FROM shifts WHERE id = ?1",
                params![shift.0],
                |row| {
                    let started = parse_timestamp(row.get(0)?, 0)?;
                    let ended = match row.get::<_, Option<String>>(1)? {
                        Some(text) => Some(parse_timestamp(text, 1)?),
                        None => None,
                    };
                    Ok((started, ended))
                },
            )
            .optional()?;
        Ok(bounds)
    }
}

impl RecordSink for ShiftStore {
    fn start_shift(&mut self, at: DateTime<Utc>) -> Result<ShiftId, StoreError> {
        self.conn.execute(
            "INSERT INTO shifts (started_at) VALUES (?1)",
            params![at.to_rfc3339()],
        )?;
        let shift = ShiftId(self.conn.last_insert_rowid());
        info!("Started {} at {}", shift, at);
        Ok(shift)
    }

    fn add_record(
        &mut self,
        shift: ShiftId,
        record: &CompletedStudyRecord,
    ) -> Result<AddOutcome, StoreError> {
        match self.shift_bounds(shift)? {
            None => return Err(StoreError::UnknownShift(shift)),
            Some((_, Some(_))) => return Err(StoreError::ShiftEnded(shift)),
            Some((_, None)) => {}
        }

        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO records
                (shift_id, accession, study_type, rvu, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                shift.0,
                record.accession,
                record.study_type,
                record.rvu,
                record.started_at.to_rfc3339(),
                record.completed_at.to_rfc3339(),
            ],
        )?;

        if inserted == 0 {
            debug!("{} already has accession {}", shift, record.accession);
            return Ok(AddOutcome::Duplicate);
        }
        Ok(AddOutcome::Inserted)
    }
}

fn parse_timestamp(text: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}
