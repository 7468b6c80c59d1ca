//! Measurement ingestion.
//!
//! Readings are validated in full before any storage access. Writes for one
//! call (rows plus the auto-close) share a single `BEGIN IMMEDIATE`
//! transaction, and `(session_id, seq)` is a unique key in the table, so a
//! duplicate seq aborts the whole call no matter how it is detected.

use chrono::{DateTime, Utc};
use common::req::{MeasurementInfo, Reading};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::{debug, warn};

use crate::db::models::{MeasurementRow, NewMeasurement};
use crate::error::CoreError;
use crate::schema::{measurements, sessions};
use crate::session::SessionRegistry;
use crate::utils::{datetime_from_epoch_ms, epoch_ms, iso_z};

/// Readings that make up a complete session.
pub const QUOTA: usize = 60;

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub session_id: i64,
    pub seq: i32,
    pub recorded_at: DateTime<Utc>,
    pub ntu: f64,
    pub raw_mv: i64,
}

impl Measurement {
    pub fn to_info(&self) -> MeasurementInfo {
        MeasurementInfo {
            seq: self.seq,
            device_recorded_at: iso_z(&self.recorded_at),
            ntu: self.ntu,
            raw_mv: self.raw_mv,
        }
    }
}

impl TryFrom<MeasurementRow> for Measurement {
    type Error = CoreError;

    fn try_from(row: MeasurementRow) -> Result<Self, Self::Error> {
        let recorded_at = datetime_from_epoch_ms(row.recorded_at).ok_or_else(|| {
            CoreError::persistence(format!(
                "bad timestamp in session {} seq {}",
                row.session_id, row.seq
            ))
        })?;
        Ok(Self {
            session_id: row.session_id,
            seq: row.seq,
            recorded_at,
            ntu: row.ntu,
            raw_mv: row.raw_mv,
        })
    }
}

/// A reading that passed field and range checks.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidReading {
    pub seq: i32,
    pub recorded_at: DateTime<Utc>,
    pub ntu: f64,
    pub raw_mv: i64,
}

impl ValidReading {
    fn to_row(&self, session_id: i64) -> NewMeasurement {
        NewMeasurement {
            session_id,
            seq: self.seq,
            recorded_at: epoch_ms(&self.recorded_at),
            ntu: self.ntu,
            raw_mv: self.raw_mv,
        }
    }
}

pub fn validate_reading(reading: &Reading) -> Result<ValidReading, CoreError> {
    let seq = reading
        .seq
        .ok_or_else(|| CoreError::validation("missing seq"))?;
    if !(0..QUOTA as i64).contains(&seq) {
        return Err(CoreError::validation(format!("seq out of range: {seq}")));
    }

    let ntu = reading
        .ntu
        .ok_or_else(|| CoreError::validation("missing ntu"))?;
    if !ntu.is_finite() {
        return Err(CoreError::validation(format!("ntu is not a number: {ntu}")));
    }

    let raw_mv = reading
        .raw_mv
        .ok_or_else(|| CoreError::validation("missing raw_mv"))?;

    let epoch = reading
        .device_epoch_ms
        .ok_or_else(|| CoreError::validation("missing epoch_ms/device_epoch_ms"))?;
    let recorded_at = datetime_from_epoch_ms(epoch)
        .ok_or_else(|| CoreError::validation(format!("invalid epoch_ms: {epoch}")))?;

    Ok(ValidReading {
        seq: seq as i32,
        recorded_at,
        ntu,
        raw_mv,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub inserted: usize,
    pub session_closed: bool,
}

pub struct MeasurementIngestor<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> MeasurementIngestor<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Stores a full quota of readings and closes the session.
    ///
    /// Either all 60 rows land or none do.
    pub fn ingest_batch(
        &mut self,
        session_id: i64,
        device_id: &str,
        readings: &[Reading],
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, CoreError> {
        if readings.len() != QUOTA {
            return Err(CoreError::validation(format!(
                "expected {QUOTA} readings, got {}",
                readings.len()
            )));
        }
        let rows = readings
            .iter()
            .map(validate_reading)
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen = [false; QUOTA];
        for row in &rows {
            let slot = &mut seen[row.seq as usize];
            if *slot {
                return Err(CoreError::conflict(format!(
                    "duplicate seq {} in batch",
                    row.seq
                )));
            }
            *slot = true;
        }

        let outcome = self
            .conn
            .immediate_transaction::<_, CoreError, _>(|conn| {
                require_owned(conn, session_id, device_id)?;

                let seqs = rows.iter().map(|r| r.seq).collect::<Vec<_>>();
                let taken = measurements::table
                    .filter(measurements::session_id.eq(session_id))
                    .filter(measurements::seq.eq_any(seqs))
                    .select(measurements::seq)
                    .order(measurements::seq.asc())
                    .load::<i32>(conn)?;
                if let Some(seq) = taken.first() {
                    return Err(CoreError::conflict(format!(
                        "duplicate seq {seq} for session {session_id}"
                    )));
                }

                for row in &rows {
                    diesel::insert_into(measurements::table)
                        .values(&row.to_row(session_id))
                        .execute(conn)?;
                }
                SessionRegistry::new(conn).close_immediately(session_id, now)?;

                Ok(IngestOutcome {
                    inserted: rows.len(),
                    session_closed: true,
                })
            })
            .map_err(|err| {
                if let CoreError::Conflict(msg) = &err {
                    warn!("batch for session {session_id} rejected: {msg}");
                }
                err
            })?;

        debug!("session {session_id}: stored {} readings", outcome.inserted);
        Ok(outcome)
    }

    /// Stores one reading; closes the session once it holds a full quota.
    pub fn ingest_single(
        &mut self,
        session_id: i64,
        device_id: &str,
        reading: &Reading,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, CoreError> {
        let row = validate_reading(reading)?;

        self.conn.immediate_transaction::<_, CoreError, _>(|conn| {
            require_owned(conn, session_id, device_id)?;

            let taken = measurements::table
                .filter(measurements::session_id.eq(session_id))
                .filter(measurements::seq.eq(row.seq))
                .count()
                .get_result::<i64>(conn)?;
            if taken > 0 {
                return Err(CoreError::conflict(format!(
                    "duplicate seq {} for session {session_id}",
                    row.seq
                )));
            }

            diesel::insert_into(measurements::table)
                .values(&row.to_row(session_id))
                .execute(conn)?;

            let count = count_for(conn, session_id)?;
            let session_closed = count >= QUOTA as i64;
            if session_closed {
                SessionRegistry::new(conn).close_immediately(session_id, now)?;
            }
            debug!("session {session_id}: seq {} stored ({count}/{QUOTA})", row.seq);

            Ok(IngestOutcome {
                inserted: 1,
                session_closed,
            })
        })
    }

    /// Stored readings of a session, ordered by seq.
    pub fn measurements(&mut self, session_id: i64) -> Result<Vec<Measurement>, CoreError> {
        measurements::table
            .filter(measurements::session_id.eq(session_id))
            .order(measurements::seq.asc())
            .select(MeasurementRow::as_select())
            .load::<MeasurementRow>(self.conn)?
            .into_iter()
            .map(Measurement::try_from)
            .collect()
    }

    #[cfg(test)]
    pub fn count(&mut self, session_id: i64) -> Result<i64, CoreError> {
        count_for(self.conn, session_id)
    }
}

fn count_for(conn: &mut SqliteConnection, session_id: i64) -> Result<i64, CoreError> {
    let count = measurements::table
        .filter(measurements::session_id.eq(session_id))
        .count()
        .get_result(conn)?;
    Ok(count)
}

/// Unknown sessions and sessions of other devices look the same to the caller.
fn require_owned(
    conn: &mut SqliteConnection,
    session_id: i64,
    device_id: &str,
) -> Result<(), CoreError> {
    let owner = sessions::table
        .find(session_id)
        .select(sessions::device_id)
        .first::<String>(conn)
        .optional()?;

    match owner {
        Some(owner) if owner == device_id => Ok(()),
        _ => Err(CoreError::not_found(format!("invalid session {session_id}"))),
    }
}
