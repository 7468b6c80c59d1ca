//! Operations exposed to the HTTP layer.
//!
//! Each call reads the clock once and hands that instant to every component
//! it touches.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use common::req::{self, CommandResponse, Reading};
use diesel::prelude::*;

use crate::clock::Clock;
use crate::db::Db;
use crate::error::CoreError;
use crate::ingest::{IngestOutcome, Measurement, MeasurementIngestor};
use crate::session::{Session, SessionPage, SessionRegistry};
use crate::stats::{Stats, StatisticsEngine};
use crate::utils::iso_z;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Idle,
    Start {
        session_id: i64,
        expires_at: DateTime<Utc>,
    },
}

impl Command {
    pub fn to_response(&self) -> CommandResponse {
        match self {
            Self::Idle => CommandResponse::Idle,
            Self::Start {
                session_id,
                expires_at,
            } => CommandResponse::Start {
                session_id: *session_id,
                expires_at: iso_z(expires_at),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub session: Session,
    pub measurements: Vec<Measurement>,
    pub stats: Stats,
}

impl SessionReport {
    pub fn to_response(&self) -> req::SessionDetail {
        req::SessionDetail {
            session: self.session.to_info(),
            measurements: self.measurements.iter().map(Measurement::to_info).collect(),
            stats: self.stats.to_info(),
        }
    }
}

pub struct Service {
    db: Arc<Mutex<Db>>,
    clock: Arc<dyn Clock>,
}

impl Service {
    pub fn new(db: Arc<Mutex<Db>>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    fn with_db<T>(&self, f: impl FnOnce(&mut Db) -> Result<T, CoreError>) -> Result<T, CoreError> {
        let mut db = self
            .db
            .lock()
            .map_err(|_| CoreError::persistence("database lock poisoned"))?;
        f(&mut db)
    }

    pub fn create_session(&self, device_id: &str, duration_sec: i64) -> Result<Session, CoreError> {
        let now = self.clock.now();
        self.with_db(|db| db.sessions().create(device_id, duration_sec, now))
    }

    pub fn command(&self, device_id: &str) -> Result<Command, CoreError> {
        let now = self.clock.now();
        let active = self.with_db(|db| db.sessions().get_active(device_id, now))?;
        Ok(match active {
            Some(session) => Command::Start {
                session_id: session.id,
                expires_at: session.active_until,
            },
            None => Command::Idle,
        })
    }

    pub fn ingest_batch(
        &self,
        session_id: i64,
        device_id: &str,
        readings: &[Reading],
    ) -> Result<IngestOutcome, CoreError> {
        let now = self.clock.now();
        self.with_db(|db| db.ingestor().ingest_batch(session_id, device_id, readings, now))
    }

    pub fn ingest_single(
        &self,
        session_id: i64,
        device_id: &str,
        reading: &Reading,
    ) -> Result<IngestOutcome, CoreError> {
        let now = self.clock.now();
        self.with_db(|db| db.ingestor().ingest_single(session_id, device_id, reading, now))
    }

    pub fn session_detail(&self, session_id: i64) -> Result<SessionReport, CoreError> {
        self.with_db(|db| {
            db.conn().transaction::<_, CoreError, _>(|conn| {
                let session = SessionRegistry::new(conn)
                    .get_by_id(session_id)?
                    .ok_or_else(|| CoreError::not_found(format!("session {session_id}")))?;
                report(conn, session)
            })
        })
    }

    pub fn list_sessions(
        &self,
        device_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<SessionPage, CoreError> {
        self.with_db(|db| db.sessions().list(device_filter, limit, offset))
    }

    /// Report for the most recent session whose window has closed.
    pub fn last_finished(&self, device_filter: Option<&str>) -> Result<Option<SessionReport>, CoreError> {
        let now = self.clock.now();
        self.with_db(|db| {
            db.conn().transaction::<_, CoreError, _>(|conn| {
                match SessionRegistry::new(conn).last_finished(device_filter, now)? {
                    Some(session) => report(conn, session).map(Some),
                    None => Ok(None),
                }
            })
        })
    }
}

fn report(conn: &mut SqliteConnection, session: Session) -> Result<SessionReport, CoreError> {
    let measurements = MeasurementIngestor::new(conn).measurements(session.id)?;
    let stats = StatisticsEngine::new(conn).compute(session.id)?;
    Ok(SessionReport {
        session,
        measurements,
        stats,
    })
}
