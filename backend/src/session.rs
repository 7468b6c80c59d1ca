//! Capture windows.
//!
//! A session is active while `active_until` lies in the future. Nothing
//! expires sessions in the background; a lapsed window simply stops showing
//! up in [`SessionRegistry::get_active`].

use chrono::{DateTime, Utc};
use common::req::SessionInfo;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::info;

use crate::db::models::{NewSession, SessionRow};
use crate::error::CoreError;
use crate::schema::sessions;
use crate::utils::{datetime_from_epoch_ms, epoch_ms, iso_z};

pub const MIN_DURATION_SEC: i64 = 60;
pub const MAX_DURATION_SEC: i64 = 600;
pub const DEFAULT_DURATION_SEC: i64 = 300;

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: i64,
    pub device_id: String,
    pub started_at: DateTime<Utc>,
    pub active_until: DateTime<Utc>,
}

impl Session {
    #[cfg(test)]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.active_until > now
    }

    pub fn to_info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            device_id: self.device_id.clone(),
            started_at: iso_z(&self.started_at),
            active_until: iso_z(&self.active_until),
        }
    }
}

impl TryFrom<SessionRow> for Session {
    type Error = CoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let corrupt = || CoreError::persistence(format!("bad timestamp in session {}", row.session_id));
        Ok(Self {
            id: row.session_id,
            started_at: datetime_from_epoch_ms(row.started_at).ok_or_else(corrupt)?,
            active_until: datetime_from_epoch_ms(row.active_until).ok_or_else(corrupt)?,
            device_id: row.device_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionPage {
    pub items: Vec<Session>,
    pub total: i64,
    pub limit: i64,
}

pub struct SessionRegistry<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> SessionRegistry<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Opens a capture window of `duration_sec` seconds starting at `now`.
    ///
    /// The activity check and the insert share one `BEGIN IMMEDIATE`
    /// transaction. SQLite hands out the write lock to one connection at a
    /// time, so of two racing calls for the same device exactly one inserts
    /// and the other observes that session and fails with a conflict.
    pub fn create(
        &mut self,
        device_id: &str,
        duration_sec: i64,
        now: DateTime<Utc>,
    ) -> Result<Session, CoreError> {
        if !(MIN_DURATION_SEC..=MAX_DURATION_SEC).contains(&duration_sec) {
            return Err(CoreError::validation(format!(
                "duration_sec must be within {MIN_DURATION_SEC}..={MAX_DURATION_SEC}, got {duration_sec}"
            )));
        }

        let started_at = epoch_ms(&now);
        let active_until = started_at + duration_sec * 1000;

        let row = self
            .conn
            .immediate_transaction::<_, CoreError, _>(|conn| {
                if let Some(active) = active_row(conn, device_id, started_at)? {
                    return Err(CoreError::conflict(format!(
                        "device {device_id} already has active session {}",
                        active.session_id
                    )));
                }

                diesel::insert_into(sessions::table)
                    .values(&NewSession {
                        device_id,
                        started_at,
                        active_until,
                    })
                    .execute(conn)?;

                // Still holding the write lock, so the newest row is ours.
                let row = sessions::table
                    .filter(sessions::device_id.eq(device_id))
                    .order(sessions::session_id.desc())
                    .select(SessionRow::as_select())
                    .first(conn)?;
                Ok(row)
            })?;

        info!(
            "session {} opened for device {device_id} ({duration_sec}s)",
            row.session_id
        );
        row.try_into()
    }

    /// Most recent session of `device_id` whose window is still open at `now`.
    pub fn get_active(
        &mut self,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, CoreError> {
        active_row(self.conn, device_id, epoch_ms(&now))?
            .map(Session::try_from)
            .transpose()
    }

    /// Ends the window at `now` unless it already ended earlier; a window is
    /// never extended. Returns whether the session exists.
    pub fn close_immediately(
        &mut self,
        session_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let now_ms = epoch_ms(&now);
        let exists = diesel::select(diesel::dsl::exists(sessions::table.find(session_id)))
            .get_result::<bool>(self.conn)?;
        if !exists {
            return Ok(false);
        }

        let shortened = diesel::update(
            sessions::table
                .find(session_id)
                .filter(sessions::active_until.gt(now_ms)),
        )
        .set(sessions::active_until.eq(now_ms))
        .execute(self.conn)?;

        if shortened > 0 {
            info!("session {session_id} closed at {}", iso_z(&now));
        }
        Ok(true)
    }

    pub fn get_by_id(&mut self, session_id: i64) -> Result<Option<Session>, CoreError> {
        sessions::table
            .find(session_id)
            .select(SessionRow::as_select())
            .first(self.conn)
            .optional()?
            .map(Session::try_from)
            .transpose()
    }

    /// Newest first. `limit` is clamped to `1..=100`, `offset` to `>= 0`.
    pub fn list(
        &mut self,
        device_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<SessionPage, CoreError> {
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let offset = offset.max(0);

        let total: i64 = match device_filter {
            Some(device_id) => sessions::table
                .filter(sessions::device_id.eq(device_id))
                .count()
                .get_result(self.conn)?,
            None => sessions::table.count().get_result(self.conn)?,
        };

        let mut query = sessions::table
            .select(SessionRow::as_select())
            .order(sessions::session_id.desc())
            .limit(limit)
            .offset(offset)
            .into_boxed();
        if let Some(device_id) = device_filter {
            query = query.filter(sessions::device_id.eq(device_id));
        }

        let items = query
            .load::<SessionRow>(self.conn)?
            .into_iter()
            .map(Session::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SessionPage {
            items,
            total,
            limit,
        })
    }

    /// Most recent session whose window has ended by `now`.
    pub fn last_finished(
        &mut self,
        device_filter: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, CoreError> {
        let mut query = sessions::table
            .select(SessionRow::as_select())
            .filter(sessions::active_until.le(epoch_ms(&now)))
            .order(sessions::session_id.desc())
            .into_boxed();
        if let Some(device_id) = device_filter {
            query = query.filter(sessions::device_id.eq(device_id));
        }

        query
            .first::<SessionRow>(self.conn)
            .optional()?
            .map(Session::try_from)
            .transpose()
    }
}

fn active_row(
    conn: &mut SqliteConnection,
    device_id: &str,
    now_ms: i64,
) -> Result<Option<SessionRow>, CoreError> {
    let row = sessions::table
        .filter(sessions::device_id.eq(device_id))
        .filter(sessions::active_until.gt(now_ms))
        .order(sessions::session_id.desc())
        .select(SessionRow::as_select())
        .first(conn)
        .optional()?;
    Ok(row)
}
