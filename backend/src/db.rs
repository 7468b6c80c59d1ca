use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::debug;

use crate::error::CoreError;
use crate::ingest::MeasurementIngestor;
use crate::session::SessionRegistry;

pub mod models;

/// One SQLite connection with the schema applied.
pub struct Db {
    conn: SqliteConnection,
}

impl Db {
    pub fn connect(database_url: &str, busy_timeout_ms: u32) -> Result<Self, CoreError> {
        let mut conn = SqliteConnection::establish(database_url)?;

        conn.batch_execute(&format!("PRAGMA busy_timeout = {busy_timeout_ms};"))?;
        if database_url != ":memory:" {
            conn.batch_execute("PRAGMA journal_mode = WAL;")?;
        }
        conn.batch_execute("PRAGMA foreign_keys = ON;")?;
        conn.batch_execute(include_str!("schema.sql"))?;

        debug!("connected to {database_url}");
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, CoreError> {
        Self::connect(":memory:", 0)
    }

    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    pub fn sessions(&mut self) -> SessionRegistry<'_> {
        SessionRegistry::new(&mut self.conn)
    }

    pub fn ingestor(&mut self) -> MeasurementIngestor<'_> {
        MeasurementIngestor::new(&mut self.conn)
    }
}
