//! Device directory: maps API tokens to device ids.

use std::sync::{Arc, Mutex};

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::info;

use crate::db::models::Device;
use crate::db::Db;
use crate::error::CoreError;
use crate::schema::devices;

pub trait DeviceDirectory: Send + Sync {
    /// Device owning `token`, if any. Surrounding whitespace is ignored.
    fn verify(&self, token: &str) -> Result<Option<String>, CoreError>;

    fn exists(&self, device_id: &str) -> Result<bool, CoreError>;
}

/// Directory backed by the `devices` table.
pub struct SqlDeviceDirectory {
    db: Arc<Mutex<Db>>,
}

impl SqlDeviceDirectory {
    pub fn new(db: Arc<Mutex<Db>>) -> Self {
        Self { db }
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut SqliteConnection) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let mut db = self
            .db
            .lock()
            .map_err(|_| CoreError::persistence("database lock poisoned"))?;
        f(db.conn())
    }
}

impl DeviceDirectory for SqlDeviceDirectory {
    fn verify(&self, token: &str) -> Result<Option<String>, CoreError> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(None);
        }
        self.with_conn(|conn| {
            let device_id = devices::table
                .filter(devices::api_token.eq(token))
                .select(devices::device_id)
                .first::<String>(conn)
                .optional()?;
            Ok(device_id)
        })
    }

    fn exists(&self, device_id: &str) -> Result<bool, CoreError> {
        self.with_conn(|conn| {
            let count = devices::table
                .filter(devices::device_id.eq(device_id))
                .count()
                .get_result::<i64>(conn)?;
            Ok(count > 0)
        })
    }
}

/// Adds a device or replaces its token. A token held by another device is a
/// conflict.
pub fn register_device(
    conn: &mut SqliteConnection,
    device_id: &str,
    api_token: &str,
) -> Result<(), CoreError> {
    let api_token = api_token.trim();
    if device_id.is_empty() || api_token.is_empty() {
        return Err(CoreError::validation("device_id and api_token are required"));
    }

    diesel::insert_into(devices::table)
        .values(&Device {
            device_id: device_id.to_owned(),
            api_token: api_token.to_owned(),
        })
        .on_conflict(devices::device_id)
        .do_update()
        .set(devices::api_token.eq(api_token))
        .execute(conn)?;

    info!("device {device_id} registered");
    Ok(())
}
