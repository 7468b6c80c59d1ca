use diesel::prelude::*;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = sessions)]
pub struct SessionRow {
    pub session_id: i64,
    pub device_id: String,
    pub started_at: i64,   // ms
    pub active_until: i64, // ms
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sessions)]
pub struct NewSession<'a> {
    pub device_id: &'a str,
    pub started_at: i64,
    pub active_until: i64,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = measurements)]
pub struct MeasurementRow {
    pub session_id: i64,
    pub seq: i32,
    pub recorded_at: i64, // ms
    pub ntu: f64,
    pub raw_mv: i64,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = measurements)]
pub struct NewMeasurement {
    pub session_id: i64,
    pub seq: i32,
    pub recorded_at: i64,
    pub ntu: f64,
    pub raw_mv: i64,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = devices)]
pub struct Device {
    pub device_id: String,
    pub api_token: String,
}
