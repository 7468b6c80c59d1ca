//! Request and response bodies exchanged with the backend.
//!
//! Timestamps travel as ISO-8601 UTC strings with exactly three fractional
//! digits and a trailing `Z`.

/// One sensor reading as uploaded by a device.
///
/// Every field is optional on the wire so that the backend can report a
/// missing field as a validation failure instead of a parse failure.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Reading {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    #[serde(alias = "epoch_ms", skip_serializing_if = "Option::is_none")]
    pub device_epoch_ms: Option<i64>, // ms since epoch, UTC
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ntu: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_mv: Option<i64>,
}

impl Reading {
    pub fn new(seq: i64, device_epoch_ms: i64, ntu: f64, raw_mv: i64) -> Self {
        Self {
            seq: Some(seq),
            device_epoch_ms: Some(device_epoch_ms),
            ntu: Some(ntu),
            raw_mv: Some(raw_mv),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct ActivateRequest {
    pub duration_sec: Option<i64>,
}

/// Body of `POST /session`: the full 60-reading quota at once.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct BatchUpload {
    pub session_id: Option<i64>,
    pub readings: Option<Vec<Reading>>,
}

/// Body of `POST /session/reading`.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct SingleUpload {
    pub session_id: Option<i64>,
    #[serde(flatten)]
    pub reading: Reading,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum CommandResponse {
    Start { session_id: i64, expires_at: String },
    Idle,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SessionInfo {
    pub session_id: i64,
    pub device_id: String,
    pub started_at: String,
    pub active_until: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct MeasurementInfo {
    pub seq: i32,
    pub device_recorded_at: String,
    pub ntu: f64,
    pub raw_mv: i64,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct StatsInfo {
    pub count: i64,
    #[serde(rename = "ntu_mean")]
    pub mean: Option<f64>,
    #[serde(rename = "ntu_stddev")]
    pub stddev: Option<f64>,
    #[serde(rename = "ntu_median")]
    pub median: Option<f64>,
    #[serde(rename = "ntu_mode")]
    pub mode: Option<f64>,
    #[serde(rename = "ntu_range")]
    pub range: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SessionDetail {
    pub session: SessionInfo,
    pub measurements: Vec<MeasurementInfo>,
    pub stats: StatsInfo,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SessionList {
    pub items: Vec<SessionInfo>,
    pub total: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct IngestResponse {
    pub ok: bool,
    pub inserted: usize,
    pub session_closed: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
