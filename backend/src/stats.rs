use common::req::StatsInfo;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use crate::error::CoreError;
use crate::schema::measurements;
use crate::utils::round3;

/// Descriptive statistics over the NTU values of one session.
///
/// Every float is rounded to three decimals. With no readings only `count`
/// is set; `stddev` additionally needs at least two readings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    pub count: i64,
    pub mean: Option<f64>,
    pub stddev: Option<f64>,
    pub median: Option<f64>,
    pub mode: Option<f64>,
    pub range: Option<f64>,
}

impl Stats {
    pub fn from_values(mut values: Vec<f64>) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        values.sort_by(f64::total_cmp);

        let n = values.len();
        let mean = values.iter().sum::<f64>() / n as f64;

        // sample standard deviation
        let stddev = (n > 1).then(|| {
            let squares = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>();
            (squares / (n - 1) as f64).sqrt()
        });

        let median = if n % 2 == 1 {
            values[n / 2]
        } else {
            (values[n / 2 - 1] + values[n / 2]) / 2.0
        };

        Self {
            count: n as i64,
            mean: Some(round3(mean)),
            stddev: stddev.map(round3),
            median: Some(round3(median)),
            mode: Some(round3(mode_of_sorted(&values))),
            range: Some(round3(values[n - 1] - values[0])),
        }
    }

    pub fn to_info(&self) -> StatsInfo {
        StatsInfo {
            count: self.count,
            mean: self.mean,
            stddev: self.stddev,
            median: self.median,
            mode: self.mode,
            range: self.range,
        }
    }
}

/// Most frequent value by exact equality; ties go to the smallest value.
fn mode_of_sorted(sorted: &[f64]) -> f64 {
    let mut best = sorted[0];
    let mut best_count = 0;

    let mut i = 0;
    while i < sorted.len() {
        let value = sorted[i];
        let mut j = i + 1;
        while j < sorted.len() && sorted[j] == value {
            j += 1;
        }
        // strictly greater keeps the earlier, smaller value on ties
        if j - i > best_count {
            best = value;
            best_count = j - i;
        }
        i = j;
    }
    best
}

pub struct StatisticsEngine<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> StatisticsEngine<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Recomputed from the stored rows on every call.
    pub fn compute(&mut self, session_id: i64) -> Result<Stats, CoreError> {
        let values = measurements::table
            .filter(measurements::session_id.eq(session_id))
            .select(measurements::ntu)
            .order(measurements::ntu.asc())
            .load::<f64>(self.conn)?;
        Ok(Stats::from_values(values))
    }
}
