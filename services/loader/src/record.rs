//! Telemetry rows and their validation rules.

use chrono::NaiveDateTime;
use csv::StringRecord;
use serde::Serialize;
use thiserror::Error;

/// Column names in file order
pub const COLUMNS: [&str; 19] = [
    "recorded_at",
    "serial_number",
    "gps_longitude",
    "gps_latitude",
    "working_hours",
    "engine_rpm",
    "engine_load",
    "fuel_consumption",
    "speed_gearbox",
    "speed_radar",
    "motor_temperature",
    "front_pto_rpm",
    "rear_pto_rpm",
    "gear_shift",
    "ambient_temperature",
    "parking_brake_status",
    "differential_lock_status",
    "all_wheel_status",
    "creeper_status",
];

/// Why a single row was rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("expected {expected} columns, found {found}")]
    ColumnCount { expected: usize, found: usize },

    #[error("required field '{column}' is empty")]
    MissingField { column: &'static str },

    #[error("field '{column}' has invalid value '{value}': {message}")]
    InvalidField {
        column: &'static str,
        value: String,
        message: String,
    },
}

/// One validated row of a tractor telematics file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    /// 1-based line number in the source file
    pub line: u64,
    pub recorded_at: NaiveDateTime,
    pub serial_number: String,
    pub gps_longitude: f64,
    pub gps_latitude: f64,
    /// "lat, lon" built from the cell text as written
    pub location: String,
    pub working_hours: f64,
    pub engine_rpm: f64,
    pub engine_load: f64,
    pub fuel_consumption: f64,
    pub speed_gearbox: f64,
    pub speed_radar: f64,
    pub motor_temperature: f64,
    pub front_pto_rpm: f64,
    pub rear_pto_rpm: f64,
    pub gear_shift: String,
    pub ambient_temperature: f64,
    pub parking_brake_status: String,
    pub differential_lock_status: String,
    pub all_wheel_status: String,
    pub creeper_status: String,
}

impl TelemetryRecord {
    /// Validate and convert one delimited row
    pub fn from_row(row: &StringRecord, line: u64, timestamp_format: &str) -> Result<Self, RecordError> {
        if row.len() != COLUMNS.len() {
            return Err(RecordError::ColumnCount {
                expected: COLUMNS.len(),
                found: row.len(),
            });
        }

        let fields = Fields { row };

        Ok(Self {
            line,
            recorded_at: fields.timestamp(0, timestamp_format)?,
            serial_number: fields.text(1)?,
            gps_longitude: fields.bounded(2, -180.0, 180.0)?,
            gps_latitude: fields.bounded(3, -90.0, 90.0)?,
            location: format!("{}, {}", fields.raw(3)?, fields.raw(2)?),
            working_hours: fields.number(4)?,
            engine_rpm: fields.number(5)?,
            engine_load: fields.number(6)?,
            fuel_consumption: fields.number(7)?,
            speed_gearbox: fields.number(8)?,
            speed_radar: fields.number(9)?,
            motor_temperature: fields.number(10)?,
            front_pto_rpm: fields.number(11)?,
            rear_pto_rpm: fields.number(12)?,
            gear_shift: fields.text(13)?,
            ambient_temperature: fields.number(14)?,
            parking_brake_status: fields.text(15)?,
            differential_lock_status: fields.text(16)?,
            all_wheel_status: fields.text(17)?,
            creeper_status: fields.text(18)?,
        })
    }

    /// Combined "lat, lon" position string stored alongside the row
    pub fn location(&self) -> &str {
        &self.location
    }
}

struct Fields<'a> {
    row: &'a StringRecord,
}

impl Fields<'_> {
    fn raw(&self, index: usize) -> Result<&str, RecordError> {
        let value = self.row.get(index).unwrap_or("").trim();
        if value.is_empty() {
            return Err(RecordError::MissingField {
                column: COLUMNS[index],
            });
        }
        Ok(value)
    }

    fn text(&self, index: usize) -> Result<String, RecordError> {
        self.raw(index).map(str::to_string)
    }

    fn number(&self, index: usize) -> Result<f64, RecordError> {
        let value = self.raw(index)?;
        match value.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(n),
            Ok(_) => Err(invalid(index, value, "not a finite number".to_string())),
            Err(e) => Err(invalid(index, value, e.to_string())),
        }
    }

    fn bounded(&self, index: usize, min: f64, max: f64) -> Result<f64, RecordError> {
        let n = self.number(index)?;
        if n < min || n > max {
            return Err(invalid(
                index,
                &n.to_string(),
                format!("outside [{}, {}]", min, max),
            ));
        }
        Ok(n)
    }

    fn timestamp(&self, index: usize, format: &str) -> Result<NaiveDateTime, RecordError> {
        let value = self.raw(index)?;
        NaiveDateTime::parse_from_str(value, format)
            .map_err(|e| invalid(index, value, format!("expected format '{}': {}", format, e)))
    }
}

fn invalid(index: usize, value: &str, message: String) -> RecordError {
    RecordError::InvalidField {
        column: COLUMNS[index],
        value: value.to_string(),
        message,
    }
}
