//! Core data model: `Reading`, `SensorConfig`, `ControllerState` and the
//! acquisition `Mode`. See spec.md §3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Continuous vs request/response acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Freerun,
    Polled,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Freerun => "freerun",
            Mode::Polled => "polled",
        }
    }
}

/// One measurement. Immutable once constructed.
///
/// Ordering invariant: within a session, timestamps are non-decreasing in
/// the order the controller appends to the ring buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub sensor_id: String,
    pub mode: Mode,
    pub value: f64,
    pub temp_c: Option<f64>,
    pub vin: Option<f64>,
}

impl Reading {
    pub fn new(
        timestamp: DateTime<Utc>,
        sensor_id: impl Into<String>,
        mode: Mode,
        value: f64,
        temp_c: Option<f64>,
        vin: Option<f64>,
    ) -> Self {
        Self {
            timestamp,
            sensor_id: sensor_id.into(),
            mode,
            value,
            temp_c,
            vin,
        }
    }

    /// Render as one CSV row (no trailing newline), per spec.md §6.
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.timestamp.to_rfc3339(),
            self.sensor_id,
            self.mode.as_str(),
            fmt_finite(self.value),
            self.temp_c.map(fmt_finite).unwrap_or_default(),
            self.vin.map(fmt_finite).unwrap_or_default(),
        )
    }
}

fn fmt_finite(v: f64) -> String {
    format!("{v}")
}

/// The instrument's observed configuration snapshot. Mutated only by the
/// controller, only while in CONFIG_MENU, and only as the result of a
/// completed menu exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub averaging: u32,
    pub adc_rate_hz: u32,
    pub mode: Mode,
    pub tag: Option<char>,
    pub include_temp: bool,
    pub include_vin: bool,
    pub sensor_id: String,
    pub firmware_version: String,
    pub preamble: String,
    pub calfactor: f64,
}

impl SensorConfig {
    pub const ALLOWED_RATES: [u32; 8] = [4, 8, 16, 33, 62, 125, 250, 500];

    /// `averaging / adc_rate_hz`
    pub fn sample_period_s(&self) -> f64 {
        self.averaging as f64 / self.adc_rate_hz as f64
    }
}

/// The controller's tagged state. Transitions are the only legal way state
/// changes; see spec.md §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    Disconnected,
    ConfigMenu,
    AcqFreerun,
    AcqPolled,
    Paused,
    Error,
}

impl ControllerState {
    pub fn is_acquiring(&self) -> bool {
        matches!(self, ControllerState::AcqFreerun | ControllerState::AcqPolled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_csv_row_omits_optional_fields() {
        let r = Reading::new(Utc::now(), "Q1", Mode::Freerun, 1.25, None, None);
        let row = r.to_csv_row();
        assert!(row.ends_with(",,"));
        assert!(row.contains("Q1"));
        assert!(row.contains("freerun"));
    }

    #[test]
    fn reading_csv_row_includes_optional_fields() {
        let r = Reading::new(Utc::now(), "Q1", Mode::Polled, 1.25, Some(22.5), Some(5.0));
        let row = r.to_csv_row();
        assert!(row.contains("22.5"));
        assert!(row.contains('5'));
    }

    #[test]
    fn sample_period() {
        let cfg = SensorConfig {
            averaging: 125,
            adc_rate_hz: 125,
            mode: Mode::Freerun,
            tag: None,
            include_temp: true,
            include_vin: true,
            sensor_id: "Q1".into(),
            firmware_version: "2150 REV 4.003".into(),
            preamble: String::new(),
            calfactor: 1.0,
        };
        assert_eq!(cfg.sample_period_s(), 1.0);
    }
}
