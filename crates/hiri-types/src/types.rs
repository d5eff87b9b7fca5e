//! Core types for HIRI sensor data.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};
use crate::timestamp::{Day, Timestamp};

/// One sensor sample as stored in the day cache.
///
/// Every telemetry value is optional: upstream rows routinely omit GPS fixes
/// or particulate channels. A reading is immutable once stored.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    /// Identifier of the physical unit.
    pub device_code: String,
    /// Device wall-clock time of the sample.
    pub time: Timestamp,
    /// Upstream transmission counter.
    #[cfg_attr(feature = "serde", serde(default))]
    pub envio_n: Option<u64>,
    /// Latitude in degrees.
    #[cfg_attr(feature = "serde", serde(default))]
    pub lat: Option<f64>,
    /// Longitude in degrees.
    #[cfg_attr(feature = "serde", serde(default))]
    pub lon: Option<f64>,
    /// PM2.5 concentration in µg/m³.
    #[cfg_attr(feature = "serde", serde(default))]
    pub pm25: Option<f64>,
    /// PM1.0 concentration in µg/m³.
    #[cfg_attr(feature = "serde", serde(default))]
    pub pm1: Option<f64>,
    /// PM10 concentration in µg/m³.
    #[cfg_attr(feature = "serde", serde(default))]
    pub pm10: Option<f64>,
    /// Temperature in °C.
    #[cfg_attr(feature = "serde", serde(default, alias = "temp_pms"))]
    pub temp: Option<f64>,
    /// Relative humidity in %.
    #[cfg_attr(feature = "serde", serde(default))]
    pub hum: Option<f64>,
    /// Battery voltage in V.
    #[cfg_attr(feature = "serde", serde(default))]
    pub vbat: Option<f64>,
    /// Cellular signal quality.
    #[cfg_attr(feature = "serde", serde(default))]
    pub csq: Option<f64>,
    /// Satellites in view.
    #[cfg_attr(feature = "serde", serde(default))]
    pub sats: Option<f64>,
    /// Ground speed in km/h.
    #[cfg_attr(feature = "serde", serde(default))]
    pub speed_kmh: Option<f64>,
}

impl Reading {
    /// Create a reading with only the identifying fields set.
    #[must_use]
    pub fn new(device_code: impl Into<String>, time: Timestamp, envio_n: Option<u64>) -> Self {
        Self {
            device_code: device_code.into(),
            time,
            envio_n,
            lat: None,
            lon: None,
            pm25: None,
            pm1: None,
            pm10: None,
            temp: None,
            hum: None,
            vbat: None,
            csq: None,
            sats: None,
            speed_kmh: None,
        }
    }

    /// The key used to reject retransmitted samples.
    #[must_use]
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            envio_n: self.envio_n,
            time: self.time,
        }
    }

    /// The device-local day this reading is bucketed into.
    #[must_use]
    pub fn day(&self) -> Day {
        self.time.day()
    }

    /// Whether the reading can be placed on a map (position and PM2.5 known).
    #[must_use]
    pub fn is_plottable(&self) -> bool {
        self.lat.is_some() && self.lon.is_some() && self.pm25.is_some()
    }

    /// Drop coordinates that are outside the valid degree ranges.
    #[must_use]
    pub fn with_valid_position(mut self) -> Self {
        if !self.lat.is_some_and(|lat| (-90.0..=90.0).contains(&lat))
            || !self.lon.is_some_and(|lon| (-180.0..=180.0).contains(&lon))
        {
            self.lat = None;
            self.lon = None;
        }
        self
    }
}

/// Deduplication key of a reading: `(envio_n, time)`, or `time` alone when the
/// counter is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub envio_n: Option<u64>,
    pub time: Timestamp,
}

/// Maximum length of a partition key component.
pub const MAX_KEY_COMPONENT_LEN: usize = 64;

/// The `(project_id, device_code, tabla)` triple scoping storage and collection.
///
/// Components are restricted to a filesystem-safe alphabet because they are
/// used directly as cache directory names.
///
/// # Examples
///
/// ```
/// use hiri_types::PartitionKey;
///
/// let key = PartitionKey::new("18", "HIRIPRO-01", "datos").unwrap();
/// assert_eq!(key.to_string(), "18/HIRIPRO-01/datos");
///
/// assert!(PartitionKey::new("18", "../etc", "datos").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PartitionKey {
    pub project_id: String,
    pub device_code: String,
    pub tabla: String,
}

impl PartitionKey {
    /// Create a validated partition key.
    pub fn new(
        project_id: impl Into<String>,
        device_code: impl Into<String>,
        tabla: impl Into<String>,
    ) -> ParseResult<Self> {
        let key = Self {
            project_id: project_id.into(),
            device_code: device_code.into(),
            tabla: tabla.into(),
        };
        key.validate()?;
        Ok(key)
    }

    /// Check every component against the allowed alphabet.
    pub fn validate(&self) -> ParseResult<()> {
        validate_component("project_id", &self.project_id)?;
        validate_component("device_code", &self.device_code)?;
        validate_component("tabla", &self.tabla)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project_id, self.device_code, self.tabla)
    }
}

/// Validate a single partition key component.
pub fn validate_component(field: &'static str, value: &str) -> ParseResult<()> {
    let invalid = |reason: String| ParseError::InvalidPartitionKey { field, reason };

    if value.is_empty() {
        return Err(invalid("cannot be empty".to_string()));
    }
    if value.len() > MAX_KEY_COMPONENT_LEN {
        return Err(invalid(format!(
            "too long ({} > {} characters)",
            value.len(),
            MAX_KEY_COMPONENT_LEN
        )));
    }
    if value.starts_with('.') {
        return Err(invalid(format!("{value:?} cannot start with '.'")));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(invalid(format!("{value:?} contains invalid character {c:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> Timestamp {
        s.parse().unwrap()
    }

    #[test]
    fn test_dedup_key_uses_counter_and_time() {
        let a = Reading::new("HIRIPRO-01", ts("2025-09-01T10:00:00"), Some(7));
        let mut b = a.clone();
        b.pm25 = Some(12.0);
        assert_eq!(a.dedup_key(), b.dedup_key());

        let c = Reading::new("HIRIPRO-01", ts("2025-09-01T10:00:00"), Some(8));
        assert_ne!(a.dedup_key(), c.dedup_key());

        let d = Reading::new("HIRIPRO-01", ts("2025-09-01T10:00:00"), None);
        assert_ne!(a.dedup_key(), d.dedup_key());
    }

    #[test]
    fn test_plottable_requires_position_and_pm25() {
        let mut r = Reading::new("X", ts("2025-09-01T10:00:00"), None);
        assert!(!r.is_plottable());
        r.lat = Some(-33.45);
        r.lon = Some(-70.65);
        assert!(!r.is_plottable());
        r.pm25 = Some(18.2);
        assert!(r.is_plottable());
    }

    #[test]
    fn test_invalid_position_is_dropped() {
        let mut r = Reading::new("X", ts("2025-09-01T10:00:00"), None);
        r.lat = Some(123.0);
        r.lon = Some(-70.0);
        let r = r.with_valid_position();
        assert_eq!(r.lat, None);
        assert_eq!(r.lon, None);

        let mut r = Reading::new("X", ts("2025-09-01T10:00:00"), None);
        r.lat = Some(-33.0);
        r.lon = Some(-70.0);
        let r = r.with_valid_position();
        assert_eq!(r.lat, Some(-33.0));
    }

    #[test]
    fn test_partition_key_validation() {
        assert!(PartitionKey::new("18", "HIRIPRO-01", "datos").is_ok());
        assert!(PartitionKey::new("18", "dev_1.a", "datos").is_ok());

        let err = PartitionKey::new("", "HIRIPRO-01", "datos").unwrap_err();
        assert!(err.to_string().contains("project_id"));

        assert!(PartitionKey::new("18", "a/b", "datos").is_err());
        assert!(PartitionKey::new("18", "..", "datos").is_err());
        assert!(PartitionKey::new("18", "dev ice", "datos").is_err());
        assert!(PartitionKey::new("18", "x".repeat(65), "datos").is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_reading_json_accepts_legacy_temp_field() {
        let json = r#"{"device_code":"HIRIPRO-01","time":"2025-09-01T10:00:00",
            "envio_n":3,"lat":-33.4,"lon":-70.6,"pm25":11.5,"temp_pms":21.0}"#;
        let r: Reading = serde_json::from_str(json).unwrap();
        assert_eq!(r.temp, Some(21.0));
        assert_eq!(r.envio_n, Some(3));
        assert_eq!(r.hum, None);
        assert!(r.is_plottable());
    }
}
