//! Upstream row normalization.
//!
//! The sensor API labels its columns with long, localized headers such as
//! `PMS5003 [Material particulado PM 2.5 (µg/m³)]` or
//! `SIM7600G [Latitud (°)]`. Column sets differ between projects and firmware
//! revisions, so the mapping onto [`Reading`] fields is detected from the
//! headers of each page instead of being hard-coded.
//!
//! Headers are normalized before matching: lowercase, accents folded,
//! parenthesized units removed, brackets and punctuation turned into
//! separators. A field matches a column when every phrase of one of its
//! rules appears in the column's token sequence.

use serde_json::{Map, Value};
use thiserror::Error;

use hiri_types::{Reading, Timestamp};

/// A row that could not be turned into a [`Reading`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRow {
    /// No column looks like a timestamp.
    #[error("no time column detected")]
    NoTimeColumn,
    /// The time cell is missing or unparseable.
    #[error("invalid time value {0:?}")]
    InvalidTime(String),
}

/// One matching rule: every phrase must occur in the column.
type Rule = &'static [&'static str];

const TIME: &[Rule] = &[&["fecha"], &["time"], &["timestamp"]];
const DEVICE: &[Rule] = &[&["codigo interno"], &["device code"]];
const ENVIO: &[Rule] = &[&["numero", "envios"], &["numero", "envio"], &["envios"], &["envio"]];
const PM25: &[Rule] = &[&["pm 2.5"], &["pm2.5"], &["pm25"]];
const PM1: &[Rule] = &[&["pm 1.0"], &["pm 1"], &["pm1.0"], &["pm1"]];
const PM10: &[Rule] = &[&["pm 10"], &["pm10"]];
const HUM: &[Rule] = &[&["humedad"], &["hum"], &["humidity"]];
const TEMP: &[Rule] = &[&["grados", "celcius"], &["temperatura"], &["temp"]];
const VBAT: &[Rule] = &[&["voltaje"], &["vbat"], &["bateria"]];
const SIM_LAT: &[Rule] = &[&["sim7600g", "latitud"], &["sim7600", "latitud"]];
const SIM_LON: &[Rule] = &[&["sim7600g", "longitud"], &["sim7600", "longitud"]];
const CSQ: &[Rule] = &[&["intensidad", "senal"], &["csq"]];
const SATS: &[Rule] = &[&["satelites"], &["sats"]];
const SPEED: &[Rule] = &[&["velocidad"], &["speed"]];
const META_LAT: &[Rule] = &[
    &["metadatos", "latitud"],
    &["estacion", "latitud"],
    &["latitud"],
    &["lat"],
];
const META_LON: &[Rule] = &[
    &["metadatos", "longitud"],
    &["estacion", "longitud"],
    &["longitud"],
    &["lon"],
];

/// Column names detected for each [`Reading`] field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamSchema {
    pub time: Option<String>,
    pub device_code: Option<String>,
    pub envio: Option<String>,
    pub pm25: Option<String>,
    pub pm1: Option<String>,
    pub pm10: Option<String>,
    pub hum: Option<String>,
    pub temp: Option<String>,
    pub vbat: Option<String>,
    pub sim_lat: Option<String>,
    pub sim_lon: Option<String>,
    pub meta_lat: Option<String>,
    pub meta_lon: Option<String>,
    pub csq: Option<String>,
    pub sats: Option<String>,
    pub speed: Option<String>,
}

impl UpstreamSchema {
    /// Detect the column mapping from a set of column names.
    ///
    /// Each column is claimed by at most one field; fields are resolved in a
    /// fixed order so that the more specific rules win (PM2.5 before PM1,
    /// SIM coordinates before station coordinates).
    pub fn detect<'a>(columns: impl IntoIterator<Item = &'a str>) -> Self {
        let columns: Vec<(&str, Vec<String>)> = columns
            .into_iter()
            .map(|c| (c, tokenize(c)))
            .collect();
        let mut claimed: Vec<bool> = vec![false; columns.len()];

        let mut find = |rules: &[Rule]| -> Option<String> {
            for rule in rules {
                let hit = columns.iter().enumerate().find(|(i, (_, tokens))| {
                    !claimed[*i] && rule.iter().all(|phrase| contains_phrase(tokens, phrase))
                });
                if let Some((i, (name, _))) = hit {
                    claimed[i] = true;
                    return Some((*name).to_string());
                }
            }
            None
        };

        let time = find(TIME);
        let device_code = find(DEVICE);
        let envio = find(ENVIO);
        let pm25 = find(PM25);
        let pm10 = find(PM10);
        let pm1 = find(PM1);
        let sim_lat = find(SIM_LAT);
        let sim_lon = find(SIM_LON);
        let meta_lat = find(META_LAT);
        let meta_lon = find(META_LON);
        let csq = find(CSQ);
        let sats = find(SATS);
        let speed = find(SPEED);
        let hum = find(HUM);
        let temp = find(TEMP);
        let vbat = find(VBAT);

        Self {
            time,
            device_code,
            envio,
            pm25,
            pm1,
            pm10,
            hum,
            temp,
            vbat,
            sim_lat,
            sim_lon,
            meta_lat,
            meta_lon,
            csq,
            sats,
            speed,
        }
    }

    /// Detect the mapping from the keys of the first row of a page.
    pub fn from_rows(rows: &[Map<String, Value>]) -> Self {
        match rows.first() {
            Some(row) => Self::detect(row.keys().map(String::as_str)),
            None => Self::default(),
        }
    }

    /// Convert one upstream row into a [`Reading`].
    ///
    /// `fallback_device` is used when the row has no device column.
    pub fn to_reading(
        &self,
        row: &Map<String, Value>,
        fallback_device: &str,
    ) -> Result<Reading, MalformedRow> {
        let time_col = self.time.as_deref().ok_or(MalformedRow::NoTimeColumn)?;
        let time = match row.get(time_col) {
            Some(Value::String(s)) => s
                .parse::<Timestamp>()
                .map_err(|_| MalformedRow::InvalidTime(s.clone()))?,
            Some(other) => return Err(MalformedRow::InvalidTime(other.to_string())),
            None => return Err(MalformedRow::InvalidTime(String::new())),
        };

        let device_code = self
            .device_code
            .as_deref()
            .and_then(|c| row.get(c))
            .and_then(|v| match v {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| fallback_device.to_string());

        let value = |col: &Option<String>| col.as_deref().and_then(|c| row.get(c)).and_then(to_float);

        let envio_n = value(&self.envio)
            .filter(|n| *n >= 0.0 && *n <= u64::MAX as f64)
            .map(|n| n.round() as u64);

        let (lat, lon) = match (value(&self.sim_lat), value(&self.sim_lon)) {
            (Some(lat), Some(lon)) => (Some(lat), Some(lon)),
            _ => (value(&self.meta_lat), value(&self.meta_lon)),
        };

        let mut reading = Reading::new(device_code, time, envio_n);
        reading.lat = lat;
        reading.lon = lon;
        reading.pm25 = value(&self.pm25);
        reading.pm1 = value(&self.pm1);
        reading.pm10 = value(&self.pm10);
        reading.temp = value(&self.temp);
        reading.hum = value(&self.hum);
        reading.vbat = value(&self.vbat);
        reading.csq = value(&self.csq);
        reading.sats = value(&self.sats);
        reading.speed_kmh = value(&self.speed);
        Ok(reading.with_valid_position())
    }
}

/// Unit suffixes stripped from numeric strings.
const UNIT_SUFFIXES: &[&str] = &["µg/m³", "ug/m3", "km/h", "°C", "°", "V", "%"];

/// Parse a loosely formatted numeric cell.
///
/// Accepts JSON numbers and strings using `,` or `.` as the decimal separator,
/// optionally followed by a unit. Empty strings, `nan`, `null` and `none` are
/// absent, as is anything non-finite.
pub fn to_float(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let mut s = s.trim().replace(',', ".");
            if s.is_empty() || matches!(s.to_lowercase().as_str(), "nan" | "null" | "none") {
                return None;
            }
            while let Some(unit) = UNIT_SUFFIXES.iter().find(|u| s.ends_with(*u)) {
                s.truncate(s.len() - unit.len());
                s = s.trim_end().to_string();
            }
            s.parse::<f64>().ok()
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Normalize a header into lowercase ASCII tokens.
///
/// Parenthesized groups (units) are dropped. A `.` survives only between two
/// digits so that `PM 2.5` and `PM 1.0` stay distinguishable from `PM 10`.
pub fn tokenize(header: &str) -> Vec<String> {
    let mut cleaned = String::with_capacity(header.len());
    let mut depth = 0usize;
    for c in header.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth > 0 => {}
            _ => cleaned.push(fold(c)),
        }
    }

    let chars: Vec<char> = cleaned.chars().collect();
    let mut out = String::with_capacity(chars.len());
    for (i, &c) in chars.iter().enumerate() {
        let keep = c.is_ascii_alphanumeric()
            || (c == '.'
                && i > 0
                && chars[i - 1].is_ascii_digit()
                && chars.get(i + 1).is_some_and(char::is_ascii_digit));
        out.push(if keep { c } else { ' ' });
    }
    out.split_whitespace().map(str::to_string).collect()
}

fn fold(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ä' | 'Á' | 'À' | 'Â' | 'Ä' => 'a',
        'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' | 'Í' | 'Ì' | 'Î' | 'Ï' => 'i',
        'ó' | 'ò' | 'ô' | 'ö' | 'Ó' | 'Ò' | 'Ô' | 'Ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' | 'Ú' | 'Ù' | 'Û' | 'Ü' | 'µ' => 'u',
        'ñ' | 'Ñ' => 'n',
        _ if c.is_ascii() => c.to_ascii_lowercase(),
        _ => ' ',
    }
}

/// Whether `phrase` (space separated) occurs as a contiguous token run.
fn contains_phrase(tokens: &[String], phrase: &str) -> bool {
    let needle: Vec<&str> = phrase.split(' ').collect();
    tokens
        .windows(needle.len())
        .any(|w| w.iter().zip(&needle).all(|(t, n)| t == n))
}
