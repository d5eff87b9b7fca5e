//! CSV import and export.
//!
//! Exported files have one column per [`Reading`] field, in declaration order.
//! Imports accept the same columns in any order; unknown columns are ignored
//! and only `time` is required.

use std::io::{Read, Write};

use serde::Deserialize;
use tracing::{debug, info};

use hiri_types::{PartitionKey, Reading, Timestamp};

use crate::error::{Error, Result};
use crate::store::{DayStore, ImportResult};

/// Column headers of exported CSV files.
pub const CSV_COLUMNS: [&str; 14] = [
    "device_code",
    "time",
    "envio_n",
    "lat",
    "lon",
    "pm25",
    "pm1",
    "pm10",
    "temp",
    "hum",
    "vbat",
    "csq",
    "sats",
    "speed_kmh",
];

/// Write `rows` as CSV, header included even when there are no rows.
pub fn export_csv<W: Write>(rows: &[Reading], writer: W) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    wtr.write_record(CSV_COLUMNS)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CsvRow {
    time: Option<String>,
    envio_n: Option<String>,
    lat: Option<String>,
    lon: Option<String>,
    pm25: Option<String>,
    pm1: Option<String>,
    pm10: Option<String>,
    #[serde(alias = "temp_pms")]
    temp: Option<String>,
    hum: Option<String>,
    vbat: Option<String>,
    csq: Option<String>,
    sats: Option<String>,
    speed_kmh: Option<String>,
}

fn number(cell: &Option<String>) -> Option<f64> {
    let s = cell.as_deref()?.trim().replace(',', ".");
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

impl CsvRow {
    fn into_reading(self, device_code: &str) -> Option<Reading> {
        let time: Timestamp = self.time.as_deref()?.trim().parse().ok()?;
        let envio_n = number(&self.envio_n)
            .filter(|n| *n >= 0.0)
            .map(|n| n.round() as u64);

        let mut reading = Reading::new(device_code, time, envio_n);
        reading.lat = number(&self.lat);
        reading.lon = number(&self.lon);
        reading.pm25 = number(&self.pm25);
        reading.pm1 = number(&self.pm1);
        reading.pm10 = number(&self.pm10);
        reading.temp = number(&self.temp);
        reading.hum = number(&self.hum);
        reading.vbat = number(&self.vbat);
        reading.csq = number(&self.csq);
        reading.sats = number(&self.sats);
        reading.speed_kmh = number(&self.speed_kmh);
        Some(reading.with_valid_position())
    }
}

/// Parse CSV into readings tagged with `device_code`.
///
/// Returns the readings and the number of rows without a usable time.
pub fn parse_csv<R: Read>(reader: R, device_code: &str) -> Result<(Vec<Reading>, usize)> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    if !headers.iter().any(|h| h.eq_ignore_ascii_case("time")) {
        return Err(Error::InvalidCsv("missing 'time' column".to_string()));
    }
    let headers = csv::StringRecord::from(
        headers
            .iter()
            .map(|h| h.to_ascii_lowercase())
            .collect::<Vec<_>>(),
    );

    let mut readings = Vec::new();
    let mut skipped = 0;
    for (line, record) in rdr.records().enumerate() {
        let parsed = record
            .map_err(|e| e.to_string())
            .and_then(|r| {
                r.deserialize::<CsvRow>(Some(&headers))
                    .map_err(|e| e.to_string())
            })
            .map(|row| row.into_reading(device_code));
        match parsed {
            Ok(Some(reading)) => readings.push(reading),
            Ok(None) => {
                debug!("CSV row {} has no usable time", line + 2);
                skipped += 1;
            }
            Err(e) => {
                debug!("CSV row {} is invalid: {}", line + 2, e);
                skipped += 1;
            }
        }
    }
    Ok((readings, skipped))
}

impl DayStore {
    /// Import CSV rows into a partition.
    pub fn import_csv<R: Read>(&self, key: &PartitionKey, reader: R) -> Result<ImportResult> {
        let (readings, skipped) = parse_csv(reader, &key.device_code)?;
        let valid = readings.len();
        let rows = self.ingest(key, &readings)?;

        let result = ImportResult {
            imported: rows.len(),
            duplicates: valid - rows.len(),
            skipped,
            rows,
        };
        info!(
            "Imported {} rows into {} ({} duplicates, {} skipped)",
            result.imported, key, result.duplicates, result.skipped
        );
        Ok(result)
    }
}
