//! CSV export of the data log with clean feature flag handling.
//!
//! The legacy plotting scripts read a flat standby table. The export replays
//! the data log and writes it in that layout, so existing analysis keeps
//! working without touching the append-only log.
use std::path::Path;

use crate::error::AppResult;

/// Header of the exported table.
pub const CSV_HEADER: [&str; 7] = [
    "When",
    "Device name",
    "Voltage (V)",
    "Current (A)",
    "Temperature (°C)",
    "Humidity (%RH)",
    "Kind",
];

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use crate::error::DaqError;
    use crate::events::{Measurement, MeasurementKind};
    use crate::logs::replay;
    use std::fs::File;

    /// Write every valid record of `data_log` to `out` as CSV.
    ///
    /// Returns the number of rows written.
    pub fn export_measurements_csv(data_log: &Path, out: &Path) -> AppResult<usize> {
        let measurements: Vec<Measurement> = replay(data_log)?;
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(out)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(CSV_HEADER).map_err(csv_error)?;

        for m in &measurements {
            let kind = match m.kind {
                MeasurementKind::Standby => "standby",
                MeasurementKind::IvCurve => "iv_curve",
            };
            writer
                .write_record(&[
                    m.timestamp.to_rfc3339(),
                    m.channel_id.clone(),
                    m.voltage.to_string(),
                    m.current.to_string(),
                    m.temperature.map_or(String::new(), |t| t.to_string()),
                    m.humidity.map_or(String::new(), |h| h.to_string()),
                    kind.to_string(),
                ])
                .map_err(csv_error)?;
        }
        writer.flush()?;
        tracing::info!(rows = measurements.len(), out = %out.display(), "Exported data log to CSV");
        Ok(measurements.len())
    }

    fn csv_error(err: csv::Error) -> DaqError {
        DaqError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use crate::error::DaqError;

    /// Always fails: CSV export needs the `storage_csv` feature.
    pub fn export_measurements_csv(_data_log: &Path, _out: &Path) -> AppResult<usize> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::export_measurements_csv;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::export_measurements_csv;
