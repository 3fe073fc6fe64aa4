pub mod bench;
pub mod calibrate;
pub mod probe;
pub mod verify;

use std::path::Path;

use pcmsim_core::{CalibrationConfig, PcmParams, PcmTimings, calibrate};

/// Load timing tables from JSON, or run a fresh calibration when no file is
/// given.
pub fn load_or_calibrate(table: Option<&Path>) -> Result<PcmTimings, String> {
    match table {
        Some(path) => PcmTimings::load_json(path)
            .map_err(|e| format!("could not load {}: {e}", path.display())),
        None => {
            eprintln!("No timing table given; calibrating (this takes a while)...");
            let table = calibrate(&CalibrationConfig::default())
                .map_err(|e| format!("calibration failed: {e}"))?;
            Ok(PcmTimings::derive(table, PcmParams::default()))
        }
    }
}
