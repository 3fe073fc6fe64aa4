use std::path::PathBuf;

use pcmsim_core::PcmTimings;
use pcmsim_tests::{BatteryConfig, run_battery};

pub fn run(capacity_mb: u32, table: Option<PathBuf>, skip_hardware: bool) {
    let timings = match table {
        Some(path) => match PcmTimings::load_json(&path) {
            Ok(t) => Some(t),
            Err(e) => {
                eprintln!("Could not load {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => None,
    };

    let cfg = BatteryConfig {
        capacity_mb,
        timings,
        skip_hardware,
    };

    println!("Running the verification battery...");
    println!();

    let results = run_battery(&cfg);
    let mut failed = 0;
    for r in &results {
        println!(
            "  [{}] {:24} {}",
            if r.passed { "PASS" } else { "FAIL" },
            r.name,
            r.details
        );
        if !r.passed {
            failed += 1;
        }
    }

    println!();
    println!("{}/{} checks passed", results.len() - failed, results.len());
    if failed > 0 {
        std::process::exit(1);
    }
}
