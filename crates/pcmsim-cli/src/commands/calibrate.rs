use std::path::PathBuf;

use pcmsim_core::{CalibrationConfig, PcmParams, PcmTimings, calibrate};

pub struct Options {
    pub buffers: usize,
    pub check_accuracy: bool,
    pub no_pin: bool,
    pub output: Option<PathBuf>,
    pub pcm_trcd: u32,
    pub pcm_trp: u32,
    pub pcm_mhz: u32,
    pub pcm_row_width: u32,
}

pub fn run(opts: Options) {
    let cfg = CalibrationConfig {
        max_buffers: opts.buffers,
        check_accuracy: opts.check_accuracy,
        pin_cpu: if opts.no_pin { None } else { Some(0) },
    };

    let table = match calibrate(&cfg) {
        Ok(table) => table,
        Err(e) => {
            eprintln!("Calibration failed: {e}");
            std::process::exit(1);
        }
    };

    let params = PcmParams {
        org_t_rcd: opts.pcm_trcd,
        org_t_rp: opts.pcm_trp,
        org_mhz: opts.pcm_mhz,
        row_width: opts.pcm_row_width,
    };
    let timings = PcmTimings::derive(table, params);

    print!("{}", timings.table);
    print!("{timings}");

    if let Some(path) = opts.output {
        match timings.save_json(&path) {
            Ok(()) => println!("\nTiming tables written to {}", path.display()),
            Err(e) => {
                eprintln!("Could not write {}: {e}", path.display());
                std::process::exit(1);
            }
        }
    }
}
