use pcmsim_core::memops::{CacheFlusher, timed_line_probe};
use pcmsim_core::ticks::{estimate_cpu_khz, measure_tick_overhead, ticks_fenced, ticks_raw};

pub fn run() {
    println!("Probing the timing environment...");
    println!();

    let overhead = measure_tick_overhead();
    let khz = estimate_cpu_khz();
    println!("Tick overhead:   {overhead} cycles (fenced read)");
    println!("CPU frequency:   {} MHz", khz / 1000);

    let raw = {
        let s = ticks_raw();
        ticks_raw().wrapping_sub(s)
    };
    let fenced = {
        let s = ticks_fenced();
        ticks_fenced().wrapping_sub(s)
    };
    println!("Back-to-back:    {raw} cycles raw, {fenced} cycles fenced");
    println!();

    let flusher = match CacheFlusher::allocate() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Could not allocate the spoiler buffer: {e}");
            std::process::exit(1);
        }
    };
    let buffer = vec![0u8; 4096];

    flusher.flush();
    let uncached = timed_line_probe(&buffer);
    let cached = timed_line_probe(&buffer);
    println!("Worst-line probe over 4 KB:");
    println!("  uncached:      {uncached} cycles");
    println!("  cached:        {cached} cycles");

    if uncached <= cached + 4 {
        println!();
        println!("Cached and uncached probes are not separable on this host;");
        println!("calibration will warn and fall back to a coarse threshold.");
    }
}
