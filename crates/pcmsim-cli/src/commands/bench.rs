use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;

use pcmsim_core::{PcmDevice, SECTOR_SIZE, SimOptions, default_capacity_mb};

pub struct Options {
    pub devices: u32,
    pub capacity_mb: Option<u32>,
    pub pattern: String,
    pub mix: String,
    pub ops: u64,
    pub sectors: u64,
    pub ignore_l2: bool,
    pub ground_truth: bool,
    pub table: Option<PathBuf>,
}

struct WorkloadResult {
    ops: u64,
    bytes: u64,
    elapsed: Duration,
}

pub fn run(opts: Options) {
    let timings = match super::load_or_calibrate(opts.table.as_deref()) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let capacity_mb = opts.capacity_mb.unwrap_or_else(default_capacity_mb);
    let sim_opts = SimOptions {
        ignore_l2: opts.ignore_l2,
        ground_truth: opts.ground_truth,
    };

    let mut devices = Vec::with_capacity(opts.devices as usize);
    for i in 0..opts.devices {
        match PcmDevice::allocate(i, capacity_mb, timings.clone(), sim_opts) {
            Ok(dev) => devices.push(dev),
            Err(e) => {
                eprintln!("Could not allocate pcm{i}: {e}");
                std::process::exit(1);
            }
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        let _ = ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst));
    }

    println!(
        "Driving {} device{} of {capacity_mb} MB: {} {} x {} sectors, {} ops each",
        devices.len(),
        if devices.len() == 1 { "" } else { "s" },
        opts.pattern,
        opts.mix,
        opts.sectors,
        opts.ops,
    );
    println!("(ctrl-c stops the workload and prints statistics)");
    println!();

    // One worker thread per device; the per-device lock serializes nothing
    // here, but the layout matches how a host would drive independent disks.
    let results: Vec<WorkloadResult> = std::thread::scope(|scope| {
        let handles: Vec<_> = devices
            .iter()
            .map(|dev| {
                let stop = &stop;
                let opts = &opts;
                scope.spawn(move || workload(dev, opts, stop))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (dev, result) in devices.iter().zip(&results) {
        let secs = result.elapsed.as_secs_f64().max(1e-9);
        let mb = result.bytes as f64 / (1024.0 * 1024.0);
        println!(
            "{}: {} ops, {:.1} MB in {:.2}s ({:.1} MB/s, {:.2} us/op)",
            dev.name(),
            result.ops,
            mb,
            secs,
            mb / secs,
            result.elapsed.as_micros() as f64 / result.ops.max(1) as f64,
        );
        print!("{}", dev.stats());
        println!();
    }
}

fn workload(dev: &PcmDevice, opts: &Options, stop: &AtomicBool) -> WorkloadResult {
    let sectors = opts.sectors.max(1).min(dev.capacity_sectors() / 2);
    let len = sectors as usize * SECTOR_SIZE;
    let span = dev.capacity_sectors() - sectors;

    let mut rng = rand::rng();
    let write_data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
    let mut read_buf = vec![0u8; len];

    let mut done = 0u64;
    let mut seq_sector = 0u64;
    let t0 = Instant::now();

    for i in 0..opts.ops {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        let sector = match opts.pattern.as_str() {
            "rand" => rng.random_range(0..=span),
            _ => {
                let s = seq_sector;
                seq_sector = (seq_sector + sectors) % (span + 1);
                s
            }
        };

        let write = match opts.mix.as_str() {
            "read" => false,
            "write" => true,
            _ => i % 2 == 0,
        };

        let outcome = if write {
            dev.write_at(sector, &write_data)
        } else {
            dev.read_at(sector, &mut read_buf)
        };
        if let Err(e) = outcome {
            log::error!("{}: op {i} at sector {sector} failed: {e}", dev.name());
            break;
        }
        done += 1;
    }

    WorkloadResult {
        ops: done,
        bytes: done * len as u64,
        elapsed: t0.elapsed(),
    }
}
