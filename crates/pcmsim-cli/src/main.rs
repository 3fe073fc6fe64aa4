//! CLI for pcmsim — a RAM-backed block device with PCM timing.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pcmsim")]
#[command(about = "pcmsim — a RAM-backed block device that behaves like PCM in the time domain")]
#[command(version = pcmsim_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the DRAM timing calibration and print the full report
    Calibrate {
        /// Number of independent trial buffers
        #[arg(long, default_value_t = 100)]
        buffers: usize,

        /// Double every calibration pass to measure classifier agreement
        #[arg(long)]
        check_accuracy: bool,

        /// Do not pin the calibrating thread to a CPU
        #[arg(long)]
        no_pin: bool,

        /// Write the derived timing tables as JSON
        #[arg(long)]
        output: Option<PathBuf>,

        /// PCM row activate time in bus cycles of the original part
        #[arg(long, default_value_t = 22)]
        pcm_trcd: u32,

        /// PCM row precharge time in bus cycles of the original part
        #[arg(long, default_value_t = 60)]
        pcm_trp: u32,

        /// Bus frequency the PCM part was specified at, in MHz
        #[arg(long, default_value_t = 400)]
        pcm_mhz: u32,

        /// PCM logical row width in bytes
        #[arg(long, default_value_t = 256)]
        pcm_row_width: u32,
    },

    /// Quick look at the host's timing environment: tick overhead, CPU
    /// frequency, and a cached-vs-uncached probe sample
    Probe,

    /// Allocate simulated devices and drive a timed workload
    Bench {
        /// Number of simulated devices, one worker thread each
        #[arg(long, default_value_t = 1)]
        devices: u32,

        /// Capacity per device in MB (host default when omitted)
        #[arg(long)]
        capacity_mb: Option<u32>,

        /// Access pattern
        #[arg(long, default_value = "seq", value_parser = ["seq", "rand"])]
        pattern: String,

        /// Operation mix
        #[arg(long, default_value = "mixed", value_parser = ["read", "write", "mixed"])]
        mix: String,

        /// Operations per device
        #[arg(long, default_value_t = 100_000)]
        ops: u64,

        /// Sectors per operation (max 8 without splitting)
        #[arg(long, default_value_t = 8)]
        sectors: u64,

        /// Skip classification; every transfer pays the PCM delta
        #[arg(long)]
        ignore_l2: bool,

        /// Classify with a direct cache probe and skip the stall
        #[arg(long)]
        ground_truth: bool,

        /// Load timing tables from JSON instead of calibrating
        #[arg(long)]
        table: Option<PathBuf>,
    },

    /// Run the verification battery against a live simulated device
    Verify {
        /// Capacity of the scratch devices in MB
        #[arg(long, default_value_t = 1)]
        capacity_mb: u32,

        /// Load timing tables from JSON for the device-level checks
        #[arg(long)]
        table: Option<PathBuf>,

        /// Skip the hardware stall-latency measurement
        #[arg(long)]
        skip_hardware: bool,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Calibrate {
            buffers,
            check_accuracy,
            no_pin,
            output,
            pcm_trcd,
            pcm_trp,
            pcm_mhz,
            pcm_row_width,
        } => commands::calibrate::run(commands::calibrate::Options {
            buffers,
            check_accuracy,
            no_pin,
            output,
            pcm_trcd,
            pcm_trp,
            pcm_mhz,
            pcm_row_width,
        }),
        Commands::Probe => commands::probe::run(),
        Commands::Bench {
            devices,
            capacity_mb,
            pattern,
            mix,
            ops,
            sectors,
            ignore_l2,
            ground_truth,
            table,
        } => commands::bench::run(commands::bench::Options {
            devices,
            capacity_mb,
            pattern,
            mix,
            ops,
            sectors,
            ignore_l2,
            ground_truth,
            table,
        }),
        Commands::Verify {
            capacity_mb,
            table,
            skip_hardware,
        } => commands::verify::run(capacity_mb, table, skip_hardware),
    }
}
