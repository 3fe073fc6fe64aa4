//! Runtime verification battery for the PCM simulator.
//!
//! Exercises a *live* simulated device against the properties the model
//! guarantees: data round-trips regardless of chunking, capacity bounds
//! hold, dirty bits track uncached reads and writes, the cycle budget is
//! drained on return, classifiers agree with the region centers of their
//! thresholds, the latency model is monotonic, row-width detection
//! recovers known geometries, and the stall actually costs the modeled
//! cycles on real hardware.
//!
//! Each check returns a [`TestResult`]; [`run_battery`] runs them all.
//! Checks that need deterministic classification run against synthetic
//! calibration tables with forced verdicts, so the battery passes
//! identically on any host; only the stall-latency check times real
//! hardware.

use rand::Rng;
use sha2::{Digest, Sha256};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::sync::Arc;

use pcmsim_core::{
    CalibrationTable, Op, PcmDevice, PcmError, PcmParams, PcmTimings, SECTOR_SIZE, SECTORS_MAX,
    SimOptions, classify_read, classify_write, detect_row_width,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Core types
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of a single battery check.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub statistic: f64,
    pub details: String,
}

impl TestResult {
    fn pass(name: &str, statistic: f64, details: String) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            statistic,
            details,
        }
    }

    fn fail(name: &str, statistic: f64, details: String) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            statistic,
            details,
        }
    }
}

/// Battery configuration.
#[derive(Debug, Clone)]
pub struct BatteryConfig {
    /// Capacity of the scratch devices the battery allocates.
    ///
    /// **Default:** `1`
    pub capacity_mb: u32,

    /// Real timing tables to run the device-level checks against; synthetic
    /// tables are used when absent.
    pub timings: Option<PcmTimings>,

    /// Skip the hardware stall-latency measurement (slow, and meaningless
    /// under emulation).
    ///
    /// **Default:** `false`
    pub skip_hardware: bool,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            capacity_mb: 1,
            timings: None,
            skip_hardware: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn synthetic_timings() -> PcmTimings {
    PcmTimings::derive(CalibrationTable::synthetic(), PcmParams::default())
}

/// Synthetic table whose read classifier always answers `uncached`.
fn table_reads_always_uncached() -> CalibrationTable {
    let mut table = CalibrationTable::synthetic();
    table.threshold_read_cached = [0; SECTORS_MAX + 1];
    table.threshold_read_cb_lo = [0; SECTORS_MAX + 1];
    table.threshold_read_cb_hi = [0; SECTORS_MAX + 1];
    table
}

/// Synthetic table whose read classifier always answers `cached`.
fn table_reads_always_cached() -> CalibrationTable {
    let mut table = CalibrationTable::synthetic();
    table.threshold_read_cached = [u64::MAX; SECTORS_MAX + 1];
    table
}

fn device(timings: PcmTimings, capacity_mb: u32) -> Result<PcmDevice, PcmError> {
    PcmDevice::allocate(0, capacity_mb, Arc::new(timings), SimOptions::default())
}

fn alloc_failed(name: &str, err: PcmError) -> TestResult {
    TestResult::fail(name, 0.0, format!("device allocation failed: {err}"))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Data-path checks
// ═══════════════════════════════════════════════════════════════════════════════

/// Fixed patterns and random fills round-trip at several offsets and
/// lengths, including transfers the dispatcher must split into chunks.
pub fn round_trip_patterns(cfg: &BatteryConfig) -> TestResult {
    let name = "Round Trip";
    let timings = cfg.timings.clone().unwrap_or_else(synthetic_timings);
    let dev = match device(timings, cfg.capacity_mb) {
        Ok(d) => d,
        Err(e) => return alloc_failed(name, e),
    };

    let mut rng = rand::rng();
    let mut cases = 0u32;

    for &fill in &[0x00u8, 0xFF, 0xA5, 0x5A] {
        for &sectors in &[1usize, 2, SECTORS_MAX, SECTORS_MAX + 3, 4 * SECTORS_MAX] {
            let data = vec![fill; sectors * SECTOR_SIZE];
            let max_start = dev.capacity_sectors() - sectors as u64;
            let start = rng.random_range(0..=max_start);

            if let Err(e) = dev.write_at(start, &data) {
                return TestResult::fail(name, cases as f64, format!("write failed: {e}"));
            }
            let mut back = vec![0u8; data.len()];
            if let Err(e) = dev.read_at(start, &mut back) {
                return TestResult::fail(name, cases as f64, format!("read failed: {e}"));
            }
            if back != data {
                return TestResult::fail(
                    name,
                    cases as f64,
                    format!("mismatch at sector {start}, fill {fill:#04x}, {sectors} sectors"),
                );
            }
            cases += 1;
        }
    }

    // Random payloads at random offsets, overlapping earlier writes.
    for _ in 0..16 {
        let sectors = rng.random_range(1..=2 * SECTORS_MAX);
        let start = rng.random_range(0..=dev.capacity_sectors() - sectors as u64);
        let data: Vec<u8> = (0..sectors * SECTOR_SIZE).map(|_| rng.random()).collect();

        dev.write_at(start, &data).expect("in-bounds write");
        let mut back = vec![0u8; data.len()];
        dev.read_at(start, &mut back).expect("in-bounds read");
        if back != data {
            return TestResult::fail(
                name,
                cases as f64,
                format!("random payload mismatch at sector {start}"),
            );
        }
        cases += 1;
    }

    TestResult::pass(name, cases as f64, format!("{cases} round trips"))
}

/// Requests past the end of the device error out and leave data intact.
pub fn capacity_bound(cfg: &BatteryConfig) -> TestResult {
    let name = "Capacity Bound";
    let timings = cfg.timings.clone().unwrap_or_else(synthetic_timings);
    let dev = match device(timings, cfg.capacity_mb) {
        Ok(d) => d,
        Err(e) => return alloc_failed(name, e),
    };

    let last = dev.capacity_sectors() - 1;
    let marker = vec![0xC3u8; SECTOR_SIZE];
    dev.write_at(last, &marker).expect("last sector is writable");

    let two = vec![0x11u8; 2 * SECTOR_SIZE];
    match dev.write_at(last, &two) {
        Err(PcmError::CapacityExceeded { .. }) => {}
        other => {
            return TestResult::fail(name, 0.0, format!("expected CapacityExceeded, got {other:?}"));
        }
    }
    match dev.read_at(dev.capacity_sectors(), &mut vec![0u8; SECTOR_SIZE]) {
        Err(PcmError::CapacityExceeded { .. }) => {}
        other => {
            return TestResult::fail(name, 0.0, format!("expected CapacityExceeded, got {other:?}"));
        }
    }

    let mut back = vec![0u8; SECTOR_SIZE];
    dev.read_at(last, &mut back).expect("read back");
    if back != marker {
        return TestResult::fail(name, 0.0, "rejected request modified the backing".into());
    }

    TestResult::pass(name, 2.0, format!("device capacity {} sectors", dev.capacity_sectors()))
}

/// SHA-256 over a whole-device write stream equals the digest of the read
/// stream that follows it.
pub fn integrity_digest(cfg: &BatteryConfig) -> TestResult {
    let name = "Integrity Digest";
    let dev = match device(synthetic_timings(), cfg.capacity_mb) {
        Ok(d) => d,
        Err(e) => return alloc_failed(name, e),
    };

    let mut rng = rand::rng();
    let mut written = Sha256::new();
    let stride = 4 * SECTORS_MAX; // an odd mix of chunk-splitting transfers
    let mut sector = 0u64;
    while sector < dev.capacity_sectors() {
        let sectors = (stride as u64).min(dev.capacity_sectors() - sector) as usize;
        let data: Vec<u8> = (0..sectors * SECTOR_SIZE).map(|_| rng.random()).collect();
        written.update(&data);
        dev.write_at(sector, &data).expect("in-bounds write");
        sector += sectors as u64;
    }

    let mut read = Sha256::new();
    let mut sector = 0u64;
    while sector < dev.capacity_sectors() {
        let sectors = (stride as u64 + 3).min(dev.capacity_sectors() - sector) as usize;
        let mut back = vec![0u8; sectors * SECTOR_SIZE];
        dev.read_at(sector, &mut back).expect("in-bounds read");
        read.update(&back);
        sector += sectors as u64;
    }

    let w = written.finalize();
    let r = read.finalize();
    if w == r {
        TestResult::pass(name, dev.capacity_sectors() as f64, format!("sha256 {:02x}", w[0]))
    } else {
        TestResult::fail(name, 0.0, "digest mismatch between write and read streams".into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dirty-bit checks
// ═══════════════════════════════════════════════════════════════════════════════

/// Writes set the dirty bit of every touched sector.
pub fn dirty_bit_write_sets(cfg: &BatteryConfig) -> TestResult {
    let name = "Dirty Bits: Write Sets";
    let dev = match device(synthetic_timings(), cfg.capacity_mb) {
        Ok(d) => d,
        Err(e) => return alloc_failed(name, e),
    };

    let data = vec![0u8; 3 * SECTOR_SIZE];
    dev.write_at(20, &data).expect("write");
    for sector in 20..23 {
        if !dev.is_dirty(sector) {
            return TestResult::fail(name, sector as f64, format!("sector {sector} not dirty"));
        }
    }
    if dev.is_dirty(19) || dev.is_dirty(23) {
        return TestResult::fail(name, 0.0, "dirty bits bled outside the transfer".into());
    }
    TestResult::pass(name, 3.0, "sectors 20..23 dirty, neighbors clean".into())
}

/// An uncached read clears the dirty bits it touches; a cached read leaves
/// them alone. Forced-verdict tables make the classification deterministic.
pub fn dirty_bit_read_semantics(cfg: &BatteryConfig) -> TestResult {
    let name = "Dirty Bits: Read Clears";

    // Always-uncached reads: the read must clear.
    let timings = PcmTimings::derive(table_reads_always_uncached(), PcmParams::default());
    let dev = match device(timings, cfg.capacity_mb) {
        Ok(d) => d,
        Err(e) => return alloc_failed(name, e),
    };
    let data = vec![7u8; 2 * SECTOR_SIZE];
    dev.write_at(50, &data).expect("write");
    let mut back = vec![0u8; 2 * SECTOR_SIZE];
    dev.read_at(50, &mut back).expect("read");
    if dev.is_dirty(50) || dev.is_dirty(51) {
        return TestResult::fail(name, 0.0, "uncached read left dirty bits set".into());
    }

    // Always-cached reads: the read must not touch the bits.
    let timings = PcmTimings::derive(table_reads_always_cached(), PcmParams::default());
    let dev = match device(timings, cfg.capacity_mb) {
        Ok(d) => d,
        Err(e) => return alloc_failed(name, e),
    };
    dev.write_at(50, &data).expect("write");
    dev.read_at(50, &mut back).expect("read");
    if !dev.is_dirty(50) || !dev.is_dirty(51) {
        return TestResult::fail(name, 0.0, "cached read cleared dirty bits".into());
    }

    TestResult::pass(name, 2.0, "uncached clears, cached preserves".into())
}

/// A cached write to an already-dirty sector is not billed.
///
/// Uses a table whose write classifier always answers `cached`, a large
/// write delta, and a tick overhead high enough to disable the drain, so
/// the budget directly exposes what was billed.
pub fn write_coalescing(cfg: &BatteryConfig) -> TestResult {
    let name = "Write Coalescing";

    let mut table = CalibrationTable::synthetic();
    table.threshold_read_cached = [u64::MAX; SECTORS_MAX + 1];
    table.threshold_write_cached[1] = [u64::MAX; SECTORS_MAX + 1];
    table.tick_overhead = 1 << 40; // drain never spins
    let mut timings = PcmTimings::derive(table, PcmParams::default());
    let billed = 1_000_000i64;
    timings.latency_delta[Op::Write.index()][1] = billed;

    let dev = match device(timings, cfg.capacity_mb) {
        Ok(d) => d,
        Err(e) => return alloc_failed(name, e),
    };

    let data = vec![9u8; SECTOR_SIZE];
    dev.write_at(5, &data).expect("first write");
    let after_first = dev.stats();
    dev.write_at(5, &data).expect("second write");
    let after_second = dev.stats();

    if after_second.writes[1] != 2 {
        return TestResult::fail(
            name,
            after_second.writes[1] as f64,
            "writes not classified cached under the forced table".into(),
        );
    }
    // The drain subtracts a handful of cycles per call; anything near one
    // billed delta means the second write added nothing.
    let drift = (after_first.budget - after_second.budget).abs();
    if after_first.budget < billed / 2 || drift > billed / 2 {
        return TestResult::fail(
            name,
            after_second.budget as f64,
            format!(
                "budget {} then {}; second write appears billed",
                after_first.budget, after_second.budget
            ),
        );
    }

    TestResult::pass(
        name,
        after_second.budget as f64,
        format!("budget {} after coalesced write", after_second.budget),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Model checks
// ═══════════════════════════════════════════════════════════════════════════════

/// The drain leaves no more than one tick-read of budget behind.
pub fn budget_drained(cfg: &BatteryConfig) -> TestResult {
    let name = "Budget Drain";
    let timings = cfg.timings.clone().unwrap_or_else(synthetic_timings);
    let overhead = timings.tick_overhead() as i64;
    let dev = match device(timings, cfg.capacity_mb) {
        Ok(d) => d,
        Err(e) => return alloc_failed(name, e),
    };

    let mut rng = rand::rng();
    let mut worst = i64::MIN;
    for _ in 0..64 {
        let sectors = rng.random_range(1..=SECTORS_MAX);
        let start = rng.random_range(0..dev.capacity_sectors() - sectors as u64);
        let data = vec![0x3Cu8; sectors * SECTOR_SIZE];
        if rng.random() {
            dev.write_at(start, &data).expect("write");
        } else {
            let mut back = data;
            dev.read_at(start, &mut back).expect("read");
        }
        worst = worst.max(dev.stats().budget);
        if dev.stats().budget > overhead {
            return TestResult::fail(
                name,
                dev.stats().budget as f64,
                format!("budget {} above tick overhead {overhead}", dev.stats().budget),
            );
        }
    }

    TestResult::pass(name, worst as f64, format!("worst residual budget {worst} of {overhead}"))
}

/// Classifier agreement at the region centers of every sector count.
pub fn classifier_centers() -> TestResult {
    let name = "Classifier Centers";
    let table = CalibrationTable::synthetic();
    let oc = &table.overhead_copy;

    for n in 1..=SECTORS_MAX {
        let read_cases = [
            (oc[1][0][n], true),
            (oc[1][1][n], true),
            (oc[1][2][n], true),
            (oc[0][0][n], false),
            (oc[0][1][n], false),
            (oc[0][2][n], false),
        ];
        for (t, want) in read_cases {
            if classify_read(&table, n, t) != want {
                return TestResult::fail(
                    name,
                    t as f64,
                    format!("read center {t} misclassified at {n} sectors"),
                );
            }
        }

        let write_cases = [
            (oc[1][1][n], true),
            (oc[0][1][n], true),
            (oc[1][0][n], false),
            (oc[0][0][n], false),
            (oc[1][2][n], false),
        ];
        for (t, want) in write_cases {
            if classify_write(&table, n, t) != want {
                return TestResult::fail(
                    name,
                    t as f64,
                    format!("write center {t} misclassified at {n} sectors"),
                );
            }
        }

        // Region edges, one cycle either side of the cached threshold.
        let edge = table.threshold_read_cached[n];
        if !classify_read(&table, n, edge - 1) || classify_read(&table, n, edge + 1) {
            return TestResult::fail(name, edge as f64, format!("edge behavior wrong at {n}"));
        }
    }

    TestResult::pass(name, (SECTORS_MAX * 11) as f64, "all centers and edges agree".into())
}

/// PCM latency is strictly increasing in the sector count.
pub fn latency_monotonicity(cfg: &BatteryConfig) -> TestResult {
    let name = "Latency Monotonicity";
    let timings = cfg.timings.clone().unwrap_or_else(synthetic_timings);

    for op in [Op::Read, Op::Write] {
        for n in 2..=SECTORS_MAX {
            let prev = timings.latency[op.index()][n - 1];
            let cur = timings.latency[op.index()][n];
            if cur <= prev {
                return TestResult::fail(
                    name,
                    cur as f64,
                    format!("{op} latency {prev} -> {cur} not increasing at {n} sectors"),
                );
            }
        }
    }

    TestResult::pass(
        name,
        timings.latency[Op::Write.index()][SECTORS_MAX] as f64,
        format!(
            "read {}..{}, write {}..{} cycles",
            timings.latency[0][1],
            timings.latency[0][SECTORS_MAX],
            timings.latency[1][1],
            timings.latency[1][SECTORS_MAX]
        ),
    )
}

/// Row-width detection recovers known synthetic geometries.
pub fn row_width_detection() -> TestResult {
    let name = "Row Width Detection";
    let bus = CalibrationTable::synthetic().bus;
    let switch = (bus.t_rcd + bus.t_rp + bus.t_cl10.div_ceil(10) - 1) as u64;

    for expected in [128u32, 256] {
        let detected = detect_row_width(
            |bytes| {
                let rows = bytes as u64 / expected as u64;
                (bytes as u64 / 16 + rows * switch) * bus.bus_scale
            },
            &bus,
        );
        if detected != expected {
            return TestResult::fail(
                name,
                detected as f64,
                format!("expected {expected}-byte rows, detected {detected}"),
            );
        }
    }

    TestResult::pass(name, 2.0, "128- and 256-byte rows recovered".into())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Hardware checks
// ═══════════════════════════════════════════════════════════════════════════════

/// The stall actually costs the modeled cycles.
///
/// Two devices share identical forced-uncached tables except that one bills
/// a 10 000-cycle write delta and the other bills nothing; the trimmed mean
/// difference of their 4 KB write times must land within [0.8, 1.4] of the
/// delta. The details carry a Student-t 95% interval on the difference.
pub fn stall_latency(cfg: &BatteryConfig) -> TestResult {
    let name = "Stall Latency";
    const DELTA: i64 = 10_000;
    const TRIALS: usize = 64;

    let mut table = CalibrationTable::synthetic();
    // Force every write to classify uncached so the delta is always billed.
    table.threshold_read_cached = [0; SECTORS_MAX + 1];
    table.threshold_read_cb_lo = [0; SECTORS_MAX + 1];
    table.threshold_read_cb_hi = [0; SECTORS_MAX + 1];
    table.threshold_write_lo = [u64::MAX; SECTORS_MAX + 1];
    table.tick_overhead = pcmsim_core::ticks::measure_tick_overhead();

    let mut stalled = PcmTimings::derive(table.clone(), PcmParams::default());
    stalled.latency_delta[Op::Write.index()][SECTORS_MAX] = DELTA;
    let mut unstalled = PcmTimings::derive(table, PcmParams::default());
    unstalled.latency_delta = [[0; SECTORS_MAX + 1]; 2];

    let dev_stalled = match device(stalled, cfg.capacity_mb) {
        Ok(d) => d,
        Err(e) => return alloc_failed(name, e),
    };
    let dev_unstalled = match device(unstalled, cfg.capacity_mb) {
        Ok(d) => d,
        Err(e) => return alloc_failed(name, e),
    };

    let data = vec![0x42u8; SECTORS_MAX * SECTOR_SIZE];
    let time_writes = |dev: &PcmDevice| -> Vec<f64> {
        let mut samples = Vec::with_capacity(TRIALS);
        for i in 0..TRIALS {
            let sector = (i as u64 * SECTORS_MAX as u64) % (dev.capacity_sectors() - 8);
            let t0 = pcmsim_core::ticks::ticks_fenced();
            dev.write_at(sector, &data).expect("write");
            let t1 = pcmsim_core::ticks::ticks_fenced();
            samples.push(t1.wrapping_sub(t0) as f64);
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
        // Trim the top and bottom 10% against preemption outliers.
        samples[TRIALS / 10..TRIALS - TRIALS / 10].to_vec()
    };

    let with = time_writes(&dev_stalled);
    let without = time_writes(&dev_unstalled);

    let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
    let diff = mean(&with) - mean(&without);

    let var = |v: &[f64]| {
        let m = mean(v);
        v.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (v.len() - 1) as f64
    };
    let se = (var(&with) / with.len() as f64 + var(&without) / without.len() as f64).sqrt();
    let dof = (with.len() + without.len() - 2) as f64;
    let t95 = StudentsT::new(0.0, 1.0, dof)
        .map(|d| d.inverse_cdf(0.975))
        .unwrap_or(2.0);
    let half_width = t95 * se;

    let lo = 0.8 * DELTA as f64;
    let hi = 1.4 * DELTA as f64;
    let details = format!(
        "stall cost {diff:.0} +/- {half_width:.0} cycles (want {lo:.0}..{hi:.0})"
    );

    if diff >= lo && diff <= hi {
        TestResult::pass(name, diff, details)
    } else {
        TestResult::fail(name, diff, details)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Runner
// ═══════════════════════════════════════════════════════════════════════════════

/// Run every battery check.
pub fn run_battery(cfg: &BatteryConfig) -> Vec<TestResult> {
    let mut results = vec![
        round_trip_patterns(cfg),
        capacity_bound(cfg),
        integrity_digest(cfg),
        dirty_bit_write_sets(cfg),
        dirty_bit_read_semantics(cfg),
        write_coalescing(cfg),
        budget_drained(cfg),
        classifier_centers(),
        latency_monotonicity(cfg),
        row_width_detection(),
    ];
    if !cfg.skip_hardware {
        results.push(stall_latency(cfg));
    }

    for r in &results {
        if !r.passed {
            log::warn!("battery check failed: {}: {}", r.name, r.details);
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_checks_pass() {
        let cfg = BatteryConfig::default();
        for result in [
            round_trip_patterns(&cfg),
            capacity_bound(&cfg),
            integrity_digest(&cfg),
            dirty_bit_write_sets(&cfg),
            dirty_bit_read_semantics(&cfg),
            write_coalescing(&cfg),
            budget_drained(&cfg),
            classifier_centers(),
            latency_monotonicity(&cfg),
            row_width_detection(),
        ] {
            assert!(result.passed, "{}: {}", result.name, result.details);
        }
    }

    #[test]
    #[ignore] // Hardware-dependent: times the real stall loop
    fn hardware_stall_latency() {
        let result = stall_latency(&BatteryConfig::default());
        assert!(result.passed, "{}", result.details);
    }

    #[test]
    fn runner_covers_all_checks() {
        let cfg = BatteryConfig {
            skip_hardware: true,
            ..BatteryConfig::default()
        };
        let results = run_battery(&cfg);
        assert_eq!(results.len(), 10);
    }
}
