//! Memory-timing calibration.
//!
//! Runs once before any device exists and produces the frozen
//! [`CalibrationTable`] the stall loops classify against: per-sector-count
//! overheads of the read and copy primitives for every cache scenario, the
//! thresholds that separate those scenarios, the logical DRAM row width, and
//! the bus parameters used to extrapolate PCM timings.
//!
//! The measurement discipline follows the reference simulator: flush the
//! cache hierarchy, time the primitive once (uncached sample), time it again
//! (cached sample), subtract the tick-read overhead, and average across up
//! to 100 independently allocated trial buffers. Buffers whose very first
//! probe shows outlier latencies (NUMA placement, migration) are discarded.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PcmError;
use crate::memops::{CacheFlusher, copy_buffer, read_buffer, timed_line_probe};
use crate::ticks::{
    estimate_cpu_khz, full_fence, load_fence, measure_tick_overhead, ticks_fenced,
};

/// Maximum number of sectors a single stall-loop transfer may cover.
pub const SECTORS_MAX: usize = 8;

/// Size of one sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Upper bound used where the cached-read band has no upper edge.
pub const CB_UNBOUNDED: u64 = 1_000_000;

/// Row-width sweep reads `n << ROW_SWEEP_EXP` bytes per step.
const ROW_SWEEP_EXP: u32 = 14;
const ROW_SWEEP_TRIALS: u32 = 16;

/// First-probe latencies above this are treated as placement noise and the
/// buffer is discarded.
const OUTLIER_CYCLES: u64 = 2 * 2000;

/// Bytes covered by the cached-vs-uncached probe threshold measurement.
const PROBE_BYTES: usize = 4096;

/// Bytes of the spoiler dirtied before writeback-scenario trials.
const DIRTY_BYTES: usize = 4 * 1024 * 1024;

/// Per-buffer size: the row sweep reads up to `SECTORS_MAX << 14` bytes.
const BUFFER_BYTES: usize = SECTORS_MAX << ROW_SWEEP_EXP;

/// One `u64` per sector count; index 0 is unused.
pub type PerSector = [u64; SECTORS_MAX + 1];
/// One variance per sector count; index 0 is unused.
pub type PerSectorVar = [f64; SECTORS_MAX + 1];

// ---------------------------------------------------------------------------
// Bus parameters
// ---------------------------------------------------------------------------

/// Memory-bus description: nominal DDR parameters plus the measured CPU
/// frequency and the derived CPU-cycles-per-bus-cycle scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusParams {
    pub ddr_version: u32,
    pub ddr_rating: u32,
    /// Bus clock in MHz (half the DDR rating).
    pub bus_mhz: u32,
    /// CPU cycles per bus cycle, rounded half-up.
    pub bus_scale: u64,
    /// Logical row width in bytes, overwritten by autodetection.
    pub row_width: u32,
    /// Row activate time in bus cycles.
    pub t_rcd: u32,
    /// Row precharge time in bus cycles.
    pub t_rp: u32,
    /// CAS latency in tenths of a bus cycle.
    pub t_cl10: u32,
    pub cpu_khz: u64,
}

impl BusParams {
    /// Nominal bus parameters for the host class, scaled to the measured
    /// CPU frequency.
    pub fn detect(cpu_khz: u64) -> Self {
        let (ddr_version, ddr_rating, t_rcd, t_rp, t_cl10) =
            if cfg!(target_pointer_width = "64") {
                (2, 667, 5, 5, 50)
            } else {
                (1, 333, 3, 3, 25)
            };
        let bus_mhz = ddr_rating / 2;

        let mut scale10 = cpu_khz * 10 / (bus_mhz as u64 * 1000);
        if scale10 % 10 > 5 {
            scale10 += 10;
        }
        let bus_scale = (scale10 / 10).max(1);

        Self {
            ddr_version,
            ddr_rating,
            bus_mhz,
            bus_scale,
            row_width: 128,
            t_rcd,
            t_rp,
            t_cl10,
            cpu_khz,
        }
    }

    fn bus_name(&self) -> String {
        if self.ddr_version <= 1 {
            format!("DDR-{}", self.ddr_rating)
        } else {
            format!("DDR{}-{}", self.ddr_version, self.ddr_rating)
        }
    }
}

// ---------------------------------------------------------------------------
// Calibration table
// ---------------------------------------------------------------------------

/// Classifier-accuracy cross-check: correct classifications per copy
/// scenario, out of `trials` samples each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccuracyTable {
    pub read_ok: [[PerSector; 3]; 3],
    pub write_ok: [[PerSector; 3]; 3],
    pub trials: u32,
}

/// The complete thresholds-and-overheads table the stall loop depends on.
///
/// Written once by [`calibrate`] and immutable afterwards; share it (inside
/// a [`crate::model::PcmTimings`]) via `Arc` without locks. Indices are
/// `[cache_state][n]` with `0 = uncached`, `1 = cached`, and for copy
/// destinations `2 = uncached + writeback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationTable {
    /// Self-cost of a fenced tick read.
    pub tick_overhead: u64,
    /// Worst-line probe threshold separating cached from uncached buffers.
    pub threshold_l2: u64,
    /// Mean cached / uncached probe latencies (report only).
    pub mean_probe_cached: u64,
    pub mean_probe_uncached: u64,
    /// Surviving trial buffers.
    pub trials: u32,
    pub bus: BusParams,

    /// Mean cycles of `read_buffer` per `[cache_state][n]`.
    pub overhead_read: [PerSector; 2],
    pub var_read: [PerSectorVar; 2],
    /// Mean cycles of `copy_buffer` per `[src_state][dst_state][n]`.
    pub overhead_copy: [[PerSector; 3]; 3],
    pub var_copy: [[PerSectorVar; 3]; 3],

    /// Copy times below this are cached reads.
    pub threshold_read_cached: PerSector,
    /// Copy times inside `(cb_lo, cb_hi)` are cached reads whose destination
    /// paid a writeback.
    pub threshold_read_cb_lo: PerSector,
    pub threshold_read_cb_hi: PerSector,
    /// Write classification: `[0]` is the upper edge of the cached band above
    /// `threshold_read_cached`, `[1]` the cached bound below it.
    pub threshold_write_cached: [PerSector; 2],
    pub threshold_write_lo: PerSector,

    pub accuracy: Option<AccuracyTable>,
}

/// Derived per-`n` classifier thresholds.
struct Thresholds {
    read_cached: u64,
    cb_lo: u64,
    cb_hi: u64,
    write_cached: [u64; 2],
    write_lo: u64,
}

/// Midpoint thresholds with the reference's corner-case overrides, applied
/// in order so a later matching case wins.
fn derive_thresholds(oc: &[[PerSector; 3]; 3], n: usize) -> Thresholds {
    let read_cached = (oc[0][1][n] + oc[1][0][n]) / 2;

    let mut cb_lo = (oc[0][1][n] + oc[1][2][n]) / 2;
    let mut cb_hi = (oc[0][0][n] + oc[1][2][n]) / 2;
    if oc[1][2][n] > oc[0][0][n] {
        cb_lo = (oc[0][0][n] + oc[1][2][n]) / 2;
        cb_hi = CB_UNBOUNDED;
    }
    if oc[1][2][n] < oc[0][1][n] {
        cb_lo = 0;
        cb_hi = (oc[0][1][n] + oc[1][2][n]) / 2;
    }
    if oc[1][2][n] < oc[2][1][n] && oc[2][1][n] < oc[0][1][n] {
        cb_lo = 0;
        cb_hi = (oc[2][1][n] + oc[1][2][n]) / 2;
    }

    let mut write_cached = [
        (oc[0][1][n] + oc[1][2][n]) / 2,
        (oc[1][1][n] + oc[1][0][n]) / 2,
    ];
    let alt = (oc[0][1][n] + oc[0][0][n]) / 2;
    if alt > write_cached[0] {
        write_cached[0] = alt;
    }

    let mut write_lo = read_cached;
    if oc[1][2][n] < oc[0][1][n] {
        write_lo = (oc[0][1][n] + oc[1][2][n]) / 2;
    }
    if oc[1][2][n] < oc[2][1][n] && oc[2][1][n] < oc[0][1][n] {
        write_lo = (oc[2][1][n] + oc[1][2][n]) / 2;
        write_cached[0] = (oc[0][0][n] + oc[0][1][n]) / 2;
    }

    Thresholds {
        read_cached,
        cb_lo,
        cb_hi,
        write_cached,
        write_lo,
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Sample variance of the recorded trial values.
pub fn variance(samples: &[u64]) -> f64 {
    if samples.len() < 2 {
        log::warn!("variance requested over {} samples", samples.len());
        return 0.0;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<u64>() as f64 / n;
    let ss: f64 = samples
        .iter()
        .map(|&s| {
            let d = s as f64 - mean;
            d * d
        })
        .sum();
    ss / (n - 1.0)
}

/// Half-width of a 95% prediction interval.
///
/// Uses t(0.975) = 1.985, the quantile for the ~95 trials the calibrator
/// runs with.
pub fn hw95pi(var: f64, count: u32) -> u64 {
    if count == 0 {
        return 0;
    }
    (1.985 * (var + var / count as f64).sqrt()) as u64
}

/// Round to the nearest power of two (ties toward the larger power).
fn round_pow2(v: u64) -> u64 {
    if v <= 2 {
        return v.max(1);
    }
    let bits = 64 - v.leading_zeros();
    let second = (v >> (bits - 2)) & 1;
    1 << (bits - if second == 0 { 1 } else { 0 })
}

// ---------------------------------------------------------------------------
// Row-width detection
// ---------------------------------------------------------------------------

/// Autodetect the logical row width (bytes per row-to-row advance).
///
/// `probe(bytes)` must return the mean uncached-read cost of `bytes` bytes
/// in CPU cycles. The sweep converts the per-step latency growth into
/// row-switch counts using `tRCD + tRP + ceil(tCL) - 1` bus cycles per
/// switch, rounds to a power of two, and averages over 16 trials. Generic
/// over the probe so synthetic timing models can exercise it.
pub fn detect_row_width<F: FnMut(usize) -> u64>(mut probe: F, bus: &BusParams) -> u32 {
    let switch_cost = (bus.t_rcd + bus.t_rp + bus.t_cl10.div_ceil(10) - 1) as u64;
    // Bus cycles spent on the data transfer itself per sweep step.
    let transfer = 1u64 << (ROW_SWEEP_EXP - 4);

    let mut width_total = 0u64;
    for _ in 0..ROW_SWEEP_TRIALS {
        let mut times = [0u64; SECTORS_MAX + 1];
        for n in 1..=SECTORS_MAX {
            times[n] = probe(n << ROW_SWEEP_EXP);
        }

        let mut step_sum = 0u64;
        for n in 2..=SECTORS_MAX {
            step_sum += times[n].saturating_sub(times[n - 1]);
        }
        let d = step_sum / (bus.bus_scale * (SECTORS_MAX as u64 - 1));

        let switches = d.saturating_sub(transfer).div_ceil(switch_cost).max(1);
        let switches = round_pow2(switches);
        width_total += (1u64 << ROW_SWEEP_EXP) / switches;
    }

    round_pow2(width_total / ROW_SWEEP_TRIALS as u64) as u32
}

// ---------------------------------------------------------------------------
// Calibrator
// ---------------------------------------------------------------------------

/// Calibration options.
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// Trial buffers to allocate.
    ///
    /// **Default:** `100`
    pub max_buffers: usize,

    /// Double every copy pass to measure classifier agreement.
    ///
    /// **Default:** `false`
    pub check_accuracy: bool,

    /// Pin the calibrating thread to this CPU for the timed segments.
    ///
    /// **Default:** `Some(0)`
    pub pin_cpu: Option<usize>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            max_buffers: 100,
            check_accuracy: false,
            pin_cpu: Some(0),
        }
    }
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) -> bool {
    // SAFETY: a zeroed cpu_set_t is a valid empty set; CPU_SET and
    // sched_setaffinity only read/write that set.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu: usize) -> bool {
    false
}

fn try_alloc_words(words: usize, what: &'static str) -> Result<Vec<u64>, PcmError> {
    let mut v = Vec::new();
    v.try_reserve_exact(words)
        .map_err(|_| PcmError::AllocationFailed {
            what,
            bytes: words * 8,
        })?;
    v.resize(words, 0);
    Ok(v)
}

fn as_bytes(words: &[u64]) -> &[u8] {
    // SAFETY: any u64 slice is a valid byte slice of 8x the length.
    unsafe { std::slice::from_raw_parts(words.as_ptr() as *const u8, words.len() * 8) }
}

fn as_bytes_mut(words: &mut [u64]) -> &mut [u8] {
    // SAFETY: as above; exclusive borrow carries over.
    unsafe { std::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, words.len() * 8) }
}

struct Calibrator {
    tick_overhead: u64,
    bufs: Vec<Option<Vec<u64>>>,
    write_buf: Vec<u64>,
    flusher: CacheFlusher,
    count: u32,
}

impl Calibrator {
    /// Time `f` with fenced tick reads, netting out the tick-read overhead.
    fn timed<F: FnOnce()>(&self, f: F) -> u64 {
        let s = ticks_fenced();
        f();
        let e = ticks_fenced();
        e.wrapping_sub(s).saturating_sub(self.tick_overhead)
    }

    /// Probe threshold pass: discard outlier buffers, return
    /// `(threshold_l2, mean_cached, mean_uncached)`.
    fn probe_threshold(&mut self) -> Result<(u64, u64, u64), PcmError> {
        let mut uncached_sum = 0u64;
        let mut cached_sum = 0u64;

        for slot in self.bufs.iter_mut() {
            let Some(buf) = slot else { continue };
            let probe_region = &as_bytes(buf)[..PROBE_BYTES];

            self.flusher.flush();
            let s = timed_line_probe(probe_region);
            let t = timed_line_probe(probe_region);

            if s > OUTLIER_CYCLES || t > OUTLIER_CYCLES {
                // NUMA placement or a migration mid-probe; drop the buffer.
                *slot = None;
                self.count -= 1;
                continue;
            }

            uncached_sum += s;
            cached_sum += t;
        }

        if self.count == 0 {
            return Err(PcmError::AllocationFailed {
                what: "calibration trial buffers (all discarded as outliers)",
                bytes: BUFFER_BYTES,
            });
        }

        let count = self.count as u64;
        if uncached_sum <= cached_sum + 4 * count {
            log::warn!("could not separate cached from uncached probe times");
            cached_sum = uncached_sum / 2;
        }
        let threshold = (cached_sum + (uncached_sum - cached_sum) / 4) / count;

        Ok((threshold, cached_sum / count, uncached_sum / count))
    }

    /// Measure `read_buffer` for every sector count, uncached then cached.
    fn read_overheads(&mut self) -> ([PerSector; 2], [PerSectorVar; 2], bool) {
        let mut mean = [[0u64; SECTORS_MAX + 1]; 2];
        let mut var = [[0f64; SECTORS_MAX + 1]; 2];

        let mut ok = false;
        for _pass in 0..=SECTORS_MAX {
            for n in 1..=SECTORS_MAX {
                let bytes = n * SECTOR_SIZE;
                let mut uncached = Vec::with_capacity(self.count as usize);
                let mut cached = Vec::with_capacity(self.count as usize);

                for slot in self.bufs.iter().flatten() {
                    let region = &as_bytes(slot)[..bytes];

                    self.flusher.flush();
                    full_fence();
                    let s = self.timed(|| read_buffer(region));

                    full_fence();
                    let t = self.timed(|| read_buffer(region));

                    uncached.push(s);
                    cached.push(t);
                }

                mean[0][n] = uncached.iter().sum::<u64>() / self.count as u64;
                mean[1][n] = cached.iter().sum::<u64>() / self.count as u64;
                var[0][n] = variance(&uncached);
                var[1][n] = variance(&cached);
            }

            if rows_monotonic(&mean[0]) && rows_monotonic(&mean[1]) {
                ok = true;
                break;
            }
        }

        (mean, var, ok)
    }

    /// Measure `copy_buffer` in the eight source/destination scenarios.
    fn copy_overheads(&mut self) -> ([[PerSector; 3]; 3], [[PerSectorVar; 3]; 3], bool) {
        let mut mean = [[[0u64; SECTORS_MAX + 1]; 3]; 3];
        let mut var = [[[0f64; SECTORS_MAX + 1]; 3]; 3];

        let mut ok = false;
        for _pass in 0..=SECTORS_MAX {
            for n in 1..=SECTORS_MAX {
                self.copy_scenarios(n, &mut mean, &mut var);
            }

            ok = [(0usize, 0usize), (0, 1), (1, 0), (1, 1)]
                .iter()
                .all(|&(src, dst)| rows_monotonic(&mean[src][dst]));
            if ok {
                break;
            }
        }

        (mean, var, ok)
    }

    /// One full set of copy scenarios for `n` sectors.
    fn copy_scenarios(
        &mut self,
        n: usize,
        mean: &mut [[PerSector; 3]; 3],
        var: &mut [[PerSectorVar; 3]; 3],
    ) {
        let bytes = n * SECTOR_SIZE;
        let count = self.count as u64;
        let mut s_samples = Vec::with_capacity(self.count as usize);
        let mut t_samples = Vec::with_capacity(self.count as usize);

        // Destination uncached: cold copy, then again with the source warm.
        for u in 0..self.bufs.len() {
            let Some(buf) = self.bufs[u].take() else {
                continue;
            };
            let src = &as_bytes(&buf)[..bytes];

            self.flusher.flush();
            full_fence();
            let s = {
                let dst = &mut as_bytes_mut(&mut self.write_buf)[..bytes];
                let start = ticks_fenced();
                copy_buffer(dst, src);
                ticks_fenced()
                    .wrapping_sub(start)
                    .saturating_sub(self.tick_overhead)
            };

            self.flusher.flush();
            full_fence();
            read_buffer(src);
            let t = {
                let dst = &mut as_bytes_mut(&mut self.write_buf)[..bytes];
                let start = ticks_fenced();
                copy_buffer(dst, src);
                ticks_fenced()
                    .wrapping_sub(start)
                    .saturating_sub(self.tick_overhead)
            };

            s_samples.push(s);
            t_samples.push(t);
            self.bufs[u] = Some(buf);
        }
        mean[0][0][n] = s_samples.iter().sum::<u64>() / count;
        mean[1][0][n] = t_samples.iter().sum::<u64>() / count;
        var[0][0][n] = variance(&s_samples);
        var[1][0][n] = variance(&t_samples);
        s_samples.clear();
        t_samples.clear();

        // Destination uncached with dirty victims: evictions pay a writeback.
        for u in 0..self.bufs.len() {
            let Some(buf) = self.bufs[u].take() else {
                continue;
            };
            let src = &as_bytes(&buf)[..bytes];

            self.flusher.flush();
            full_fence();
            self.flusher.dirty(DIRTY_BYTES);
            let s = {
                let dst = &mut as_bytes_mut(&mut self.write_buf)[..bytes];
                let start = ticks_fenced();
                copy_buffer(dst, src);
                ticks_fenced()
                    .wrapping_sub(start)
                    .saturating_sub(self.tick_overhead)
            };

            self.flusher.flush();
            full_fence();
            self.flusher.dirty(DIRTY_BYTES);
            read_buffer(src);
            let t = {
                let dst = &mut as_bytes_mut(&mut self.write_buf)[..bytes];
                let start = ticks_fenced();
                copy_buffer(dst, src);
                ticks_fenced()
                    .wrapping_sub(start)
                    .saturating_sub(self.tick_overhead)
            };

            s_samples.push(s);
            t_samples.push(t);
            self.bufs[u] = Some(buf);
        }
        mean[0][2][n] = s_samples.iter().sum::<u64>() / count;
        mean[1][2][n] = t_samples.iter().sum::<u64>() / count;
        var[0][2][n] = variance(&s_samples);
        var[1][2][n] = variance(&t_samples);
        s_samples.clear();
        t_samples.clear();

        // Destination cached: warm the destination first; the second copy
        // additionally has a warm source from the first.
        for u in 0..self.bufs.len() {
            let Some(buf) = self.bufs[u].take() else {
                continue;
            };
            let src = &as_bytes(&buf)[..bytes];

            self.flusher.flush();
            full_fence();
            read_buffer(&as_bytes(&self.write_buf)[..bytes]);
            let s = {
                let dst = &mut as_bytes_mut(&mut self.write_buf)[..bytes];
                let start = ticks_fenced();
                copy_buffer(dst, src);
                ticks_fenced()
                    .wrapping_sub(start)
                    .saturating_sub(self.tick_overhead)
            };

            full_fence();
            read_buffer(&as_bytes(&self.write_buf)[..bytes]);
            let t = {
                let dst = &mut as_bytes_mut(&mut self.write_buf)[..bytes];
                let start = ticks_fenced();
                copy_buffer(dst, src);
                ticks_fenced()
                    .wrapping_sub(start)
                    .saturating_sub(self.tick_overhead)
            };

            s_samples.push(s);
            t_samples.push(t);
            self.bufs[u] = Some(buf);
        }
        mean[0][1][n] = s_samples.iter().sum::<u64>() / count;
        mean[1][1][n] = t_samples.iter().sum::<u64>() / count;
        var[0][1][n] = variance(&s_samples);
        var[1][1][n] = variance(&t_samples);
        s_samples.clear();
        t_samples.clear();

        // Source uncached with dirty victims, destination cold then warm.
        for u in 0..self.bufs.len() {
            let Some(buf) = self.bufs[u].take() else {
                continue;
            };
            let src = &as_bytes(&buf)[..bytes];

            self.flusher.flush();
            full_fence();
            self.flusher.dirty(DIRTY_BYTES);
            let s = {
                let dst = &mut as_bytes_mut(&mut self.write_buf)[..bytes];
                let start = ticks_fenced();
                copy_buffer(dst, src);
                ticks_fenced()
                    .wrapping_sub(start)
                    .saturating_sub(self.tick_overhead)
            };

            s_samples.push(s);
            self.bufs[u] = Some(buf);
        }
        mean[2][2][n] = s_samples.iter().sum::<u64>() / count;
        var[2][2][n] = variance(&s_samples);
        s_samples.clear();

        for u in 0..self.bufs.len() {
            let Some(buf) = self.bufs[u].take() else {
                continue;
            };
            let src = &as_bytes(&buf)[..bytes];

            self.flusher.flush();
            full_fence();
            self.flusher.dirty(DIRTY_BYTES);
            read_buffer(&as_bytes(&self.write_buf)[..bytes]);
            let s = {
                let dst = &mut as_bytes_mut(&mut self.write_buf)[..bytes];
                let start = ticks_fenced();
                copy_buffer(dst, src);
                ticks_fenced()
                    .wrapping_sub(start)
                    .saturating_sub(self.tick_overhead)
            };

            s_samples.push(s);
            self.bufs[u] = Some(buf);
        }
        mean[2][1][n] = s_samples.iter().sum::<u64>() / count;
        var[2][1][n] = variance(&s_samples);
    }

    /// Mean uncached read cost of `bytes` bytes, for the row-width sweep.
    fn uncached_read_mean(&mut self, bytes: usize) -> u64 {
        let mut total = 0u64;
        for slot in self.bufs.iter().flatten() {
            let region = &as_bytes(slot)[..bytes];
            self.flusher.flush();
            load_fence();
            total += self.timed(|| read_buffer(region));
        }
        total / self.count as u64
    }

    /// Re-run the copy scenarios and score the freshly derived classifiers
    /// against the known ground truth of each staging.
    fn accuracy_check(&mut self, table: &CalibrationTable) -> AccuracyTable {
        use crate::model::{classify_read, classify_write};

        let mut read_ok = [[[0u64; SECTORS_MAX + 1]; 3]; 3];
        let mut write_ok = [[[0u64; SECTORS_MAX + 1]; 3]; 3];

        for n in 1..=SECTORS_MAX {
            // Scenario (src, dst, src_cached, dst_cached) per measurement;
            // the staging mirrors the measurement pass, only the scoring
            // differs.
            let scenarios: [(usize, usize, bool, bool); 8] = [
                (0, 0, false, false),
                (1, 0, true, false),
                (0, 2, false, false),
                (1, 2, true, false),
                (0, 1, false, true),
                (1, 1, true, true),
                (2, 2, false, false),
                (2, 1, false, true),
            ];

            for &(src_state, dst_state, src_cached, dst_cached) in &scenarios {
                for u in 0..self.bufs.len() {
                    let Some(buf) = self.bufs[u].take() else {
                        continue;
                    };
                    let bytes = n * SECTOR_SIZE;
                    let src = &as_bytes(&buf)[..bytes];

                    self.flusher.flush();
                    full_fence();
                    if dst_state == 2 || src_state == 2 {
                        self.flusher.dirty(DIRTY_BYTES);
                    }
                    if dst_cached {
                        read_buffer(&as_bytes(&self.write_buf)[..bytes]);
                    }
                    if src_cached {
                        read_buffer(src);
                    }

                    let t = {
                        let dst = &mut as_bytes_mut(&mut self.write_buf)[..bytes];
                        let start = ticks_fenced();
                        copy_buffer(dst, src);
                        ticks_fenced().wrapping_sub(start)
                    };
                    self.bufs[u] = Some(buf);

                    if classify_read(table, n, t) == src_cached {
                        read_ok[src_state][dst_state][n] += 1;
                    }
                    if classify_write(table, n, t) == dst_cached {
                        write_ok[src_state][dst_state][n] += 1;
                    }
                }
            }
        }

        AccuracyTable {
            read_ok,
            write_ok,
            trials: self.count,
        }
    }
}

fn rows_monotonic(row: &PerSector) -> bool {
    for n in 1..=SECTORS_MAX {
        if row[n] == 0 {
            return false;
        }
    }
    for n in 2..=SECTORS_MAX {
        if row[n - 1] >= row[n] {
            return false;
        }
    }
    true
}

/// Run the full calibration and produce the frozen table.
///
/// Allocation failures for individual trial buffers degrade the trial count;
/// only a total failure is an error. A table that never passes the
/// monotonicity sanity check is kept and logged, never rejected.
pub fn calibrate(cfg: &CalibrationConfig) -> Result<CalibrationTable, PcmError> {
    if let Some(cpu) = cfg.pin_cpu {
        if pin_to_cpu(cpu) {
            log::debug!("calibration pinned to cpu {cpu}");
        } else {
            log::warn!("could not pin calibration to cpu {cpu}; expect noisier tables");
        }
    }

    let tick_overhead = measure_tick_overhead();
    let cpu_khz = estimate_cpu_khz();
    let mut bus = BusParams::detect(cpu_khz);

    // Trial buffers; individual failures shrink the trial count.
    let words = BUFFER_BYTES / 8;
    let mut bufs = Vec::with_capacity(cfg.max_buffers);
    let mut count = 0u32;
    for _ in 0..cfg.max_buffers {
        match try_alloc_words(words, "calibration trial buffer") {
            Ok(v) => {
                count += 1;
                bufs.push(Some(v));
            }
            Err(_) => bufs.push(None),
        }
    }
    if count == 0 {
        return Err(PcmError::AllocationFailed {
            what: "calibration trial buffers",
            bytes: BUFFER_BYTES,
        });
    }
    if (count as usize) < cfg.max_buffers {
        log::warn!(
            "calibrating in degraded mode: {count} of {} trial buffers",
            cfg.max_buffers
        );
    }

    let write_buf = try_alloc_words(words, "calibration write buffer")?;
    let flusher = CacheFlusher::allocate()?;

    let mut cal = Calibrator {
        tick_overhead,
        bufs,
        write_buf,
        flusher,
        count,
    };

    let (threshold_l2, mean_probe_cached, mean_probe_uncached) = cal.probe_threshold()?;

    let (overhead_read, var_read, read_ok) = cal.read_overheads();
    if !read_ok {
        log::warn!(
            "{}",
            PcmError::CalibrationInconsistent {
                passes: SECTORS_MAX + 1
            }
        );
    }

    let (overhead_copy, var_copy, copy_ok) = cal.copy_overheads();
    if !copy_ok {
        log::warn!(
            "{}",
            PcmError::CalibrationInconsistent {
                passes: SECTORS_MAX + 1
            }
        );
    }

    let mut threshold_read_cached = [0u64; SECTORS_MAX + 1];
    let mut threshold_read_cb_lo = [0u64; SECTORS_MAX + 1];
    let mut threshold_read_cb_hi = [0u64; SECTORS_MAX + 1];
    let mut threshold_write_cached = [[0u64; SECTORS_MAX + 1]; 2];
    let mut threshold_write_lo = [0u64; SECTORS_MAX + 1];
    for n in 1..=SECTORS_MAX {
        let t = derive_thresholds(&overhead_copy, n);
        threshold_read_cached[n] = t.read_cached;
        threshold_read_cb_lo[n] = t.cb_lo;
        threshold_read_cb_hi[n] = t.cb_hi;
        threshold_write_cached[0][n] = t.write_cached[0];
        threshold_write_cached[1][n] = t.write_cached[1];
        threshold_write_lo[n] = t.write_lo;
    }

    bus.row_width = detect_row_width(|bytes| cal.uncached_read_mean(bytes), &bus);

    let mut table = CalibrationTable {
        tick_overhead,
        threshold_l2,
        mean_probe_cached,
        mean_probe_uncached,
        trials: cal.count,
        bus,
        overhead_read,
        var_read,
        overhead_copy,
        var_copy,
        threshold_read_cached,
        threshold_read_cb_lo,
        threshold_read_cb_hi,
        threshold_write_cached,
        threshold_write_lo,
        accuracy: None,
    };

    if cfg.check_accuracy {
        table.accuracy = Some(cal.accuracy_check(&table));
    }

    log::info!(
        "calibrated: {} trials, tick overhead {} cycles, row width {} bytes, bus scale {}",
        table.trials,
        table.tick_overhead,
        table.bus.row_width,
        table.bus.bus_scale
    );

    Ok(table)
}

// ---------------------------------------------------------------------------
// Synthetic tables
// ---------------------------------------------------------------------------

impl CalibrationTable {
    /// Deterministic table for tests and offline experiments.
    ///
    /// Overheads grow linearly in the sector count with the natural scenario
    /// ordering (cached fastest, uncached-with-writeback slowest), so every
    /// derived threshold sits between well-separated region centers. The bus
    /// models a 2 GHz CPU on a 333 MHz DDR2 bus with 128-byte rows.
    pub fn synthetic() -> Self {
        let mut overhead_read = [[0u64; SECTORS_MAX + 1]; 2];
        let mut overhead_copy = [[[0u64; SECTORS_MAX + 1]; 3]; 3];
        let var_read = [[100.0; SECTORS_MAX + 1]; 2];
        let var_copy = [[[100.0; SECTORS_MAX + 1]; 3]; 3];

        for n in 1..=SECTORS_MAX {
            let n64 = n as u64;
            overhead_read[0][n] = 700 * n64;
            overhead_read[1][n] = 100 * n64;

            overhead_copy[1][1][n] = 200 * n64;
            overhead_copy[1][0][n] = 300 * n64;
            overhead_copy[0][1][n] = 500 * n64;
            overhead_copy[2][1][n] = 550 * n64;
            overhead_copy[1][2][n] = 700 * n64;
            overhead_copy[0][0][n] = 800 * n64;
            overhead_copy[0][2][n] = 1000 * n64;
            overhead_copy[2][2][n] = 1100 * n64;
        }

        let mut threshold_read_cached = [0u64; SECTORS_MAX + 1];
        let mut threshold_read_cb_lo = [0u64; SECTORS_MAX + 1];
        let mut threshold_read_cb_hi = [0u64; SECTORS_MAX + 1];
        let mut threshold_write_cached = [[0u64; SECTORS_MAX + 1]; 2];
        let mut threshold_write_lo = [0u64; SECTORS_MAX + 1];
        for n in 1..=SECTORS_MAX {
            let t = derive_thresholds(&overhead_copy, n);
            threshold_read_cached[n] = t.read_cached;
            threshold_read_cb_lo[n] = t.cb_lo;
            threshold_read_cb_hi[n] = t.cb_hi;
            threshold_write_cached[0][n] = t.write_cached[0];
            threshold_write_cached[1][n] = t.write_cached[1];
            threshold_write_lo[n] = t.write_lo;
        }

        let cpu_khz = 2_000_000;
        Self {
            tick_overhead: 40,
            threshold_l2: 800,
            mean_probe_cached: 300,
            mean_probe_uncached: 1900,
            trials: 100,
            bus: BusParams {
                ddr_version: 2,
                ddr_rating: 667,
                bus_mhz: 333,
                bus_scale: 6,
                row_width: 128,
                t_rcd: 5,
                t_rp: 5,
                t_cl10: 50,
                cpu_khz,
            },
            overhead_read,
            var_read,
            overhead_copy,
            var_copy,
            threshold_read_cached,
            threshold_read_cb_lo,
            threshold_read_cb_hi,
            threshold_write_cached,
            threshold_write_lo,
            accuracy: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

impl fmt::Display for CalibrationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "  Memory Settings")?;
        writeln!(f, "-------------------")?;
        writeln!(f)?;
        writeln!(f, "Memory Bus    : {}", self.bus.bus_name())?;
        writeln!(f, "Memory Width  : {:4} bytes", self.bus.row_width)?;
        writeln!(f, "Bus Frequency : {:4} MHz", self.bus.bus_mhz)?;
        writeln!(f, "Scaling Factor: {:4}", self.bus.bus_scale)?;
        writeln!(f)?;
        writeln!(f, "tRCD          : {:4} bus cycles", self.bus.t_rcd)?;
        writeln!(f, "tRP           : {:4} bus cycles", self.bus.t_rp)?;
        writeln!(f)?;
        writeln!(f, "  Calibration Report")?;
        writeln!(f, "----------------------")?;
        writeln!(f)?;
        writeln!(f, "CPU Frequency : {:4} MHz", self.bus.cpu_khz / 1000)?;
        writeln!(f, "Num. of trials: {:4} trials", self.trials)?;
        writeln!(f, "Tick read     : {:4} cycles", self.tick_overhead)?;
        writeln!(f)?;
        writeln!(f, "Cached probe  : {:4} cycles", self.mean_probe_cached)?;
        writeln!(f, "Uncached probe: {:4} cycles", self.mean_probe_uncached)?;
        writeln!(f)?;

        writeln!(f, "Memory Access")?;
        writeln!(
            f,
            "                 rUwU    rUwC      rU    rCwU    rCwC      rC"
        )?;
        for n in 1..=SECTORS_MAX {
            writeln!(
                f,
                "{:4} sector{} {:8}{:8}{:8}{:8}{:8}{:8}",
                n,
                if n == 1 { " " } else { "s" },
                self.overhead_copy[0][0][n],
                self.overhead_copy[0][1][n],
                self.overhead_read[0][n],
                self.overhead_copy[1][0][n],
                self.overhead_copy[1][1][n],
                self.overhead_read[1][n],
            )?;
        }
        writeln!(f)?;
        writeln!(f, "                 rUwB    rCwB    rBwC    rBwB")?;
        for n in 1..=SECTORS_MAX {
            writeln!(
                f,
                "{:4} sector{} {:8}{:8}{:8}{:8}",
                n,
                if n == 1 { " " } else { "s" },
                self.overhead_copy[0][2][n],
                self.overhead_copy[1][2][n],
                self.overhead_copy[2][1][n],
                self.overhead_copy[2][2][n],
            )?;
        }
        writeln!(f)?;

        writeln!(f, "Memory Access - half-widths of 95% prediction intervals")?;
        writeln!(
            f,
            "                 rUwU    rUwC      rU    rCwU    rCwC      rC"
        )?;
        for n in 1..=SECTORS_MAX {
            writeln!(
                f,
                "{:4} sector{} {:8}{:8}{:8}{:8}{:8}{:8}",
                n,
                if n == 1 { " " } else { "s" },
                hw95pi(self.var_copy[0][0][n], self.trials),
                hw95pi(self.var_copy[0][1][n], self.trials),
                hw95pi(self.var_read[0][n], self.trials),
                hw95pi(self.var_copy[1][0][n], self.trials),
                hw95pi(self.var_copy[1][1][n], self.trials),
                hw95pi(self.var_read[1][n], self.trials),
            )?;
        }
        writeln!(f)?;
        writeln!(f, "                 rUwB    rCwB    rBwC    rBwB")?;
        for n in 1..=SECTORS_MAX {
            writeln!(
                f,
                "{:4} sector{} {:8}{:8}{:8}{:8}",
                n,
                if n == 1 { " " } else { "s" },
                hw95pi(self.var_copy[0][2][n], self.trials),
                hw95pi(self.var_copy[1][2][n], self.trials),
                hw95pi(self.var_copy[2][1][n], self.trials),
                hw95pi(self.var_copy[2][2][n], self.trials),
            )?;
        }
        writeln!(f)?;

        writeln!(f, "Memory Read is Cached if:")?;
        for n in 1..=SECTORS_MAX {
            writeln!(
                f,
                "{:4} sector{}     T < {:4} or (T > {:4} and T < {:4})",
                n,
                if n == 1 { " " } else { "s" },
                self.threshold_read_cached[n],
                self.threshold_read_cb_lo[n],
                self.threshold_read_cb_hi[n],
            )?;
        }
        writeln!(f)?;
        writeln!(f, "Memory Write to a Cached Region if:")?;
        for n in 1..=SECTORS_MAX {
            writeln!(
                f,
                "{:4} sector{}     T < {:4} or (T > {:4} and T < {:4})",
                n,
                if n == 1 { " " } else { "s" },
                self.threshold_write_cached[1][n],
                self.threshold_write_lo[n],
                self.threshold_write_cached[0][n],
            )?;
        }

        if let Some(acc) = &self.accuracy {
            writeln!(f)?;
            writeln!(f, "Memory Reads - Accuracy (max = {})", acc.trials)?;
            writeln!(f, "                 rUwU    rUwC    rCwU    rCwC")?;
            for n in 1..=SECTORS_MAX {
                writeln!(
                    f,
                    "{:4} sector{} {:8}{:8}{:8}{:8}",
                    n,
                    if n == 1 { " " } else { "s" },
                    acc.read_ok[0][0][n],
                    acc.read_ok[0][1][n],
                    acc.read_ok[1][0][n],
                    acc.read_ok[1][1][n],
                )?;
            }
            writeln!(f)?;
            writeln!(f, "                 rUwB    rCwB    rBwC    rBwB")?;
            for n in 1..=SECTORS_MAX {
                writeln!(
                    f,
                    "{:4} sector{} {:8}{:8}{:8}{:8}",
                    n,
                    if n == 1 { " " } else { "s" },
                    acc.read_ok[0][2][n],
                    acc.read_ok[1][2][n],
                    acc.read_ok[2][1][n],
                    acc.read_ok[2][2][n],
                )?;
            }
            writeln!(f)?;
            writeln!(f, "Memory Writes - Accuracy (max = {})", acc.trials)?;
            writeln!(f, "                 rUwU    rUwC    rCwU    rCwC")?;
            for n in 1..=SECTORS_MAX {
                writeln!(
                    f,
                    "{:4} sector{} {:8}{:8}{:8}{:8}",
                    n,
                    if n == 1 { " " } else { "s" },
                    acc.write_ok[0][0][n],
                    acc.write_ok[0][1][n],
                    acc.write_ok[1][0][n],
                    acc.write_ok[1][1][n],
                )?;
            }
            writeln!(f)?;
            writeln!(f, "                 rUwB    rCwB    rBwC    rBwB")?;
            for n in 1..=SECTORS_MAX {
                writeln!(
                    f,
                    "{:4} sector{} {:8}{:8}{:8}{:8}",
                    n,
                    if n == 1 { " " } else { "s" },
                    acc.write_ok[0][2][n],
                    acc.write_ok[1][2][n],
                    acc.write_ok[2][1][n],
                    acc.write_ok[2][2][n],
                )?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_pow2_rounds_to_nearest() {
        assert_eq!(round_pow2(1), 1);
        assert_eq!(round_pow2(2), 2);
        assert_eq!(round_pow2(3), 4);
        assert_eq!(round_pow2(5), 4);
        assert_eq!(round_pow2(6), 8);
        assert_eq!(round_pow2(96), 128);
        assert_eq!(round_pow2(127), 128);
        assert_eq!(round_pow2(128), 128);
        assert_eq!(round_pow2(160), 128);
        assert_eq!(round_pow2(200), 256);
    }

    #[test]
    fn variance_of_constant_is_zero() {
        assert_eq!(variance(&[5, 5, 5, 5]), 0.0);
    }

    #[test]
    fn variance_matches_hand_computation() {
        // Samples 2, 4, 4, 4, 5, 5, 7, 9: mean 5, ss 32, var 32/7.
        let v = variance(&[2, 4, 4, 4, 5, 5, 7, 9]);
        assert!((v - 32.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn hw95pi_is_monotone_in_variance() {
        assert!(hw95pi(100.0, 95) < hw95pi(400.0, 95));
        assert_eq!(hw95pi(0.0, 95), 0);
    }

    #[test]
    fn bus_scale_rounds_half_up() {
        // 2 GHz on a 333 MHz bus: 6.006 -> 6.
        let bus = BusParams::detect(2_000_000);
        if cfg!(target_pointer_width = "64") {
            assert_eq!(bus.bus_mhz, 333);
            assert_eq!(bus.bus_scale, 6);
        }
    }

    #[test]
    fn thresholds_natural_ordering() {
        let table = CalibrationTable::synthetic();
        for n in 1..=SECTORS_MAX {
            let n64 = n as u64;
            assert_eq!(table.threshold_read_cached[n], 400 * n64);
            assert_eq!(table.threshold_read_cb_lo[n], 600 * n64);
            assert_eq!(table.threshold_read_cb_hi[n], 750 * n64);
            assert_eq!(table.threshold_write_cached[1][n], 250 * n64);
            assert_eq!(table.threshold_write_cached[0][n], 650 * n64);
            assert_eq!(table.threshold_write_lo[n], 400 * n64);
        }
    }

    #[test]
    fn thresholds_writeback_above_uncached() {
        // oc[1][2] > oc[0][0]: the cached band loses its upper edge.
        let mut oc = CalibrationTable::synthetic().overhead_copy;
        for n in 1..=SECTORS_MAX {
            oc[1][2][n] = 900 * n as u64;
        }
        let t = derive_thresholds(&oc, 2);
        assert_eq!(t.cb_lo, (800 * 2 + 900 * 2) / 2);
        assert_eq!(t.cb_hi, CB_UNBOUNDED);
    }

    #[test]
    fn thresholds_writeback_below_cached_destination() {
        // oc[1][2] < oc[0][1]: the cached band starts at zero.
        let mut oc = CalibrationTable::synthetic().overhead_copy;
        for n in 1..=SECTORS_MAX {
            oc[1][2][n] = 400 * n as u64;
            oc[2][1][n] = 300 * n as u64;
        }
        let t = derive_thresholds(&oc, 3);
        assert_eq!(t.cb_lo, 0);
        assert_eq!(t.cb_hi, (500 * 3 + 400 * 3) / 2);
        assert_eq!(t.write_lo, (500 * 3 + 400 * 3) / 2);
    }

    #[test]
    fn thresholds_writeback_between() {
        // oc[1][2] < oc[2][1] < oc[0][1]: the last corner case wins.
        let mut oc = CalibrationTable::synthetic().overhead_copy;
        for n in 1..=SECTORS_MAX {
            oc[1][2][n] = 350 * n as u64;
            oc[2][1][n] = 450 * n as u64;
        }
        let t = derive_thresholds(&oc, 4);
        assert_eq!(t.cb_lo, 0);
        assert_eq!(t.cb_hi, (450 * 4 + 350 * 4) / 2);
        assert_eq!(t.write_lo, (450 * 4 + 350 * 4) / 2);
        assert_eq!(t.write_cached[0], (800 * 4 + 500 * 4) / 2);
    }

    #[test]
    fn detect_row_width_128_byte_rows() {
        // Synthetic probe: transfer takes 16 bytes per bus cycle, plus one
        // row switch per 128 bytes at tRCD + tRP + ceil(tCL) - 1 cycles.
        let bus = CalibrationTable::synthetic().bus;
        let switch = (bus.t_rcd + bus.t_rp + bus.t_cl10.div_ceil(10) - 1) as u64;
        let probe = |bytes: usize| {
            let bus_cycles = bytes as u64 / 16 + (bytes as u64 / 128) * switch;
            bus_cycles * bus.bus_scale
        };
        assert_eq!(detect_row_width(probe, &bus), 128);
    }

    #[test]
    fn detect_row_width_256_byte_rows() {
        let bus = CalibrationTable::synthetic().bus;
        let switch = (bus.t_rcd + bus.t_rp + bus.t_cl10.div_ceil(10) - 1) as u64;
        let probe = |bytes: usize| {
            let bus_cycles = bytes as u64 / 16 + (bytes as u64 / 256) * switch;
            bus_cycles * bus.bus_scale
        };
        assert_eq!(detect_row_width(probe, &bus), 256);
    }

    #[test]
    fn synthetic_table_report_renders() {
        let table = CalibrationTable::synthetic();
        let report = table.to_string();
        assert!(report.contains("Memory Bus    : DDR2-667"));
        assert!(report.contains("Memory Read is Cached if:"));
        assert!(report.contains("Scaling Factor:    6"));
    }

    #[test]
    fn table_serde_round_trip() {
        let table = CalibrationTable::synthetic();
        let json = serde_json::to_string(&table).unwrap();
        let back: CalibrationTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tick_overhead, table.tick_overhead);
        assert_eq!(back.threshold_read_cached, table.threshold_read_cached);
        assert_eq!(back.bus, table.bus);
        assert_eq!(back.overhead_copy[1][2], table.overhead_copy[1][2]);
    }
}
