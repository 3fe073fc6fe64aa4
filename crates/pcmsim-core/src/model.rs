//! PCM latency model.
//!
//! Takes the calibrated DRAM table and extrapolates what each aligned
//! n-sector operation *should* cost on PCM, using published PCM
//! row-activation (`tRCD`) and precharge (`tRP`) parameters scaled to the
//! measured bus frequency. The difference between the PCM cost and the
//! measured uncached DRAM cost is the per-sector delta the stall loop adds
//! to the cycle budget.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::calibration::{CalibrationTable, SECTOR_SIZE, SECTORS_MAX};

/// PCM operation kind, used to index the latency tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Read,
    Write,
}

impl Op {
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Op::Read => 0,
            Op::Write => 1,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Read => write!(f, "read"),
            Op::Write => write!(f, "write"),
        }
    }
}

/// Published PCM part parameters, prior to bus-frequency scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcmParams {
    /// Row activate time in bus cycles of the original part.
    ///
    /// **Default:** `22`
    pub org_t_rcd: u32,

    /// Row precharge time in bus cycles of the original part.
    ///
    /// **Default:** `60`
    pub org_t_rp: u32,

    /// Bus frequency the original part was specified at, in MHz.
    ///
    /// **Default:** `400`
    pub org_mhz: u32,

    /// PCM logical row width in bytes.
    ///
    /// **Default:** `256`
    pub row_width: u32,
}

impl Default for PcmParams {
    fn default() -> Self {
        Self {
            org_t_rcd: 22,
            org_t_rp: 60,
            org_mhz: 400,
            row_width: 256,
        }
    }
}

/// Scale a part parameter to the measured bus frequency, rounding half-up
/// in tenths of a bus cycle.
fn scale_to_bus(org: u32, bus_mhz: u32, org_mhz: u32) -> u32 {
    let mut v10 = 10 * org * bus_mhz / org_mhz;
    if v10 % 10 >= 5 {
        v10 += 10;
    }
    v10 / 10
}

/// Derived PCM timing tables, frozen after construction.
///
/// Owns its calibration table so a single `Arc<PcmTimings>` carries
/// everything a device needs: classifier thresholds, tick overhead, and the
/// per-sector deltas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcmTimings {
    pub table: CalibrationTable,
    pub params: PcmParams,
    /// PCM activate/precharge times scaled to the measured bus.
    pub pcm_t_rcd: u32,
    pub pcm_t_rp: u32,
    /// Full CPU-cycle cost of an aligned n-sector operation on PCM.
    pub latency: [[u64; SECTORS_MAX + 1]; 2],
    /// Cycles to add on top of the native uncached copy.
    pub latency_delta: [[i64; SECTORS_MAX + 1]; 2],
}

impl PcmTimings {
    /// Compute the PCM latency tables from a calibrated DRAM table.
    pub fn derive(table: CalibrationTable, params: PcmParams) -> Self {
        let bus = &table.bus;
        let pcm_t_rcd = scale_to_bus(params.org_t_rcd, bus.bus_mhz, params.org_mhz);
        let pcm_t_rp = scale_to_bus(params.org_t_rp, bus.bus_mhz, params.org_mhz);

        let mut latency = [[0u64; SECTORS_MAX + 1]; 2];
        let mut latency_delta = [[0i64; SECTORS_MAX + 1]; 2];

        for n in 1..=SECTORS_MAX {
            let bytes = (n * SECTOR_SIZE) as i64;
            let mem_rows = bytes / bus.row_width as i64;
            let pcm_rows = bytes / params.row_width as i64;

            let mem_t = table.overhead_read[0][n] as i64;
            let d_read = pcm_rows * pcm_t_rcd as i64 - mem_rows * bus.t_rcd as i64;
            let d_write = pcm_rows * pcm_t_rp as i64 - mem_rows * bus.t_rp as i64;

            let lat_read = (mem_t + d_read * bus.bus_scale as i64).max(0);
            let lat_write = (mem_t + d_write * bus.bus_scale as i64).max(0);

            latency[Op::Read.index()][n] = lat_read as u64;
            latency[Op::Write.index()][n] = lat_write as u64;
            latency_delta[Op::Read.index()][n] = lat_read - mem_t;
            latency_delta[Op::Write.index()][n] = lat_write - mem_t;
        }

        // Design assumption: with PCM activation at least as slow as DRAM's,
        // no delta goes negative. Checked, not asserted.
        if pcm_t_rcd >= bus.t_rcd {
            for n in 1..=SECTORS_MAX {
                for op in [Op::Read, Op::Write] {
                    let d = latency_delta[op.index()][n];
                    if d < 0 {
                        log::warn!("negative pcm {op} delta {d} at {n} sectors");
                    }
                }
            }
        }

        Self {
            table,
            params,
            pcm_t_rcd,
            pcm_t_rp,
            latency,
            latency_delta,
        }
    }

    #[inline]
    pub fn delta(&self, op: Op, sectors: usize) -> i64 {
        self.latency_delta[op.index()][sectors]
    }

    #[inline]
    pub fn tick_overhead(&self) -> u64 {
        self.table.tick_overhead
    }

    /// Persist the timing tables as JSON, for offline inspection or reuse
    /// across runs on the same host.
    pub fn save_json(&self, path: &std::path::Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Load previously saved timing tables.
    pub fn load_json(path: &std::path::Path) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(std::io::Error::other)
    }
}

// ---------------------------------------------------------------------------
// Copy-time classifiers
// ---------------------------------------------------------------------------

/// Was the *source* of an n-sector copy cached, judging by the copy time?
///
/// Fast copies read from cache; the band `(cb_lo, cb_hi)` catches cached
/// sources whose destination evictions paid a writeback.
#[inline]
pub fn classify_read(table: &CalibrationTable, sectors: usize, cycles: u64) -> bool {
    cycles < table.threshold_read_cached[sectors]
        || (cycles > table.threshold_read_cb_lo[sectors]
            && cycles < table.threshold_read_cb_hi[sectors])
}

/// Was the *destination* of an n-sector copy cached, judging by the copy
/// time?
///
/// Below the read threshold the source was cached and the destination state
/// splits at `threshold_write_cached[1]`; above it, cached destinations sit
/// in the band `(threshold_write_lo, threshold_write_cached[0])`.
#[inline]
pub fn classify_write(table: &CalibrationTable, sectors: usize, cycles: u64) -> bool {
    if cycles < table.threshold_read_cached[sectors] {
        cycles < table.threshold_write_cached[1][sectors]
    } else {
        cycles > table.threshold_write_lo[sectors]
            && cycles < table.threshold_write_cached[0][sectors]
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

impl fmt::Display for PcmTimings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "  PCM Settings")?;
        writeln!(f, "----------------")?;
        writeln!(f)?;
        writeln!(f, "tRCD          : {:4} bus cycles", self.pcm_t_rcd)?;
        writeln!(f, "tRP           : {:4} bus cycles", self.pcm_t_rp)?;
        writeln!(f)?;
        writeln!(f, "pcm")?;
        for n in 1..=SECTORS_MAX {
            writeln!(
                f,
                "{:4} sector{}  : {:5} cycles read, {:6} cycles write",
                n,
                if n == 1 { " " } else { "s" },
                self.latency[Op::Read.index()][n],
                self.latency[Op::Write.index()][n],
            )?;
        }
        writeln!(f)?;
        writeln!(f, "pcm delta")?;
        for n in 1..=SECTORS_MAX {
            writeln!(
                f,
                "{:4} sector{}  : {:5} cycles read, {:6} cycles write",
                n,
                if n == 1 { " " } else { "s" },
                self.latency_delta[Op::Read.index()][n],
                self.latency_delta[Op::Write.index()][n],
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_timings() -> PcmTimings {
        PcmTimings::derive(CalibrationTable::synthetic(), PcmParams::default())
    }

    #[test]
    fn scales_part_parameters_to_bus() {
        // 22 and 60 bus cycles at 400 MHz scale to a 333 MHz bus as
        // 18.31 -> 18 and 49.95 -> 50.
        let t = synthetic_timings();
        assert_eq!(t.pcm_t_rcd, 18);
        assert_eq!(t.pcm_t_rp, 50);
    }

    #[test]
    fn deltas_match_hand_computation() {
        // 128-byte memory rows, 256-byte PCM rows, bus scale 6:
        // d_read = 2n*18 - 4n*5 = 16n bus cycles -> 96n CPU cycles.
        // d_write = 2n*50 - 4n*5 = 80n bus cycles -> 480n CPU cycles.
        let t = synthetic_timings();
        for n in 1..=SECTORS_MAX {
            assert_eq!(t.delta(Op::Read, n), 96 * n as i64);
            assert_eq!(t.delta(Op::Write, n), 480 * n as i64);
            assert_eq!(
                t.latency[Op::Read.index()][n],
                t.table.overhead_read[0][n] + 96 * n as u64
            );
        }
    }

    #[test]
    fn latency_strictly_increasing_in_sector_count() {
        let t = synthetic_timings();
        for op in [Op::Read, Op::Write] {
            for n in 2..=SECTORS_MAX {
                assert!(
                    t.latency[op.index()][n] > t.latency[op.index()][n - 1],
                    "{op} latency not increasing at n = {n}"
                );
            }
        }
    }

    #[test]
    fn deltas_nonnegative_under_design_assumption() {
        let t = synthetic_timings();
        assert!(t.pcm_t_rcd >= t.table.bus.t_rcd);
        for op in [Op::Read, Op::Write] {
            for n in 1..=SECTORS_MAX {
                assert!(t.delta(op, n) >= 0);
            }
        }
    }

    #[test]
    fn read_classifier_around_threshold() {
        let table = CalibrationTable::synthetic();
        let edge = table.threshold_read_cached[1];
        assert!(classify_read(&table, 1, edge - 1));
        assert!(!classify_read(&table, 1, edge + 1));
    }

    #[test]
    fn read_classifier_region_centers() {
        let table = CalibrationTable::synthetic();
        for n in 1..=SECTORS_MAX {
            let oc = &table.overhead_copy;
            // Cached-source centers, including the writeback band.
            assert!(classify_read(&table, n, oc[1][0][n]));
            assert!(classify_read(&table, n, oc[1][1][n]));
            assert!(classify_read(&table, n, oc[1][2][n]));
            // Uncached-source centers.
            assert!(!classify_read(&table, n, oc[0][0][n]));
            assert!(!classify_read(&table, n, oc[0][1][n]));
            assert!(!classify_read(&table, n, oc[0][2][n]));
            assert!(!classify_read(&table, n, oc[2][1][n]));
            assert!(!classify_read(&table, n, oc[2][2][n]));
        }
    }

    #[test]
    fn write_classifier_region_centers() {
        let table = CalibrationTable::synthetic();
        for n in 1..=SECTORS_MAX {
            let oc = &table.overhead_copy;
            // Cached-destination centers.
            assert!(classify_write(&table, n, oc[1][1][n]));
            assert!(classify_write(&table, n, oc[0][1][n]));
            assert!(classify_write(&table, n, oc[2][1][n]));
            // Uncached and writeback destination centers.
            assert!(!classify_write(&table, n, oc[1][0][n]));
            assert!(!classify_write(&table, n, oc[0][0][n]));
            assert!(!classify_write(&table, n, oc[1][2][n]));
            assert!(!classify_write(&table, n, oc[0][2][n]));
            assert!(!classify_write(&table, n, oc[2][2][n]));
        }
    }

    #[test]
    fn timings_serde_round_trip() {
        let t = synthetic_timings();
        let json = serde_json::to_string(&t).unwrap();
        let back: PcmTimings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pcm_t_rcd, t.pcm_t_rcd);
        assert_eq!(back.latency_delta, t.latency_delta);
    }

    #[test]
    fn timings_file_round_trip() {
        let t = synthetic_timings();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timings.json");
        t.save_json(&path).unwrap();
        let back = PcmTimings::load_json(&path).unwrap();
        assert_eq!(back.latency, t.latency);
        assert_eq!(back.table.threshold_read_cached, t.table.threshold_read_cached);
    }
}
