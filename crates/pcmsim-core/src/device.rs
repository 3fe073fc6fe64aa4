//! Per-device PCM state and the stall loops.
//!
//! A [`PcmDevice`] owns a RAM backing store, a per-sector dirty bitmap, a
//! signed cycle budget, and cached/uncached hit counters, all behind one
//! mutex. Every aligned chunk transfer runs the same sequence: copy through
//! DRAM, classify the measured copy time, add the PCM delta to the budget
//! when the operation must pay the full penalty, then spin on the raw tick
//! counter until the budget is drained.
//!
//! The drain is a busy wait on purpose. Sleeping or yielding would put the
//! scheduler between the caller and the modeled device and destroy the
//! cycle-level latency the budget encodes. Because the budget carries
//! residue across requests, a request arriving while debt is outstanding
//! pays the remainder first, which is exactly how a bandwidth-limited part
//! behaves.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::bitmap::DirtyBitmap;
use crate::calibration::{SECTOR_SIZE, SECTORS_MAX};
use crate::error::PcmError;
use crate::memops::{copy_buffer, was_cached};
use crate::model::{Op, PcmTimings, classify_read, classify_write};
use crate::ticks::ticks_raw;

/// 512-byte sectors per megabyte of capacity.
pub const SECTORS_PER_MB: u64 = 2048;

/// Default per-device capacity in megabytes.
pub fn default_capacity_mb() -> u32 {
    if cfg!(target_pointer_width = "64") {
        1024
    } else {
        128
    }
}

// ---------------------------------------------------------------------------
// Options and statistics
// ---------------------------------------------------------------------------

/// Runtime switches for the stall loop, the userspace rendition of the
/// reference's compile-time knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimOptions {
    /// Skip classification entirely; every transfer pays the PCM delta.
    pub ignore_l2: bool,
    /// Replace the time classifier with a direct cache probe and skip the
    /// stall, for measuring classifier agreement against ground truth.
    pub ground_truth: bool,
}

/// Snapshot of a device's counters, indexed by `cached?`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub reads: [u64; 2],
    pub writes: [u64; 2],
    pub budget: i64,
}

impl DeviceStats {
    pub fn total_reads(&self) -> u64 {
        self.reads[0] + self.reads[1]
    }

    pub fn total_writes(&self) -> u64 {
        self.writes[0] + self.writes[1]
    }

    fn permyriad(cached: u64, total: u64) -> u64 {
        if total == 0 { 0 } else { 10_000 * cached / total }
    }
}

impl fmt::Display for DeviceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = Self::permyriad(self.reads[1], self.total_reads());
        let w = Self::permyriad(self.writes[1], self.total_writes());
        writeln!(f)?;
        writeln!(f, "  Device Statistics")?;
        writeln!(f, "---------------------")?;
        writeln!(f)?;
        writeln!(
            f,
            "Reads         : {:6} ({:2}.{:02}% cached)",
            self.total_reads(),
            r / 100,
            r % 100
        )?;
        writeln!(
            f,
            "Writes        : {:6} ({:2}.{:02}% cached)",
            self.total_writes(),
            w / 100,
            w % 100
        )
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

struct DeviceInner {
    backing: Vec<u8>,
    dirty: DirtyBitmap,
    budget: i64,
    stat_reads: [u64; 2],
    stat_writes: [u64; 2],
}

/// One simulated PCM disk.
pub struct PcmDevice {
    index: u32,
    capacity_sectors: u64,
    timings: Arc<PcmTimings>,
    opts: SimOptions,
    inner: Mutex<DeviceInner>,
}

impl PcmDevice {
    /// Allocate a device of `capacity_mb` megabytes.
    ///
    /// Counters and the dirty bitmap start zeroed. The backing store is
    /// zero-filled; callers must treat pre-write contents as arbitrary, as
    /// on a freshly powered part.
    pub fn allocate(
        index: u32,
        capacity_mb: u32,
        timings: Arc<PcmTimings>,
        opts: SimOptions,
    ) -> Result<Self, PcmError> {
        let capacity_sectors = capacity_mb as u64 * SECTORS_PER_MB;
        let bytes = capacity_sectors as usize * SECTOR_SIZE;

        let mut backing = Vec::new();
        backing
            .try_reserve_exact(bytes)
            .map_err(|_| PcmError::AllocationFailed {
                what: "device backing store",
                bytes,
            })?;
        backing.resize(bytes, 0);

        Ok(Self {
            index,
            capacity_sectors,
            timings,
            opts,
            inner: Mutex::new(DeviceInner {
                backing,
                dirty: DirtyBitmap::new(capacity_sectors),
                budget: 0,
                stat_reads: [0; 2],
                stat_writes: [0; 2],
            }),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Device name, `pcm<index>`.
    pub fn name(&self) -> String {
        format!("pcm{}", self.index)
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    pub fn timings(&self) -> &Arc<PcmTimings> {
        &self.timings
    }

    pub fn options(&self) -> SimOptions {
        self.opts
    }

    /// Counter snapshot.
    pub fn stats(&self) -> DeviceStats {
        let inner = self.inner.lock().unwrap();
        DeviceStats {
            reads: inner.stat_reads,
            writes: inner.stat_writes,
            budget: inner.budget,
        }
    }

    /// Dirty-bit snapshot for one sector.
    pub fn is_dirty(&self, sector: u64) -> bool {
        self.inner.lock().unwrap().dirty.get(sector)
    }

    /// Read one aligned chunk of at most [`SECTORS_MAX`] sectors.
    ///
    /// Runs the full stall loop under the device lock. The dispatcher
    /// guarantees alignment and bounds.
    pub(crate) fn read_chunk(&self, dst: &mut [u8], sector: u64) {
        let n = dst.len() / SECTOR_SIZE;
        debug_assert!(n >= 1 && n <= SECTORS_MAX);
        debug_assert_eq!(dst.len() % SECTOR_SIZE, 0);

        let off = sector as usize * SECTOR_SIZE;
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let src = &inner.backing[off..off + dst.len()];

        if self.opts.ground_truth {
            let cached = was_cached(src, self.timings.table.threshold_l2);
            copy_buffer(dst, src);
            inner.account_read_classified(&self.timings, n, sector, cached);
            return; // no stall when measuring ground truth
        }

        if self.opts.ignore_l2 {
            copy_buffer(dst, src);
            let after = ticks_raw();
            inner.budget += self.timings.delta(Op::Read, n);
            inner.drain(self.timings.tick_overhead(), after);
            return;
        }

        let before = ticks_raw();
        copy_buffer(dst, src); // ends in a full fence
        let after = ticks_raw();
        let elapsed = after.saturating_sub(before);

        inner.account_read(&self.timings, n, sector, elapsed);
        inner.drain(self.timings.tick_overhead(), after);
    }

    /// Write one aligned chunk of at most [`SECTORS_MAX`] sectors.
    pub(crate) fn write_chunk(&self, src: &[u8], sector: u64) {
        let n = src.len() / SECTOR_SIZE;
        debug_assert!(n >= 1 && n <= SECTORS_MAX);
        debug_assert_eq!(src.len() % SECTOR_SIZE, 0);

        let off = sector as usize * SECTOR_SIZE;
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        if self.opts.ground_truth {
            let cached = was_cached(
                &inner.backing[off..off + src.len()],
                self.timings.table.threshold_l2,
            );
            copy_buffer(&mut inner.backing[off..off + src.len()], src);
            inner.account_write_classified(&self.timings, n, sector, cached);
            return;
        }

        if self.opts.ignore_l2 {
            copy_buffer(&mut inner.backing[off..off + src.len()], src);
            let after = ticks_raw();
            inner.budget += self.timings.delta(Op::Write, n);
            inner.drain(self.timings.tick_overhead(), after);
            return;
        }

        let before = ticks_raw();
        copy_buffer(&mut inner.backing[off..off + src.len()], src);
        let after = ticks_raw();
        let elapsed = after.saturating_sub(before);

        inner.account_write(&self.timings, n, sector, elapsed);
        inner.drain(self.timings.tick_overhead(), after);
    }
}

impl Drop for PcmDevice {
    fn drop(&mut self) {
        // Skip the teardown report rather than panic on a poisoned lock.
        if let Ok(inner) = self.inner.lock() {
            let stats = DeviceStats {
                reads: inner.stat_reads,
                writes: inner.stat_writes,
                budget: inner.budget,
            };
            log::info!("{}: {}", self.name(), stats);
        }
    }
}

// ---------------------------------------------------------------------------
// Accounting and drain
// ---------------------------------------------------------------------------

impl DeviceInner {
    /// Classify a read's copy time, then account for it. Returns the billed
    /// delta.
    fn account_read(&mut self, timings: &PcmTimings, n: usize, sector: u64, cycles: u64) -> i64 {
        let cached = classify_read(&timings.table, n, cycles);
        self.account_read_classified(timings, n, sector, cached)
    }

    /// Account for a read with a known cache verdict.
    ///
    /// An uncached read pays the PCM read delta and clears the dirty bits of
    /// the sectors it pulled through DRAM.
    fn account_read_classified(
        &mut self,
        timings: &PcmTimings,
        n: usize,
        sector: u64,
        cached: bool,
    ) -> i64 {
        self.stat_reads[cached as usize] += 1;
        if cached {
            return 0;
        }
        let delta = timings.delta(Op::Read, n);
        self.budget += delta;
        self.dirty.clear_range(sector, n as u64);
        delta
    }

    /// Classify a write's copy time, then account for it. Returns the billed
    /// delta.
    fn account_write(&mut self, timings: &PcmTimings, n: usize, sector: u64, cycles: u64) -> i64 {
        let cached = classify_write(&timings.table, n, cycles);
        self.account_write_classified(timings, n, sector, cached)
    }

    /// Account for a write with a known cache verdict.
    ///
    /// The dirty bits are set unconditionally before billing. A write whose
    /// destination was cached *and* already dirty coalesces at both the
    /// cache and the storage level and is not billed.
    fn account_write_classified(
        &mut self,
        timings: &PcmTimings,
        n: usize,
        sector: u64,
        cached: bool,
    ) -> i64 {
        self.stat_writes[cached as usize] += 1;

        let was_dirty = self.dirty.get(sector);
        self.dirty.set_range(sector, n as u64);

        if cached && was_dirty {
            return 0;
        }
        let delta = timings.delta(Op::Write, n);
        self.budget += delta;
        delta
    }

    /// Busy-wait until the budget is spent.
    ///
    /// `after` is the raw tick read taken just past the copy, so the cycles
    /// between the copy and the loop entry are charged too. Negative tick
    /// deltas (CPU migration) count as zero rather than wrapping.
    fn drain(&mut self, tick_overhead: u64, after: u64) {
        let mut t = ticks_raw();
        self.budget -= t.saturating_sub(after) as i64;
        while self.budget >= tick_overhead as i64 {
            let now = ticks_raw();
            self.budget -= now.saturating_sub(t) as i64;
            t = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationTable;
    use crate::model::PcmParams;

    fn timings() -> Arc<PcmTimings> {
        Arc::new(PcmTimings::derive(
            CalibrationTable::synthetic(),
            PcmParams::default(),
        ))
    }

    fn device(capacity_mb: u32) -> PcmDevice {
        PcmDevice::allocate(0, capacity_mb, timings(), SimOptions::default()).unwrap()
    }

    #[test]
    fn allocate_sizes_and_zeroes() {
        let dev = device(1);
        assert_eq!(dev.capacity_sectors(), 2048);
        assert_eq!(dev.name(), "pcm0");
        assert_eq!(dev.stats(), DeviceStats::default());
        let mut buf = [0xFFu8; SECTOR_SIZE];
        dev.read_chunk(&mut buf, 0);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn chunk_round_trip() {
        let dev = device(1);
        let mut pattern = [0u8; SECTOR_SIZE];
        for (i, b) in pattern.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        dev.write_chunk(&pattern, 7);
        let mut back = [0u8; SECTOR_SIZE];
        dev.read_chunk(&mut back, 7);
        assert_eq!(back, pattern);
    }

    #[test]
    fn budget_drained_on_return() {
        let dev = device(1);
        let buf = [0xABu8; 4 * SECTOR_SIZE];
        for sector in [0, 64, 128, 192] {
            dev.write_chunk(&buf, sector);
        }
        let mut back = [0u8; 4 * SECTOR_SIZE];
        dev.read_chunk(&mut back, 64);
        let overhead = dev.timings().tick_overhead() as i64;
        assert!(
            dev.stats().budget <= overhead,
            "budget {} above tick overhead {overhead}",
            dev.stats().budget
        );
    }

    #[test]
    fn write_sets_dirty_bits_for_whole_chunk() {
        let dev = device(1);
        let buf = [1u8; 3 * SECTOR_SIZE];
        dev.write_chunk(&buf, 10);
        for sector in 10..13 {
            assert!(dev.is_dirty(sector), "sector {sector}");
        }
        assert!(!dev.is_dirty(9));
        assert!(!dev.is_dirty(13));
    }

    #[test]
    fn uncached_read_clears_dirty_cached_read_keeps_it() {
        let dev = device(1);
        let t = timings();
        let mut inner = dev.inner.lock().unwrap();

        // Write, injected at the cached-destination center.
        let billed = inner.account_write(&t, 2, 40, t.table.overhead_copy[0][1][2]);
        assert!(billed > 0, "first write to clean sectors is billed");
        assert!(inner.dirty.get(40) && inner.dirty.get(41));

        // Cached read: dirty bits unchanged.
        let billed = inner.account_read(&t, 2, 40, t.table.overhead_copy[1][0][2]);
        assert_eq!(billed, 0);
        assert!(inner.dirty.get(40) && inner.dirty.get(41));

        // Uncached read: billed, dirty bits cleared.
        let billed = inner.account_read(&t, 2, 40, t.table.overhead_copy[0][0][2]);
        assert_eq!(billed, t.delta(Op::Read, 2));
        assert!(!inner.dirty.get(40) && !inner.dirty.get(41));
    }

    #[test]
    fn cached_dirty_write_is_coalesced() {
        let dev = device(1);
        let t = timings();
        let mut inner = dev.inner.lock().unwrap();
        let cached_center = t.table.overhead_copy[1][1][1];

        // First write: destination cached but sector clean, so it is billed.
        let billed = inner.account_write(&t, 1, 5, cached_center);
        assert_eq!(billed, t.delta(Op::Write, 1));
        assert_eq!(inner.stat_writes, [0, 1]);

        // Second write: cached and dirty, coalesced.
        let billed = inner.account_write(&t, 1, 5, cached_center);
        assert_eq!(billed, 0);
        assert_eq!(inner.stat_writes, [0, 2]);

        // Uncached write to the same dirty sector still pays.
        let billed = inner.account_write(&t, 1, 5, t.table.overhead_copy[0][0][1]);
        assert_eq!(billed, t.delta(Op::Write, 1));
        assert_eq!(inner.stat_writes, [1, 2]);
    }

    #[test]
    fn ignore_l2_bills_every_transfer() {
        let opts = SimOptions {
            ignore_l2: true,
            ground_truth: false,
        };
        let dev = PcmDevice::allocate(1, 1, timings(), opts).unwrap();
        let buf = [0u8; SECTOR_SIZE];
        dev.write_chunk(&buf, 5);
        dev.write_chunk(&buf, 5);
        // Classification is skipped entirely, so no stats accumulate.
        let stats = dev.stats();
        assert_eq!(stats.total_writes(), 0);
        assert!(!dev.is_dirty(5));
    }

    #[test]
    fn stats_count_by_verdict() {
        let dev = device(1);
        let t = timings();
        let mut inner = dev.inner.lock().unwrap();
        inner.account_read(&t, 1, 0, t.table.overhead_copy[1][0][1]);
        inner.account_read(&t, 1, 0, t.table.overhead_copy[0][0][1]);
        inner.account_read(&t, 1, 0, t.table.overhead_copy[0][1][1]);
        assert_eq!(inner.stat_reads, [2, 1]);
    }

    #[test]
    fn stats_display_formats_percentages() {
        let stats = DeviceStats {
            reads: [3, 1],
            writes: [0, 0],
            budget: 0,
        };
        let text = stats.to_string();
        assert!(text.contains("Reads         :      4 (25.00% cached)"), "{text}");
        assert!(text.contains("Writes        :      0 ( 0.00% cached)"), "{text}");
    }
}
