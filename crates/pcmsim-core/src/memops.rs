//! Fenced memory primitives.
//!
//! The calibrator and the stall loops share three routines: a raw buffer
//! read, a raw buffer copy, and a timed worst-cache-line probe. All three
//! end in an explicit fence so a tick read taken immediately after them
//! observes the completed operation, and all three use volatile accesses so
//! the compiler cannot elide or reorder the memory traffic being timed.
//!
//! Between calibration trials the caches must be returned to a known-cold
//! state. `wbinvd` is privileged, so [`CacheFlusher`] walks a cache-sized
//! spoiler buffer instead, which evicts the trial buffers from every level
//! below it.

use std::ptr;

use crate::error::PcmError;
use crate::ticks::{full_fence, load_fence, ticks_fenced};

/// Cache-line stride used by the timed probe.
pub const CACHE_LINE: usize = 64;

/// Spoiler buffer size; larger than any L2/L3 this simulator targets.
const SPOILER_BYTES: usize = 32 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// Read every word of `buf` sequentially, then issue a load fence.
///
/// No result is returned; the point is the cache traffic. Word loads are
/// used when the buffer is 8-byte aligned (calibration buffers always are),
/// with a byte-stride fallback that touches the same cache lines otherwise.
pub fn read_buffer(buf: &[u8]) {
    let ptr = buf.as_ptr();
    let mut sink = 0u64;
    let mut off = 0;

    if (ptr as usize) & 7 == 0 {
        while off + 8 <= buf.len() {
            // SAFETY: off + 8 <= len and the base pointer is 8-byte aligned.
            sink ^= unsafe { ptr::read_volatile(ptr.add(off) as *const u64) };
            off += 8;
        }
    }
    while off < buf.len() {
        // SAFETY: off < len.
        sink ^= unsafe { ptr::read_volatile(ptr.add(off)) } as u64;
        off += 8;
        // Stride 8 keeps the load count identical to the aligned path.
    }

    std::hint::black_box(sink);
    load_fence();
}

/// Copy `src` into `dst`, then issue a full memory fence.
///
/// The trailing fence means a raw tick read taken right after the call
/// already observes the completed copy; the stall loop relies on this.
pub fn copy_buffer(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    let len = dst.len().min(src.len());

    // SAFETY: both slices are valid for len bytes and cannot overlap
    // (&mut aliasing rules).
    unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), len) };
    full_fence();
}

/// Read one word from each cache-line stride of `buf` and return the
/// maximum inter-sample tick delta observed.
///
/// One sample per 64-byte stride; a miss below L2 shows up as an outlier at
/// exactly one stride. The returned value includes the overhead of the
/// fenced tick read itself, as the thresholds derived from it do too.
pub fn timed_line_probe(buf: &[u8]) -> u64 {
    let ptr = buf.as_ptr();
    let mut max_delta = 0u64;
    let mut prev = ticks_fenced();
    let mut off = 0;

    while off < buf.len() {
        // SAFETY: off < len.
        let v = unsafe { ptr::read_volatile(ptr.add(off)) };
        std::hint::black_box(v);

        let now = ticks_fenced();
        let delta = now.wrapping_sub(prev);
        if delta > max_delta {
            max_delta = delta;
        }
        prev = now;
        off += CACHE_LINE;
    }

    max_delta
}

/// Direct cache probe: was `buf` resident in its entirety before the call?
///
/// Loads the buffer as a side effect. Assumes the buffer offset and size
/// are cache-line aligned. `threshold` comes from calibration
/// (`CalibrationTable::threshold_l2`).
pub fn was_cached(buf: &[u8], threshold: u64) -> bool {
    timed_line_probe(buf) < threshold
}

// ---------------------------------------------------------------------------
// Cache flusher
// ---------------------------------------------------------------------------

/// Evicts the cache hierarchy between calibration trials by traversing a
/// spoiler buffer larger than the last-level cache.
///
/// [`CacheFlusher::dirty`] additionally writes the leading portion of the
/// spoiler, so that a subsequent flush leaves the cache full of dirty lines
/// and the next trial's evictions pay a writeback.
pub struct CacheFlusher {
    spoiler: Vec<u64>,
}

impl CacheFlusher {
    pub fn allocate() -> Result<Self, PcmError> {
        let words = SPOILER_BYTES / 8;
        let mut spoiler = Vec::new();
        spoiler
            .try_reserve_exact(words)
            .map_err(|_| PcmError::AllocationFailed {
                what: "cache spoiler buffer",
                bytes: SPOILER_BYTES,
            })?;
        spoiler.resize(words, 0);
        Ok(Self { spoiler })
    }

    /// Walk the spoiler, one word per cache line, evicting prior contents.
    pub fn flush(&self) {
        let mut sink = 0u64;
        let mut i = 0;
        while i < self.spoiler.len() {
            // SAFETY: i < len.
            sink ^= unsafe { ptr::read_volatile(self.spoiler.as_ptr().add(i)) };
            i += CACHE_LINE / 8;
        }
        std::hint::black_box(sink);
        full_fence();
    }

    /// Write the first `bytes` of the spoiler so evicted lines are dirty.
    pub fn dirty(&mut self, bytes: usize) {
        let words = (bytes / 8).min(self.spoiler.len());
        let ptr = self.spoiler.as_mut_ptr();
        for i in 0..words {
            // SAFETY: i < len.
            unsafe { ptr::write_volatile(ptr.add(i), i as u64) };
        }
        full_fence();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_buffer_copies() {
        let src: Vec<u8> = (0..=255).collect();
        let mut dst = vec![0u8; 256];
        copy_buffer(&mut dst, &src);
        assert_eq!(dst, src);
    }

    #[test]
    fn read_buffer_handles_odd_lengths() {
        // Must not panic on a buffer that is not a whole number of words.
        let buf = vec![0xA5u8; 1000];
        read_buffer(&buf);
    }

    #[test]
    fn probe_returns_nonzero_delta() {
        let buf = vec![1u8; 4096];
        let max = timed_line_probe(&buf);
        assert!(max > 0);
    }

    #[test]
    fn flusher_flush_and_dirty() {
        let mut flusher = CacheFlusher::allocate().expect("spoiler allocation");
        flusher.flush();
        flusher.dirty(4 * 1024 * 1024);
        flusher.flush();
    }
}
