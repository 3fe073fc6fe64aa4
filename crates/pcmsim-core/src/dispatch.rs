//! Request dispatcher and the block-layer boundary.
//!
//! A [`Request`] carries a starting sector and a scatter-gather list of
//! segments; the direction is encoded by the payload variant. The
//! dispatcher validates alignment and capacity up front, splits each
//! segment into chunks of at most [`CHUNK_BYTES`], and runs every chunk's
//! stall loop under the device lock, advancing the sector between chunks.
//!
//! [`BlockIo`] is the capability set a host storage stack consumes:
//! submit-request, report-geometry, capacity, and a management control
//! hook. Completion is the returned `Result`.

use crate::calibration::{SECTOR_SIZE, SECTORS_MAX};
use crate::device::PcmDevice;
use crate::error::PcmError;

/// Largest single stall-loop transfer in bytes.
pub const CHUNK_BYTES: usize = SECTORS_MAX * SECTOR_SIZE;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Scatter-gather segments plus direction.
pub enum Payload<'a> {
    /// Fill these buffers from the device.
    Read(Vec<&'a mut [u8]>),
    /// Store these buffers to the device.
    Write(Vec<&'a [u8]>),
}

/// One block request.
pub struct Request<'a> {
    /// First sector of the transfer.
    pub sector: u64,
    pub payload: Payload<'a>,
}

impl<'a> Request<'a> {
    pub fn read(sector: u64, segments: Vec<&'a mut [u8]>) -> Self {
        Self {
            sector,
            payload: Payload::Read(segments),
        }
    }

    pub fn write(sector: u64, segments: Vec<&'a [u8]>) -> Self {
        Self {
            sector,
            payload: Payload::Write(segments),
        }
    }

    pub fn direction(&self) -> Direction {
        match self.payload {
            Payload::Read(_) => Direction::Read,
            Payload::Write(_) => Direction::Write,
        }
    }

    /// Total bytes across all segments.
    pub fn total_len(&self) -> usize {
        match &self.payload {
            Payload::Read(segs) => segs.iter().map(|s| s.len()).sum(),
            Payload::Write(segs) => segs.iter().map(|s| s.len()).sum(),
        }
    }

    fn segment_lens(&self) -> Vec<usize> {
        match &self.payload {
            Payload::Read(segs) => segs.iter().map(|s| s.len()).collect(),
            Payload::Write(segs) => segs.iter().map(|s| s.len()).collect(),
        }
    }
}

/// Disk geometry derived from the sector capacity, in the classic
/// 4-head, 16-sectors-per-track shape RAM disks report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cylinders: u64,
    pub heads: u32,
    pub sectors: u32,
}

impl Geometry {
    pub fn from_capacity(capacity_sectors: u64) -> Self {
        Self {
            cylinders: capacity_sectors >> 6,
            heads: 4,
            sectors: 16,
        }
    }
}

/// The block-device capability set the simulator exposes to its host.
pub trait BlockIo {
    /// Run one request to completion. The `Result` is the completion
    /// signal; an error completes the request without partial retries.
    fn submit(&self, request: Request<'_>) -> Result<(), PcmError>;

    fn geometry(&self) -> Geometry;

    fn capacity_sectors(&self) -> u64;

    /// Management path; no controls are defined.
    fn control(&self, op: u32, _arg: u64) -> Result<u64, PcmError> {
        Err(PcmError::UnsupportedControl(op))
    }
}

impl BlockIo for PcmDevice {
    fn submit(&self, request: Request<'_>) -> Result<(), PcmError> {
        for len in request.segment_lens() {
            if len == 0 || len % SECTOR_SIZE != 0 {
                return Err(PcmError::InvalidSegment { len });
            }
        }

        let total_sectors = (request.total_len() / SECTOR_SIZE) as u64;
        let end_sector = request.sector + total_sectors;
        if end_sector > self.capacity_sectors() {
            return Err(PcmError::CapacityExceeded {
                end_sector,
                capacity_sectors: self.capacity_sectors(),
            });
        }

        let mut sector = request.sector;
        match request.payload {
            Payload::Read(segments) => {
                for segment in segments {
                    for chunk in segment.chunks_mut(CHUNK_BYTES) {
                        self.read_chunk(chunk, sector);
                        sector += (chunk.len() / SECTOR_SIZE) as u64;
                    }
                }
            }
            Payload::Write(segments) => {
                for segment in segments {
                    for chunk in segment.chunks(CHUNK_BYTES) {
                        self.write_chunk(chunk, sector);
                        sector += (chunk.len() / SECTOR_SIZE) as u64;
                    }
                }
            }
        }

        Ok(())
    }

    fn geometry(&self) -> Geometry {
        Geometry::from_capacity(self.capacity_sectors())
    }

    fn capacity_sectors(&self) -> u64 {
        PcmDevice::capacity_sectors(self)
    }
}

impl PcmDevice {
    /// Single-segment read convenience.
    pub fn read_at(&self, sector: u64, buf: &mut [u8]) -> Result<(), PcmError> {
        self.submit(Request::read(sector, vec![buf]))
    }

    /// Single-segment write convenience.
    pub fn write_at(&self, sector: u64, buf: &[u8]) -> Result<(), PcmError> {
        self.submit(Request::write(sector, vec![buf]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationTable;
    use crate::device::SimOptions;
    use crate::model::{PcmParams, PcmTimings};
    use std::sync::Arc;

    fn device(capacity_mb: u32) -> PcmDevice {
        let timings = Arc::new(PcmTimings::derive(
            CalibrationTable::synthetic(),
            PcmParams::default(),
        ));
        PcmDevice::allocate(0, capacity_mb, timings, SimOptions::default()).unwrap()
    }

    #[test]
    fn sector_zero_round_trip() {
        let dev = device(1);
        let mut sector0 = [0u8; SECTOR_SIZE];
        for (i, b) in sector0.iter_mut().take(16).enumerate() {
            *b = i as u8;
        }
        dev.write_at(0, &sector0).unwrap();

        let mut back = [0xEEu8; SECTOR_SIZE];
        dev.read_at(0, &mut back).unwrap();
        assert_eq!(&back[..16], &sector0[..16]);
        assert_eq!(back, sector0);
    }

    #[test]
    fn last_sector_works_one_past_fails() {
        let dev = device(1);
        let data = [0x5Au8; SECTOR_SIZE];
        dev.write_at(2047, &data).unwrap();

        let mut back = [0u8; SECTOR_SIZE];
        dev.read_at(2047, &mut back).unwrap();
        assert_eq!(back, data);

        let err = dev.write_at(2048, &data).unwrap_err();
        assert!(matches!(err, PcmError::CapacityExceeded { end_sector: 2049, .. }));
    }

    #[test]
    fn oversized_request_leaves_backing_unchanged() {
        let dev = device(1);
        let marker = [0x77u8; SECTOR_SIZE];
        dev.write_at(2047, &marker).unwrap();

        // Two sectors starting at the last sector: rejected up front.
        let data = [0x11u8; 2 * SECTOR_SIZE];
        assert!(matches!(
            dev.write_at(2047, &data),
            Err(PcmError::CapacityExceeded { .. })
        ));

        let mut back = [0u8; SECTOR_SIZE];
        dev.read_at(2047, &mut back).unwrap();
        assert_eq!(back, marker, "failed request must not touch the backing");
    }

    #[test]
    fn large_transfer_splits_into_chunks() {
        let dev = device(1);
        // 32 sectors: four full chunks through the stall loop.
        let mut data = vec![0u8; 32 * SECTOR_SIZE];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i / SECTOR_SIZE) as u8;
        }
        dev.write_at(100, &data).unwrap();

        let mut back = vec![0u8; 32 * SECTOR_SIZE];
        dev.read_at(100, &mut back).unwrap();
        assert_eq!(back, data);

        let stats = dev.stats();
        assert_eq!(stats.total_writes(), 4);
        assert_eq!(stats.total_reads(), 4);
    }

    #[test]
    fn ragged_tail_chunking() {
        let dev = device(1);
        // 11 sectors: one full chunk plus a 3-sector tail.
        let data: Vec<u8> = (0..11 * SECTOR_SIZE).map(|i| (i % 255) as u8).collect();
        dev.write_at(31, &data).unwrap();

        let mut back = vec![0u8; 11 * SECTOR_SIZE];
        dev.read_at(31, &mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(dev.stats().total_writes(), 2);
    }

    #[test]
    fn multi_segment_request_advances_sectors() {
        let dev = device(1);
        let a = [0xAAu8; 2 * SECTOR_SIZE];
        let b = [0xBBu8; SECTOR_SIZE];
        dev.submit(Request::write(10, vec![&a[..], &b[..]])).unwrap();

        let mut back = [0u8; 3 * SECTOR_SIZE];
        dev.read_at(10, &mut back).unwrap();
        assert!(back[..2 * SECTOR_SIZE].iter().all(|&x| x == 0xAA));
        assert!(back[2 * SECTOR_SIZE..].iter().all(|&x| x == 0xBB));
    }

    #[test]
    fn multi_segment_read_scatters() {
        let dev = device(1);
        let data: Vec<u8> = (0..4 * SECTOR_SIZE).map(|i| (i % 97) as u8).collect();
        dev.write_at(0, &data).unwrap();

        let mut first = [0u8; SECTOR_SIZE];
        let mut rest = [0u8; 3 * SECTOR_SIZE];
        dev.submit(Request::read(0, vec![&mut first[..], &mut rest[..]]))
            .unwrap();
        assert_eq!(&first[..], &data[..SECTOR_SIZE]);
        assert_eq!(&rest[..], &data[SECTOR_SIZE..]);
    }

    #[test]
    fn unaligned_segment_rejected() {
        let dev = device(1);
        let data = [0u8; 100];
        assert!(matches!(
            dev.write_at(0, &data),
            Err(PcmError::InvalidSegment { len: 100 })
        ));
        let empty: [u8; 0] = [];
        assert!(matches!(
            dev.write_at(0, &empty),
            Err(PcmError::InvalidSegment { len: 0 })
        ));
    }

    #[test]
    fn geometry_from_capacity() {
        let dev = device(1);
        let geo = dev.geometry();
        assert_eq!(geo.heads, 4);
        assert_eq!(geo.sectors, 16);
        assert_eq!(geo.cylinders, 32);
        assert_eq!(
            geo.cylinders * geo.heads as u64 * geo.sectors as u64,
            dev.capacity_sectors()
        );
    }

    #[test]
    fn control_is_unsupported() {
        let dev = device(1);
        assert!(matches!(
            dev.control(0x1234, 0),
            Err(PcmError::UnsupportedControl(0x1234))
        ));
    }

    #[test]
    fn random_round_trips_across_the_device() {
        use rand::Rng;

        let dev = device(1);
        let mut rng = rand::rng();
        for _ in 0..32 {
            let sectors = rng.random_range(1..=24u64);
            let start = rng.random_range(0..dev.capacity_sectors() - sectors);
            let data: Vec<u8> = (0..sectors as usize * SECTOR_SIZE)
                .map(|_| rng.random())
                .collect();

            dev.write_at(start, &data).unwrap();
            let mut back = vec![0u8; data.len()];
            dev.read_at(start, &mut back).unwrap();
            assert_eq!(back, data, "round trip at sector {start} x{sectors}");
        }
    }

    #[test]
    fn request_direction_and_len() {
        let mut buf = [0u8; SECTOR_SIZE];
        let req = Request::read(3, vec![&mut buf[..]]);
        assert_eq!(req.direction(), Direction::Read);
        assert_eq!(req.total_len(), SECTOR_SIZE);

        let data = [0u8; 2 * SECTOR_SIZE];
        let req = Request::write(0, vec![&data[..]]);
        assert_eq!(req.direction(), Direction::Write);
        assert_eq!(req.total_len(), 2 * SECTOR_SIZE);
    }
}
