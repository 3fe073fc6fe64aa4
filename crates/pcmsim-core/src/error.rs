//! Simulator error taxonomy.

/// Errors surfaced by the simulator core.
///
/// Calibration inconsistencies are never fatal; the calibrator logs them and
/// proceeds with the last-measured table. Everything else is returned to the
/// caller, which for request submission plays the role of the block layer's
/// completion status.
#[derive(Debug, thiserror::Error)]
pub enum PcmError {
    /// A request reaches past the end of the device.
    #[error("request ends at sector {end_sector} but the device has {capacity_sectors} sectors")]
    CapacityExceeded {
        end_sector: u64,
        capacity_sectors: u64,
    },

    /// A segment length is not a whole number of sectors.
    #[error("segment of {len} bytes is not a whole number of 512-byte sectors")]
    InvalidSegment { len: usize },

    /// A backing or calibration allocation failed.
    #[error("failed to allocate {bytes} bytes for {what}")]
    AllocationFailed { what: &'static str, bytes: usize },

    /// The overhead tables never became monotonic within the allowed passes.
    #[error("calibration stayed inconsistent after {passes} passes")]
    CalibrationInconsistent { passes: usize },

    /// Unknown management operation.
    #[error("no such control operation: {0:#x}")]
    UnsupportedControl(u32),
}
