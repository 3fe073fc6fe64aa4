//! # pcmsim-core
//!
//! **A RAM-backed block device that behaves like phase-change memory in the
//! time domain.**
//!
//! `pcmsim-core` simulates a PCM DIMM sitting on the host's memory bus. Data
//! lives in ordinary RAM; what is simulated is *time*. At startup a
//! calibrator measures the host DRAM's read, copy, and writeback latencies
//! with cache invalidation between trials, a latency model extrapolates
//! those measurements to PCM scale using published row-activation and
//! precharge parameters, and every block transfer then busy-waits on the
//! cycle counter until the modeled latency has actually elapsed.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use pcmsim_core::{
//!     BlockIo, CalibrationConfig, PcmDevice, PcmParams, PcmTimings, SimOptions, calibrate,
//! };
//!
//! // Calibrate once, before any device exists.
//! let table = calibrate(&CalibrationConfig::default()).expect("calibration");
//! let timings = Arc::new(PcmTimings::derive(table, PcmParams::default()));
//!
//! // A 128 MB simulated PCM disk.
//! let device = PcmDevice::allocate(0, 128, timings, SimOptions::default()).expect("allocate");
//!
//! let payload = [0u8; 4096];
//! device.write_at(0, &payload).expect("write");
//! println!("{}", device.stats());
//! ```
//!
//! ## Architecture
//!
//! Calibrator → latency model → per-device stall loops
//!
//! The calibration table and the derived [`PcmTimings`] are frozen values;
//! thread them to each device behind an `Arc` at allocation. Tests swap in
//! [`CalibrationTable::synthetic`] tables, so nothing in the crate depends
//! on ambient global state.
//!
//! The stall loop never sleeps and never yields; the drain is a busy wait
//! by design, since the whole point is cycle-level latency, not wall-clock
//! approximation.

pub mod bitmap;
pub mod calibration;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod memops;
pub mod model;
pub mod ticks;

pub use calibration::{
    BusParams, CalibrationConfig, CalibrationTable, SECTOR_SIZE, SECTORS_MAX, calibrate,
    detect_row_width,
};
pub use device::{DeviceStats, PcmDevice, SimOptions, default_capacity_mb};
pub use dispatch::{BlockIo, CHUNK_BYTES, Direction, Geometry, Payload, Request};
pub use error::PcmError;
pub use model::{Op, PcmParams, PcmTimings, classify_read, classify_write};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
