//! # PerkinElmer XRD Detector Driver
//!
//! Drives PerkinElmer flat-panel x-ray detectors through the vendor XISL
//! acquisition SDK and exposes them through the camera-control hardware
//! contract: a detector interface with three capabilities.
//!
//! ## Crate Structure
//!
//! - **`interface`**: [`DetectorInterface`] owns the SDK handle, runs the
//!   prepare/start/stop lifecycle and relays SDK callbacks.
//! - **`components`**: the capabilities. `det_info` (geometry and
//!   identification), `sync` (trigger mode, exposure, frame count),
//!   `correction` (offset/gain planes) and `buffer` (frame memory contract
//!   and a standard pool).
//! - **`sdk`**: the [`AcquisitionSdk`] trait with a simulated backend and,
//!   behind the `xisl_hardware` feature, the real XISL backend.
//! - **`config`**: figment-based [`DetectorConfig`].
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: [`DetectorError`].
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use daq_driver_perkinelmer::{DetectorInterface, ImageSize, MockSdk, StdBufferManager};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let sdk = Arc::new(MockSdk::new());
//! let buffers = Arc::new(StdBufferManager::with_buffers(4, ImageSize::new(1024, 1024))?);
//! buffers.set_nb_frames(10);
//!
//! let detector = DetectorInterface::new(sdk, buffers)?;
//! detector.sync().lock().set_exp_time(0.1)?;
//! detector.prepare_acq()?;
//! detector.start_acq()?;
//! # Ok(())
//! # }
//! ```

pub mod components;
pub mod config;
pub mod error;
pub mod interface;
pub mod logging;
pub mod sdk;

pub use components::buffer::{BufferManager, FrameInfo, StdBufferManager};
pub use components::correction::CorrectionMode;
pub use components::det_info::{DetectorInfo, ImageSize, ImageType};
pub use components::sync::{SyncController, TriggerMode, ValidRanges};
pub use config::DetectorConfig;
pub use error::{DetectorError, Result};
pub use interface::{CapType, DetectorInterface, HwCap, HwStatus, ResetLevel};
pub use sdk::mock::MockSdk;
pub use sdk::AcquisitionSdk;
#[cfg(feature = "xisl_hardware")]
pub use sdk::xisl::XislSdk;
