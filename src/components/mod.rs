//! Capability objects exposed by the detector interface.

pub mod buffer;
pub mod correction;
pub mod det_info;
pub mod sync;
