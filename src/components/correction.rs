//! Offset/gain correction planes.
//!
//! The SDK applies an offset plane (`u16` per pixel) and optionally a gain
//! plane (`u32` per pixel) to every frame it writes. The planes live here as
//! 16-byte aligned buffers that are released when replaced or dropped.
//!
//! Validity rules:
//! - a gain plane only exists while an offset plane exists
//! - reallocating either plane clears the offset validity and the gain plane's
//!   validity, so both must be loaded again before correction is re-enabled
//! - an exposure change of more than [`EXPOSURE_TOLERANCE`] from the exposure
//!   the planes were loaded at drops both planes
//!
//! Planes handed to a running acquisition are shared through `Arc`, so
//! dropping them here never frees memory the SDK is still reading.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::components::det_info::ImageSize;
use crate::error::{DetectorError, Result};
use crate::sdk::CorrectionPlanes;

/// Alignment of correction and frame buffers, in bytes.
pub const BUFFER_ALIGNMENT: usize = 16;

/// Exposure difference (seconds) beyond which correction planes are stale.
pub const EXPOSURE_TOLERANCE: f64 = 1e-6;

mod sealed {
    pub trait Sealed {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
}

/// Sample types for which an all-zero bit pattern is a valid value.
pub trait Sample: Copy + Send + Sync + sealed::Sealed + 'static {}
impl Sample for u16 {}
impl Sample for u32 {}

/// Zero-initialized, [`BUFFER_ALIGNMENT`]-aligned heap buffer.
pub struct AlignedBuffer<T: Sample> {
    ptr: NonNull<T>,
    len: usize,
}

// SAFETY: AlignedBuffer uniquely owns its allocation, like Box<[T]>.
unsafe impl<T: Sample> Send for AlignedBuffer<T> {}
unsafe impl<T: Sample> Sync for AlignedBuffer<T> {}

impl<T: Sample> AlignedBuffer<T> {
    /// Allocate `len` zeroed samples.
    pub fn zeroed(len: usize) -> Result<Self> {
        let layout = Self::layout(len)?;
        // SAFETY: layout has non-zero size (checked in layout()).
        let raw = unsafe { alloc::alloc_zeroed(layout) } as *mut T;
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        Ok(Self { ptr, len })
    }

    fn layout(len: usize) -> Result<Layout> {
        if len == 0 {
            return Err(DetectorError::InvalidArgument(
                "buffer length must be non-zero".into(),
            ));
        }
        let bytes = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| DetectorError::InvalidArgument(format!("buffer of {len} samples is too large")))?;
        Layout::from_size_align(bytes, BUFFER_ALIGNMENT)
            .map_err(|e| DetectorError::InvalidArgument(e.to_string()))
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; zero-length buffers are never allocated.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw base pointer, for handing to the SDK.
    pub fn as_non_null(&self) -> NonNull<T> {
        self.ptr
    }

    /// Samples as a slice.
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: ptr is valid for len initialized samples.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Samples as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: ptr is valid for len samples and uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Sample> Drop for AlignedBuffer<T> {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.len) {
            // SAFETY: ptr was allocated with exactly this layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr() as *mut u8, layout) };
        }
    }
}

impl<T: Sample> fmt::Debug for AlignedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Which correction planes the SDK applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionMode {
    /// Raw frames
    #[default]
    None,
    /// Offset plane only
    OffsetOnly,
    /// Offset and gain planes
    OffsetAndGain,
}

/// Planes selected for one acquisition, kept alive until it ends.
#[derive(Debug, Clone, Default)]
pub struct ArmedPlanes {
    offset: Option<Arc<AlignedBuffer<u16>>>,
    gain: Option<Arc<AlignedBuffer<u32>>>,
}

impl ArmedPlanes {
    /// Borrow as SDK arguments.
    pub fn as_planes(&self) -> CorrectionPlanes<'_> {
        CorrectionPlanes {
            offset: self.offset.as_deref().map(AlignedBuffer::as_slice),
            gain: self.gain.as_deref().map(AlignedBuffer::as_slice),
        }
    }

    /// Whether no plane is armed.
    pub fn is_empty(&self) -> bool {
        self.offset.is_none() && self.gain.is_none()
    }
}

/// Offset/gain planes with their validity state.
#[derive(Debug, Default)]
pub struct CorrectionBuffers {
    offset: Option<Arc<AlignedBuffer<u16>>>,
    gain: Option<Arc<AlignedBuffer<u32>>>,
    offset_valid: bool,
    gain_valid: bool,
    mode: CorrectionMode,
    valid_exposure: Option<f64>,
}

impl CorrectionBuffers {
    /// No planes, correction disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Active correction mode.
    pub fn mode(&self) -> CorrectionMode {
        self.mode
    }

    /// Exposure the loaded planes are valid for, `None` if unset.
    pub fn valid_exposure(&self) -> Option<f64> {
        self.valid_exposure
    }

    /// Offset plane, if allocated.
    pub fn offset(&self) -> Option<&[u16]> {
        self.offset.as_deref().map(AlignedBuffer::as_slice)
    }

    /// Gain plane, if allocated.
    pub fn gain(&self) -> Option<&[u32]> {
        self.gain.as_deref().map(AlignedBuffer::as_slice)
    }

    /// Whether the offset plane holds loaded calibration data.
    pub fn is_offset_valid(&self) -> bool {
        self.offset.is_some() && self.offset_valid
    }

    /// Whether the gain plane holds loaded calibration data.
    pub fn is_gain_valid(&self) -> bool {
        self.gain.is_some() && self.gain_valid
    }

    /// Replace the offset plane with a zeroed one of `size`. Drops any gain plane.
    ///
    /// Nothing changes if the new plane cannot be allocated.
    pub fn reallocate_offset(&mut self, size: ImageSize) -> Result<()> {
        let plane = AlignedBuffer::zeroed(size.pixels())?;
        self.gain = None;
        self.gain_valid = false;
        self.offset = Some(Arc::new(plane));
        self.offset_valid = false;
        self.mode = CorrectionMode::None;
        debug!(?size, "offset plane reallocated");
        Ok(())
    }

    /// Replace the gain plane with a zeroed one of `size`.
    ///
    /// Requires an offset plane. The offset plane is kept but marked invalid.
    pub fn reallocate_gain(&mut self, size: ImageSize) -> Result<()> {
        if self.offset.is_none() {
            return Err(DetectorError::InvalidArgument(
                "a gain plane requires an offset plane".into(),
            ));
        }
        let plane = AlignedBuffer::zeroed(size.pixels())?;
        self.gain = Some(Arc::new(plane));
        self.gain_valid = false;
        self.offset_valid = false;
        self.mode = CorrectionMode::None;
        debug!(?size, "gain plane reallocated, offset plane needs reloading");
        Ok(())
    }

    /// Copy calibration data into the offset plane, valid at `exposure`.
    pub fn load_offset(&mut self, data: &[u16], exposure: f64) -> Result<()> {
        let plane = Self::writable(&mut self.offset, "offset")?;
        if plane.len() != data.len() {
            return Err(DetectorError::InvalidArgument(format!(
                "offset image has {} samples, plane has {}",
                data.len(),
                plane.len()
            )));
        }
        plane.as_mut_slice().copy_from_slice(data);
        self.offset_valid = true;
        self.gain_valid = false;
        self.mode = CorrectionMode::None;
        self.valid_exposure = Some(exposure);
        Ok(())
    }

    /// Copy calibration data into the gain plane. Requires a valid offset.
    pub fn load_gain(&mut self, data: &[u32]) -> Result<()> {
        if !self.is_offset_valid() {
            return Err(DetectorError::InvalidArgument(
                "gain image needs a valid offset image first".into(),
            ));
        }
        let plane = Self::writable(&mut self.gain, "gain")?;
        if plane.len() != data.len() {
            return Err(DetectorError::InvalidArgument(format!(
                "gain image has {} samples, plane has {}",
                data.len(),
                plane.len()
            )));
        }
        plane.as_mut_slice().copy_from_slice(data);
        self.gain_valid = true;
        Ok(())
    }

    fn writable<'a, T: Sample>(
        plane: &'a mut Option<Arc<AlignedBuffer<T>>>,
        name: &str,
    ) -> Result<&'a mut AlignedBuffer<T>> {
        let plane = plane.as_mut().ok_or_else(|| {
            DetectorError::InvalidArgument(format!("no {name} plane allocated"))
        })?;
        Arc::get_mut(plane).ok_or_else(|| {
            DetectorError::InvalidArgument(format!(
                "{name} plane is in use by a running acquisition"
            ))
        })
    }

    /// Select the correction mode. Requires the matching planes to be valid.
    pub fn set_mode(&mut self, mode: CorrectionMode) -> Result<()> {
        let ready = match mode {
            CorrectionMode::None => true,
            CorrectionMode::OffsetOnly => self.is_offset_valid(),
            CorrectionMode::OffsetAndGain => self.is_offset_valid() && self.is_gain_valid(),
        };
        if !ready {
            return Err(DetectorError::InvalidArgument(format!(
                "correction mode {mode:?} needs calibration images loaded first"
            )));
        }
        self.mode = mode;
        Ok(())
    }

    /// Drop both planes and forget the valid exposure.
    pub fn invalidate(&mut self) {
        self.gain = None;
        self.offset = None;
        self.offset_valid = false;
        self.gain_valid = false;
        self.mode = CorrectionMode::None;
        self.valid_exposure = None;
    }

    /// Invalidate if `exposure` is not the exposure the planes were loaded at.
    /// Returns true if the planes were dropped.
    pub fn exposure_changed(&mut self, exposure: f64) -> bool {
        let stale = self
            .valid_exposure
            .map_or(true, |valid| (exposure - valid).abs() > EXPOSURE_TOLERANCE);
        if stale {
            self.invalidate();
        }
        stale
    }

    /// Planes to pass to the SDK for the current mode.
    pub fn armed_planes(&self) -> ArmedPlanes {
        match self.mode {
            CorrectionMode::None => ArmedPlanes::default(),
            CorrectionMode::OffsetOnly => ArmedPlanes {
                offset: self.offset.clone(),
                gain: None,
            },
            CorrectionMode::OffsetAndGain => ArmedPlanes {
                offset: self.offset.clone(),
                gain: self.gain.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: ImageSize = ImageSize {
        width: 8,
        height: 4,
    };

    #[test]
    fn test_aligned_buffer() {
        let mut buf = AlignedBuffer::<u16>::zeroed(33).unwrap();
        assert_eq!(buf.as_non_null().as_ptr() as usize % BUFFER_ALIGNMENT, 0);
        assert_eq!(buf.len(), 33);
        assert!(buf.as_slice().iter().all(|&v| v == 0));
        buf.as_mut_slice()[32] = 7;
        assert_eq!(buf.as_slice()[32], 7);
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(AlignedBuffer::<u32>::zeroed(0).is_err());
    }

    #[test]
    fn test_gain_requires_offset() {
        let mut corr = CorrectionBuffers::new();
        assert!(corr.reallocate_gain(SIZE).is_err());
        corr.reallocate_offset(SIZE).unwrap();
        corr.reallocate_gain(SIZE).unwrap();
        assert_eq!(corr.gain().map(<[u32]>::len), Some(32));
    }

    #[test]
    fn test_repeated_gain_reallocation() {
        let mut corr = CorrectionBuffers::new();
        corr.reallocate_offset(SIZE).unwrap();
        for width in [4, 16, 2, 64] {
            let size = ImageSize { width, height: 2 };
            corr.reallocate_gain(size).unwrap();
            assert_eq!(corr.gain().map(<[u32]>::len), Some(size.pixels()));
        }
        // Offset storage untouched by gain reallocation
        assert_eq!(corr.offset().map(<[u16]>::len), Some(SIZE.pixels()));
    }

    #[test]
    fn test_gain_reallocation_invalidates_offset() {
        let mut corr = CorrectionBuffers::new();
        corr.reallocate_offset(SIZE).unwrap();
        corr.load_offset(&[5; 32], 0.1).unwrap();
        corr.set_mode(CorrectionMode::OffsetOnly).unwrap();

        corr.reallocate_gain(SIZE).unwrap();
        assert_eq!(corr.mode(), CorrectionMode::None);
        assert!(!corr.is_offset_valid());
        assert!(corr.offset().is_some());
        assert!(corr.set_mode(CorrectionMode::OffsetOnly).is_err());
    }

    #[test]
    fn test_offset_reallocation_drops_gain() {
        let mut corr = CorrectionBuffers::new();
        corr.reallocate_offset(SIZE).unwrap();
        corr.reallocate_gain(SIZE).unwrap();
        corr.reallocate_offset(SIZE).unwrap();
        assert!(corr.gain().is_none());
    }

    #[test]
    fn test_mode_requires_loaded_planes() {
        let mut corr = CorrectionBuffers::new();
        corr.reallocate_offset(SIZE).unwrap();
        corr.reallocate_gain(SIZE).unwrap();
        assert!(corr.set_mode(CorrectionMode::OffsetOnly).is_err());

        corr.load_offset(&[1; 32], 0.5).unwrap();
        assert!(corr.set_mode(CorrectionMode::OffsetAndGain).is_err());
        corr.load_gain(&[2; 32]).unwrap();
        corr.set_mode(CorrectionMode::OffsetAndGain).unwrap();

        let armed = corr.armed_planes();
        let planes = armed.as_planes();
        assert_eq!(planes.offset.map(<[u16]>::len), Some(32));
        assert_eq!(planes.gain.map(|g| g[0]), Some(2));
    }

    #[test]
    fn test_failed_reallocation_keeps_planes() {
        let mut corr = CorrectionBuffers::new();
        corr.reallocate_offset(SIZE).unwrap();
        corr.reallocate_gain(SIZE).unwrap();
        corr.load_offset(&[1; 32], 0.5).unwrap();
        corr.load_gain(&[2; 32]).unwrap();
        corr.set_mode(CorrectionMode::OffsetAndGain).unwrap();

        let empty = ImageSize {
            width: 0,
            height: 4,
        };
        assert!(corr.reallocate_gain(empty).is_err());
        assert_eq!(corr.mode(), CorrectionMode::OffsetAndGain);
        assert!(corr.is_offset_valid());
        assert!(corr.is_gain_valid());
        assert_eq!(corr.armed_planes().as_planes().gain.map(<[u32]>::len), Some(32));

        corr.set_mode(CorrectionMode::OffsetOnly).unwrap();
        assert!(corr.reallocate_offset(empty).is_err());
        assert_eq!(corr.mode(), CorrectionMode::OffsetOnly);
        assert!(corr.is_offset_valid());
        assert_eq!(corr.gain().map(<[u32]>::len), Some(32));
        assert_eq!(corr.armed_planes().as_planes().offset.map(|o| o[0]), Some(1));
    }

    #[test]
    fn test_load_size_mismatch() {
        let mut corr = CorrectionBuffers::new();
        corr.reallocate_offset(SIZE).unwrap();
        assert!(corr.load_offset(&[0; 10], 0.1).is_err());
    }

    #[test]
    fn test_exposure_tolerance() {
        let mut corr = CorrectionBuffers::new();
        corr.reallocate_offset(SIZE).unwrap();
        corr.load_offset(&[1; 32], 0.1).unwrap();

        assert!(!corr.exposure_changed(0.1 + 0.5e-6));
        assert!(corr.offset().is_some());

        assert!(corr.exposure_changed(0.1 + 2e-6));
        assert!(corr.offset().is_none());
        assert_eq!(corr.valid_exposure(), None);
    }

    #[test]
    fn test_unset_exposure_always_stale() {
        let mut corr = CorrectionBuffers::new();
        corr.reallocate_offset(SIZE).unwrap();
        assert!(corr.exposure_changed(0.1));
        assert!(corr.offset().is_none());
    }

    #[test]
    fn test_armed_planes_block_reload() {
        let mut corr = CorrectionBuffers::new();
        corr.reallocate_offset(SIZE).unwrap();
        corr.load_offset(&[1; 32], 0.1).unwrap();
        corr.set_mode(CorrectionMode::OffsetOnly).unwrap();

        let armed = corr.armed_planes();
        assert!(corr.load_offset(&[2; 32], 0.1).is_err());

        // Invalidation while armed leaves the armed copy readable
        corr.invalidate();
        assert_eq!(armed.as_planes().offset.map(|o| o[0]), Some(1));
        drop(armed);
    }
}
