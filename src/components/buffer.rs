//! Frame buffer management.
//!
//! The SDK writes frames by DMA straight into memory owned by a buffer
//! manager. [`BufferManager`] is the contract the interface needs from it;
//! [`StdBufferManager`] is an in-process pool of contiguous 16-bit frames.
//!
//! # Safety
//!
//! `BufferManager` is an `unsafe trait`: the interface registers the pointer
//! it returns with the SDK, which writes to it from its own thread with no
//! further checks.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::components::correction::AlignedBuffer;
use crate::components::det_info::ImageSize;
use crate::error::{DetectorError, Result};

/// Descriptor of a frame written by the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Zero-based frame number within the acquisition
    pub acq_frame_nb: u64,
    /// Time the frame-ready callback ran
    pub timestamp: DateTime<Utc>,
}

impl FrameInfo {
    /// Frame `acq_frame_nb`, stamped now.
    pub fn new(acq_frame_nb: u64) -> Self {
        Self {
            acq_frame_nb,
            timestamp: Utc::now(),
        }
    }
}

/// Frame memory the SDK writes into.
///
/// # Safety
///
/// Implementors guarantee that `frame_buffer_ptr(0)`, when `Some`, points to
/// `nb_buffers() * frame_len()` contiguous writable `u16` samples, and that
/// this memory stays allocated and unaliased by Rust references for as long
/// as the manager is alive.
pub unsafe trait BufferManager: Send + Sync {
    /// Number of frames in the pool.
    fn nb_buffers(&self) -> usize;

    /// Samples per frame.
    fn frame_len(&self) -> usize;

    /// Start of frame `index`, `None` if out of range or unallocated.
    fn frame_buffer_ptr(&self, index: usize) -> Option<NonNull<u16>>;

    /// Record the start of an acquisition.
    fn set_start_timestamp(&self, start: DateTime<Utc>);

    /// A frame was written. Returns false to request a stop.
    fn new_frame_ready(&self, info: FrameInfo) -> bool;
}

#[derive(Debug)]
struct FramePool {
    storage: AlignedBuffer<u16>,
    nb_buffers: usize,
    frame_dim: ImageSize,
}

/// Contiguous pool of frames with an optional frame target.
///
/// The pool is allocated once, typically after the detector geometry is
/// known, and freed when the manager is dropped.
#[derive(Debug, Default)]
pub struct StdBufferManager {
    pool: OnceLock<FramePool>,
    nb_frames: AtomicU64,
    acquired: AtomicU64,
    last_frame: Mutex<Option<FrameInfo>>,
    start: Mutex<Option<DateTime<Utc>>>,
}

impl StdBufferManager {
    /// Empty manager; call [`allocate`](Self::allocate) before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager with `nb_buffers` frames of `dim` already allocated.
    pub fn with_buffers(nb_buffers: usize, dim: ImageSize) -> Result<Self> {
        let mgr = Self::new();
        mgr.allocate(nb_buffers, dim)?;
        Ok(mgr)
    }

    /// Allocate `nb_buffers` zeroed frames of `dim`. Fails if already allocated.
    pub fn allocate(&self, nb_buffers: usize, dim: ImageSize) -> Result<()> {
        if nb_buffers == 0 || dim.pixels() == 0 {
            return Err(DetectorError::InvalidArgument(format!(
                "cannot allocate {nb_buffers} buffers of {}x{}",
                dim.width, dim.height
            )));
        }
        if self.pool.get().is_some() {
            return Err(DetectorError::InvalidArgument(
                "frame buffers are already allocated".into(),
            ));
        }
        let len = nb_buffers.checked_mul(dim.pixels()).ok_or_else(|| {
            DetectorError::InvalidArgument(format!("{nb_buffers} buffers do not fit in memory"))
        })?;
        let pool = FramePool {
            storage: AlignedBuffer::zeroed(len)?,
            nb_buffers,
            frame_dim: dim,
        };
        self.pool.set(pool).map_err(|_| {
            DetectorError::InvalidArgument("frame buffers are already allocated".into())
        })?;
        debug!(nb_buffers, ?dim, "frame buffers allocated");
        Ok(())
    }

    /// Stop after `nb_frames` frames; 0 runs until stopped.
    pub fn set_nb_frames(&self, nb_frames: u64) {
        self.nb_frames.store(nb_frames, Ordering::SeqCst);
    }

    /// Frame target, 0 if unbounded.
    pub fn nb_frames(&self) -> u64 {
        self.nb_frames.load(Ordering::SeqCst)
    }

    /// Frames reported since the last start.
    pub fn frames_acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Most recent frame descriptor.
    pub fn last_frame(&self) -> Option<FrameInfo> {
        *self.last_frame.lock()
    }

    /// Start of the current or last acquisition.
    pub fn start_timestamp(&self) -> Option<DateTime<Utc>> {
        *self.start.lock()
    }

    /// Frame geometry, if allocated.
    pub fn frame_dim(&self) -> Option<ImageSize> {
        self.pool.get().map(|pool| pool.frame_dim)
    }

    /// Pool slot frame `acq_frame_nb` was written to.
    pub fn buffer_index(&self, acq_frame_nb: u64) -> Option<usize> {
        let nb_buffers = self.pool.get()?.nb_buffers as u64;
        Some((acq_frame_nb % nb_buffers) as usize)
    }

    /// Copy of pool slot `index`.
    pub fn frame(&self, index: usize) -> Option<Vec<u16>> {
        let len = self.frame_len();
        let src = self.frame_buffer_ptr(index)?;
        let mut out = vec![0u16; len];
        // SAFETY: src addresses `len` samples inside the pool (checked by
        // frame_buffer_ptr); out is a distinct allocation.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), out.as_mut_ptr(), len) };
        Some(out)
    }
}

// SAFETY: the pool is set at most once and only freed when the manager is
// dropped; no slice of it is handed out, frames are read through raw copies.
unsafe impl BufferManager for StdBufferManager {
    fn nb_buffers(&self) -> usize {
        self.pool.get().map_or(0, |pool| pool.nb_buffers)
    }

    fn frame_len(&self) -> usize {
        self.pool.get().map_or(0, |pool| pool.frame_dim.pixels())
    }

    fn frame_buffer_ptr(&self, index: usize) -> Option<NonNull<u16>> {
        let pool = self.pool.get()?;
        if index >= pool.nb_buffers {
            return None;
        }
        // SAFETY: index < nb_buffers keeps the offset inside the allocation.
        let ptr = unsafe {
            pool.storage
                .as_non_null()
                .as_ptr()
                .add(index * pool.frame_dim.pixels())
        };
        NonNull::new(ptr)
    }

    fn set_start_timestamp(&self, start: DateTime<Utc>) {
        *self.start.lock() = Some(start);
        *self.last_frame.lock() = None;
        self.acquired.store(0, Ordering::SeqCst);
    }

    fn new_frame_ready(&self, info: FrameInfo) -> bool {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        *self.last_frame.lock() = Some(info);
        let target = self.nb_frames();
        let keep_going = target == 0 || info.acq_frame_nb + 1 < target;
        trace!(frame = info.acq_frame_nb, keep_going, "frame ready");
        keep_going
    }
}
