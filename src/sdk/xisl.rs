//! XISL backend (real hardware).
//!
//! Thin safe layer over the `xisl-sys` bindings. Each method is one SDK round
//! trip; non-success status codes are returned unchanged.
//!
//! ## Callback context
//!
//! XISL callbacks only receive the acquisition handle. The callback context is
//! a boxed `Weak<dyn AcquisitionEvents>` attached to the handle with
//! `Acquisition_SetAcqData` and looked up again with `Acquisition_GetAcqData`
//! inside the trampolines, so several detectors can coexist in one process.

use std::ffi::c_void;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, warn};
use xisl_sys::*;

use super::{
    AcqHandle, AcquireRequest, AcquisitionEvents, AcquisitionSdk, BoardType, CommChannel,
    FrameRegion, SdkResult, SdkStatus, SensorConfiguration, SensorPosition, SequenceMode,
    SyncMode,
};

type EventContext = Weak<dyn AcquisitionEvents>;

fn check(code: u32) -> SdkResult<()> {
    if code == HIS_ALL_OK as u32 {
        Ok(())
    } else {
        Err(SdkStatus::new(code))
    }
}

fn raw(handle: AcqHandle) -> HACQDESC {
    handle.as_raw() as HACQDESC
}

/// Look up the callback context bound to `hacq`.
///
/// # Safety
///
/// Must only be called from an XISL callback for a handle whose AcqData was
/// set by [`XislSdk::register_callbacks`].
unsafe fn bound_events(hacq: HACQDESC) -> Option<Arc<dyn AcquisitionEvents>> {
    let mut data: *mut c_void = std::ptr::null_mut();
    // SAFETY: data is a valid out pointer; hacq comes from the SDK itself.
    if Acquisition_GetAcqData(hacq, &mut data as *mut *mut c_void as _) != HIS_ALL_OK as u32
        || data.is_null()
    {
        return None;
    }
    // SAFETY: data was produced by Box::into_raw on an EventContext and is only
    // freed after the handle is closed, when no callback can run anymore.
    let context = &*(data as *const EventContext);
    context.upgrade()
}

unsafe extern "system" fn on_end_frame(hacq: HACQDESC) {
    let Some(events) = bound_events(hacq) else {
        warn!("frame callback without bound context");
        return;
    };
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| events.on_frame_ready())).is_err() {
        error!("panic in frame-ready handler");
    }
}

unsafe extern "system" fn on_end_acq(hacq: HACQDESC) {
    let Some(events) = bound_events(hacq) else {
        warn!("end-of-acquisition callback without bound context");
        return;
    };
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| events.on_acquisition_end()))
        .is_err()
    {
        error!("panic in end-of-acquisition handler");
    }
}

/// Backend calling into the installed XISL library.
#[derive(Default)]
pub struct XislSdk {
    /// Boxed callback contexts per handle, stored as addresses so the SDK
    /// stays `Send + Sync`.
    contexts: Mutex<Vec<(AcqHandle, usize)>>,
}

impl XislSdk {
    /// Create the backend. The library itself is initialized by enumeration.
    pub fn new() -> Self {
        Self::default()
    }

    fn release_context(&self, handle: AcqHandle) {
        let mut contexts = self.contexts.lock();
        contexts.retain(|&(h, addr)| {
            if h != handle {
                return true;
            }
            // SAFETY: addr came from Box::into_raw in register_callbacks and is
            // removed from the list here, so it is freed exactly once.
            unsafe { drop(Box::from_raw(addr as *mut EventContext)) };
            false
        });
    }
}

impl AcquisitionSdk for XislSdk {
    fn enum_sensors(&self) -> SdkResult<u32> {
        let mut count: u32 = 0;
        // SAFETY: count is a valid out pointer. IRQ enabled, do not force open.
        check(unsafe { Acquisition_EnumSensors(&mut count as *mut u32 as _, 1, 0) })?;
        debug!(count, "XISL sensors enumerated");
        Ok(count)
    }

    fn next_sensor(&self, pos: &mut SensorPosition) -> SdkResult<AcqHandle> {
        let mut raw_pos: ACQDESCPOS = pos.0 as _;
        let mut hacq: HACQDESC = std::ptr::null_mut();
        // SAFETY: both pointers are valid out parameters.
        check(unsafe { Acquisition_GetNextSensor(&mut raw_pos, &mut hacq) })?;
        pos.0 = raw_pos as usize;
        Ok(AcqHandle::from_raw(hacq as usize))
    }

    fn comm_channel(&self, handle: AcqHandle) -> SdkResult<CommChannel> {
        let mut channel_type: u32 = 0;
        let mut channel_id: i32 = 0;
        // SAFETY: handle is open; out pointers are valid.
        check(unsafe {
            Acquisition_GetCommChannel(
                raw(handle),
                &mut channel_type as *mut u32 as _,
                &mut channel_id as *mut i32 as _,
            )
        })?;
        let board = match channel_type {
            t if t == HIS_BOARD_TYPE_ELTEC as u32 => BoardType::Eltec,
            t if t == HIS_BOARD_TYPE_ELTEC_XRD_FGX as u32 => BoardType::EltecXrdFgx,
            t if t == HIS_BOARD_TYPE_ELTEC_XRD_FGE_Opto as u32 => BoardType::EltecXrdFgeOpto,
            t if t == HIS_BOARD_TYPE_ELTEC_GbIF as u32 => BoardType::EltecGbif,
            other => BoardType::Unknown(other),
        };
        Ok(CommChannel { board, channel_id })
    }

    fn set_binning_mode(&self, handle: AcqHandle, mode: u16) -> SdkResult<()> {
        // SAFETY: handle is open.
        check(unsafe { Acquisition_SetCameraBinningMode(raw(handle), mode as _) })
    }

    fn set_camera_roi(&self, handle: AcqHandle, mask: u16) -> SdkResult<()> {
        // SAFETY: handle is open.
        check(unsafe { Acquisition_SetCameraROI(raw(handle), mask as _) })
    }

    fn configuration(&self, handle: AcqHandle) -> SdkResult<SensorConfiguration> {
        let mut frames: u32 = 0;
        let mut rows: u32 = 0;
        let mut columns: u32 = 0;
        let mut data_type: u32 = 0;
        let mut sort_flags: u32 = 0;
        let mut irq: i32 = 0;
        let mut acq_type: u32 = 0;
        let mut system_id: u32 = 0;
        let mut sync_mode: u32 = 0;
        let mut hw_access: u32 = 0;
        // SAFETY: handle is open; every out pointer refers to a live local.
        check(unsafe {
            Acquisition_GetConfiguration(
                raw(handle),
                &mut frames as *mut u32 as _,
                &mut rows as *mut u32 as _,
                &mut columns as *mut u32 as _,
                &mut data_type as *mut u32 as _,
                &mut sort_flags as *mut u32 as _,
                &mut irq as *mut i32 as _,
                &mut acq_type as *mut u32 as _,
                &mut system_id as *mut u32 as _,
                &mut sync_mode as *mut u32 as _,
                &mut hw_access as *mut u32 as _,
            )
        })?;
        Ok(SensorConfiguration {
            frames,
            rows,
            columns,
            data_type,
            sort_flags,
            irq_enabled: irq != 0,
            acq_type,
            system_id,
            sync_mode,
            hw_access,
        })
    }

    fn set_frame_sync_mode(&self, handle: AcqHandle, mode: SyncMode) -> SdkResult<()> {
        let raw_mode = match mode {
            SyncMode::ExternalTrigger => HIS_SYNCMODE_EXTERNAL_TRIGGER,
            SyncMode::InternalTimer => HIS_SYNCMODE_INTERNAL_TIMER,
            SyncMode::SoftTrigger => HIS_SYNCMODE_SOFT_TRIGGER,
            SyncMode::FreeRunning => HIS_SYNCMODE_FREE_RUNNING,
        };
        // SAFETY: handle is open.
        check(unsafe { Acquisition_SetFrameSyncMode(raw(handle), raw_mode as _) })
    }

    fn set_timer_sync(&self, handle: AcqHandle, micros: u32) -> SdkResult<u32> {
        let mut cycle: u32 = micros;
        // SAFETY: handle is open; the SDK writes the applied cycle time back.
        check(unsafe { Acquisition_SetTimerSync(raw(handle), &mut cycle as *mut u32 as _) })?;
        Ok(cycle)
    }

    fn register_callbacks(
        &self,
        handle: AcqHandle,
        events: Weak<dyn AcquisitionEvents>,
    ) -> SdkResult<()> {
        let addr = Box::into_raw(Box::new(events));
        // SAFETY: addr stays valid until release_context frees it on close.
        if let Err(status) = check(unsafe { Acquisition_SetAcqData(raw(handle), addr as _) }) {
            // SAFETY: the SDK rejected the pointer, we still own it.
            unsafe { drop(Box::from_raw(addr)) };
            return Err(status);
        }
        // The SDK now hands out the new context; free the one it replaced.
        self.release_context(handle);
        self.contexts.lock().push((handle, addr as usize));

        // SAFETY: no window, no messages; the trampolines match CALLBACK.
        check(unsafe {
            Acquisition_SetCallbacksAndMessages(
                raw(handle),
                std::ptr::null_mut(),
                0,
                0,
                Some(on_end_frame),
                Some(on_end_acq),
            )
        })
    }

    fn define_dest_buffers(&self, handle: AcqHandle, region: FrameRegion) -> SdkResult<()> {
        // SAFETY: FrameRegion's constructor contract guarantees the memory.
        check(unsafe {
            Acquisition_DefineDestBuffers(
                raw(handle),
                region.base().as_ptr() as _,
                region.frames() as _,
                region.rows() as _,
                region.columns() as _,
            )
        })
    }

    fn acquire_image(&self, handle: AcqHandle, request: &AcquireRequest<'_>) -> SdkResult<()> {
        let offset = request
            .planes
            .offset
            .map_or(std::ptr::null_mut(), |p| p.as_ptr() as *mut u16);
        let gain = request
            .planes
            .gain
            .map_or(std::ptr::null_mut(), |p| p.as_ptr() as *mut u32);
        let mode = match request.mode {
            SequenceMode::Continuous => HIS_SEQ_CONTINUOUS,
            SequenceMode::OneBuffer => HIS_SEQ_ONE_BUFFER,
        };
        // SAFETY: the planes are only read by the SDK; the caller keeps them
        // alive until the end-of-acquisition callback.
        check(unsafe {
            Acquisition_Acquire_Image(
                raw(handle),
                request.frame_buffers as _,
                request.skip_frames as _,
                mode as _,
                offset as _,
                gain as _,
                std::ptr::null_mut(),
            )
        })
    }

    fn abort(&self, handle: AcqHandle) -> SdkResult<()> {
        // SAFETY: handle is open.
        check(unsafe { Acquisition_Abort(raw(handle)) })
    }

    fn close(&self, handle: AcqHandle) -> SdkResult<()> {
        // SAFETY: handle is open and not used after this call.
        let result = check(unsafe { Acquisition_Close(raw(handle)) });
        self.release_context(handle);
        result
    }
}

impl Drop for XislSdk {
    fn drop(&mut self) {
        let contexts = std::mem::take(&mut *self.contexts.lock());
        for (_, addr) in contexts {
            // SAFETY: every remaining address is an unfreed Box::into_raw result.
            unsafe { drop(Box::from_raw(addr as *mut EventContext)) };
        }
    }
}
