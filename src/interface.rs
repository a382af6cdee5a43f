//! Detector interface: handle ownership, lifecycle and SDK callbacks.
//!
//! `DetectorInterface` opens the first attached detector, resets it to a
//! known state and exposes it through three capabilities (detector info,
//! buffer control, synchronization). Frames are announced by the SDK on its
//! own thread; those callbacks land in [`AcquisitionCore`], which never takes
//! the [`SyncController`] lock.
//!
//! ## Lifecycle
//!
//! ```text
//! new ──▶ Ready ──prepare_acq──▶ Armed ──start_acq──▶ Exposure
//!           ▲                                            │
//!           └──── acquisition end / stop_acq / manager stop
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::components::buffer::{BufferManager, FrameInfo};
use crate::components::correction::ArmedPlanes;
use crate::components::det_info::DetectorInfo;
use crate::components::sync::SyncController;
use crate::error::{DetectorError, Result};
use crate::sdk::{
    AcqHandle, AcquisitionEvents, AcquisitionSdk, FrameRegion, SdkStatus, SensorPosition,
    SyncMode, BINNING_1X1, ROI_FULL_FRAME,
};

/// Acquisition status reported to the framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwStatus {
    /// Idle, ready for a new acquisition
    Ready,
    /// Acquisition running
    Exposure,
}

/// Reset depth requested by the framework. Both levels behave the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetLevel {
    /// Software state only
    Soft,
    /// Full reset
    Hard,
}

/// Capability kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapType {
    /// Detector description
    DetInfo,
    /// Frame buffer control
    BufferCtrl,
    /// Trigger and exposure control
    Sync,
}

/// Capability object exposed by the interface.
#[derive(Clone)]
pub enum HwCap {
    /// Detector description
    DetInfo(DetectorInfo),
    /// Frame buffer control
    BufferCtrl(Arc<dyn BufferManager>),
    /// Trigger and exposure control
    Sync(Arc<Mutex<SyncController>>),
}

impl HwCap {
    /// Kind of this capability.
    pub fn cap_type(&self) -> CapType {
        match self {
            Self::DetInfo(_) => CapType::DetInfo,
            Self::BufferCtrl(_) => CapType::BufferCtrl,
            Self::Sync(_) => CapType::Sync,
        }
    }
}

impl fmt::Debug for HwCap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HwCap").field(&self.cap_type()).finish()
    }
}

/// State shared with the SDK callback thread.
struct AcquisitionCore {
    sdk: Arc<dyn AcquisitionSdk>,
    handle: AcqHandle,
    buffer_mgr: Arc<dyn BufferManager>,
    active: AtomicBool,
    /// Set once a stop has been issued for the current acquisition.
    stop_requested: AtomicBool,
    frames_delivered: AtomicU64,
    /// Correction planes the SDK reads during the running acquisition.
    in_flight: Mutex<Option<ArmedPlanes>>,
}

impl AcquisitionCore {
    fn abort(&self) -> Result<()> {
        let was_active = self.active.load(Ordering::SeqCst);
        match self.sdk.abort(self.handle) {
            Ok(()) => {
                debug!(was_active, "acquisition abort requested");
                Ok(())
            }
            Err(status) if !was_active => {
                debug!(%status, "abort while idle failed, ignored");
                Ok(())
            }
            Err(status) => Err(DetectorError::hardware("abort acquisition", status)),
        }
    }
}

impl AcquisitionEvents for AcquisitionCore {
    fn on_frame_ready(&self) {
        let acq_frame_nb = self.frames_delivered.load(Ordering::SeqCst);
        let keep_going = self.buffer_mgr.new_frame_ready(FrameInfo::new(acq_frame_nb));
        self.frames_delivered.fetch_add(1, Ordering::SeqCst);

        if !keep_going && !self.stop_requested.swap(true, Ordering::SeqCst) {
            debug!(acq_frame_nb, "buffer manager requested stop");
            if let Err(e) = self.abort() {
                error!(error = %e, "failed to stop acquisition from frame callback");
            }
        }
    }

    fn on_acquisition_end(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.in_flight.lock().take();
        info!(
            frames = self.frames_delivered.load(Ordering::SeqCst),
            "acquisition ended"
        );
    }
}

fn hw(operation: &'static str) -> impl FnOnce(SdkStatus) -> DetectorError {
    move |status| DetectorError::hardware(operation, status)
}

/// A PerkinElmer detector opened through the XISL SDK.
pub struct DetectorInterface {
    sdk: Arc<dyn AcquisitionSdk>,
    handle: AcqHandle,
    det_info: DetectorInfo,
    sync: Arc<Mutex<SyncController>>,
    core: Arc<AcquisitionCore>,
}

impl fmt::Debug for DetectorInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectorInterface")
            .field("handle", &self.handle)
            .field("det_info", &self.det_info)
            .field("status", &self.status())
            .finish()
    }
}

impl DetectorInterface {
    /// Open the first detector found and bring it to a known state.
    ///
    /// The handle is closed again if any step after opening fails.
    #[instrument(skip_all)]
    pub fn new(sdk: Arc<dyn AcquisitionSdk>, buffer_mgr: Arc<dyn BufferManager>) -> Result<Self> {
        let count = sdk.enum_sensors().map_err(|status| DetectorError::DeviceNotFound {
            message: format!("sensor enumeration failed: {status}"),
        })?;
        if count == 0 {
            return Err(DetectorError::DeviceNotFound {
                message: "no sensor enumerated".into(),
            });
        }
        debug!(count, "sensors enumerated");

        let mut pos = SensorPosition::default();
        let handle = sdk
            .next_sensor(&mut pos)
            .map_err(|status| DetectorError::DeviceNotFound {
                message: format!("unable to open first sensor: {status}"),
            })?;

        match Self::setup(sdk.clone(), handle, buffer_mgr) {
            Ok(interface) => Ok(interface),
            Err(e) => {
                if let Err(status) = sdk.close(handle) {
                    warn!(%status, "closing handle after failed initialization");
                }
                Err(e)
            }
        }
    }

    fn setup(
        sdk: Arc<dyn AcquisitionSdk>,
        handle: AcqHandle,
        buffer_mgr: Arc<dyn BufferManager>,
    ) -> Result<Self> {
        let channel = sdk
            .comm_channel(handle)
            .map_err(hw("query communication channel"))?;
        info!(
            board = channel.board.description(),
            channel_id = channel.channel_id,
            "detector opened"
        );

        sdk.set_binning_mode(handle, BINNING_1X1)
            .map_err(hw("reset binning"))?;
        sdk.set_camera_roi(handle, ROI_FULL_FRAME)
            .map_err(hw("reset ROI"))?;

        let config = sdk
            .configuration(handle)
            .map_err(hw("read configuration"))?;
        info!(
            columns = config.columns,
            rows = config.rows,
            system_id = %format!("{:#06x}", config.system_id),
            sync_mode = config.sync_mode,
            "detector configuration"
        );

        sdk.set_frame_sync_mode(handle, SyncMode::InternalTimer)
            .map_err(hw("set internal timer sync mode"))?;

        let det_info = DetectorInfo::new(&config, channel);
        let sync = SyncController::new(sdk.clone(), handle)?;

        let core = Arc::new(AcquisitionCore {
            sdk: sdk.clone(),
            handle,
            buffer_mgr,
            active: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            frames_delivered: AtomicU64::new(0),
            in_flight: Mutex::new(None),
        });
        let events: Weak<dyn AcquisitionEvents> = Arc::<AcquisitionCore>::downgrade(&core);
        sdk.register_callbacks(handle, events)
            .map_err(hw("register callbacks"))?;

        Ok(Self {
            sdk,
            handle,
            det_info,
            sync: Arc::new(Mutex::new(sync)),
            core,
        })
    }

    /// SDK handle of the open detector.
    pub fn handle(&self) -> AcqHandle {
        self.handle
    }

    /// Detector description.
    pub fn det_info(&self) -> &DetectorInfo {
        &self.det_info
    }

    /// Shared synchronization controller.
    pub fn sync(&self) -> Arc<Mutex<SyncController>> {
        self.sync.clone()
    }

    /// Buffer manager frames are delivered to.
    pub fn buffer_manager(&self) -> Arc<dyn BufferManager> {
        self.core.buffer_mgr.clone()
    }

    /// The three capabilities: detector info, buffer control, sync.
    pub fn cap_list(&self) -> Vec<HwCap> {
        vec![
            HwCap::DetInfo(self.det_info),
            HwCap::BufferCtrl(self.core.buffer_mgr.clone()),
            HwCap::Sync(self.sync.clone()),
        ]
    }

    /// Clear the acquisition flag. Hardware is left untouched.
    pub fn reset(&self, level: ResetLevel) {
        self.core.active.store(false, Ordering::SeqCst);
        info!(?level, "interface reset");
    }

    /// Register the buffer manager's frames as SDK destination buffers.
    #[instrument(skip(self))]
    pub fn prepare_acq(&self) -> Result<()> {
        let size = self.det_info.detector_image_size();
        let mgr = &self.core.buffer_mgr;
        let nb_buffers = mgr.nb_buffers();
        let registration = |message: String| DetectorError::BufferRegistration { message };

        if nb_buffers == 0 {
            return Err(registration("buffer manager has no buffers".into()));
        }
        if mgr.frame_len() != size.pixels() {
            return Err(registration(format!(
                "frames of {} samples do not match the {}x{} detector image",
                mgr.frame_len(),
                size.width,
                size.height
            )));
        }
        let frames = u32::try_from(nb_buffers)
            .map_err(|_| registration(format!("{nb_buffers} buffers exceed the SDK limit")))?;
        let base = mgr
            .frame_buffer_ptr(0)
            .ok_or_else(|| registration("buffer manager returned no frame memory".into()))?;

        // SAFETY: the BufferManager contract guarantees nb_buffers * frame_len
        // writable samples at base for the manager's lifetime, and this
        // interface holds the manager until the handle is closed.
        let region = unsafe { FrameRegion::new(base, frames, size.height, size.width) };
        self.sdk
            .define_dest_buffers(self.handle, region)
            .map_err(|status| registration(status.to_string()))?;

        self.core.frames_delivered.store(0, Ordering::SeqCst);
        info!(nb_buffers, width = size.width, height = size.height, "destination buffers registered");
        Ok(())
    }

    /// Start the acquisition armed by [`prepare_acq`](Self::prepare_acq).
    #[instrument(skip(self))]
    pub fn start_acq(&self) -> Result<()> {
        self.core.buffer_mgr.set_start_timestamp(Utc::now());
        self.core.stop_requested.store(false, Ordering::SeqCst);
        self.core.active.store(true, Ordering::SeqCst);

        let armed = match self.sync.lock().start_acq() {
            Ok(armed) => armed,
            Err(e) => {
                self.core.active.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let mut in_flight = self.core.in_flight.lock();
        *in_flight = Some(armed);
        // Already ended before the planes were stored
        if !self.core.active.load(Ordering::SeqCst) {
            in_flight.take();
        }
        info!("acquisition started");
        Ok(())
    }

    /// Abort the running acquisition. Safe to call at any time.
    #[instrument(skip(self))]
    pub fn stop_acq(&self) -> Result<()> {
        self.core.stop_requested.store(true, Ordering::SeqCst);
        self.core.abort()
    }

    /// [`HwStatus::Exposure`] while an acquisition is running.
    pub fn status(&self) -> HwStatus {
        if self.core.active.load(Ordering::SeqCst) {
            HwStatus::Exposure
        } else {
            HwStatus::Ready
        }
    }

    /// Frames delivered since the last [`prepare_acq`](Self::prepare_acq).
    pub fn nb_hw_acquired_frames(&self) -> u64 {
        self.core.frames_delivered.load(Ordering::SeqCst)
    }
}

impl Drop for DetectorInterface {
    fn drop(&mut self) {
        if self.core.active.load(Ordering::SeqCst) {
            if let Err(e) = self.core.abort() {
                warn!(error = %e, "abort on drop failed");
            }
        }
        match self.sdk.close(self.handle) {
            Ok(()) => debug!(handle = ?self.handle, "detector closed"),
            Err(status) => warn!(%status, "closing detector handle failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::buffer::StdBufferManager;
    use crate::components::det_info::ImageSize;
    use crate::sdk::mock::{MockOp, MockSdk};

    fn buffers(nb: usize, width: u32, height: u32) -> Arc<StdBufferManager> {
        Arc::new(StdBufferManager::with_buffers(nb, ImageSize::new(width, height)).unwrap())
    }

    #[test]
    fn test_init_resets_detector() {
        let sdk = Arc::new(MockSdk::new().with_geometry(64, 32));
        let interface = DetectorInterface::new(sdk.clone(), buffers(2, 64, 32)).unwrap();

        assert_eq!(sdk.binning_and_roi(), (BINNING_1X1, ROI_FULL_FRAME));
        assert_eq!(sdk.sync_mode(), SyncMode::InternalTimer);
        assert_eq!(
            interface.det_info().max_image_size(),
            ImageSize::new(64, 32)
        );
        assert_eq!(interface.status(), HwStatus::Ready);
        assert!(sdk.calls().contains(&MockOp::RegisterCallbacks));
    }

    #[test]
    fn test_init_without_detector() {
        let sdk = Arc::new(MockSdk::new().with_sensors(0));
        let err = DetectorInterface::new(sdk, buffers(1, 8, 8)).unwrap_err();
        assert!(matches!(err, DetectorError::DeviceNotFound { .. }));
    }

    #[test]
    fn test_init_failure_closes_handle() {
        let sdk = Arc::new(MockSdk::new());
        sdk.fail(MockOp::GetConfiguration);
        let err = DetectorInterface::new(sdk.clone(), buffers(1, 8, 8)).unwrap_err();
        assert!(err.is_hardware());
        assert_eq!(sdk.closed_handles().len(), 1);
    }

    #[test]
    fn test_cap_list() {
        let sdk = Arc::new(MockSdk::new().with_geometry(8, 8));
        let interface = DetectorInterface::new(sdk, buffers(1, 8, 8)).unwrap();
        let caps: Vec<CapType> = interface.cap_list().iter().map(HwCap::cap_type).collect();
        assert_eq!(caps, vec![CapType::DetInfo, CapType::BufferCtrl, CapType::Sync]);
    }

    #[test]
    fn test_prepare_rejects_small_frames() {
        let sdk = Arc::new(MockSdk::new().with_geometry(8, 8));
        let interface = DetectorInterface::new(sdk.clone(), buffers(2, 4, 4)).unwrap();
        let err = interface.prepare_acq().unwrap_err();
        assert!(matches!(err, DetectorError::BufferRegistration { .. }));
        assert!(sdk.dest_buffers().is_none());
    }

    #[test]
    fn test_prepare_sdk_rejection() {
        let sdk = Arc::new(MockSdk::new().with_geometry(8, 8));
        let interface = DetectorInterface::new(sdk.clone(), buffers(2, 8, 8)).unwrap();
        sdk.fail(MockOp::DefineDestBuffers);
        let err = interface.prepare_acq().unwrap_err();
        assert!(matches!(err, DetectorError::BufferRegistration { .. }));
    }

    #[test]
    fn test_start_failure_clears_active() {
        let sdk = Arc::new(MockSdk::new().with_geometry(8, 8));
        let interface = DetectorInterface::new(sdk.clone(), buffers(2, 8, 8)).unwrap();
        interface.prepare_acq().unwrap();
        sdk.fail(MockOp::AcquireImage);
        assert!(interface.start_acq().is_err());
        assert_eq!(interface.status(), HwStatus::Ready);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let sdk = Arc::new(MockSdk::new().with_geometry(8, 8));
        let interface = DetectorInterface::new(sdk.clone(), buffers(2, 8, 8)).unwrap();
        interface.stop_acq().unwrap();
        interface.stop_acq().unwrap();

        // Abort failure while idle is swallowed
        sdk.fail(MockOp::Abort);
        interface.stop_acq().unwrap();
    }

    #[test]
    fn test_reset_clears_active() {
        let sdk = Arc::new(MockSdk::new().with_geometry(8, 8));
        let interface = DetectorInterface::new(sdk, buffers(2, 8, 8)).unwrap();
        interface.prepare_acq().unwrap();
        interface.start_acq().unwrap();
        assert_eq!(interface.status(), HwStatus::Exposure);
        interface.reset(ResetLevel::Soft);
        assert_eq!(interface.status(), HwStatus::Ready);
    }

    #[test]
    fn test_drop_closes_handle() {
        let sdk = Arc::new(MockSdk::new().with_geometry(8, 8));
        let interface = DetectorInterface::new(sdk.clone(), buffers(2, 8, 8)).unwrap();
        let handle = interface.handle();
        interface.prepare_acq().unwrap();
        interface.start_acq().unwrap();
        drop(interface);
        assert_eq!(sdk.closed_handles(), vec![handle]);
        assert_eq!(sdk.abort_count(), 1);
        assert!(!sdk.is_acquiring());
    }

    #[test]
    fn test_callbacks_bound_weakly() {
        let sdk = Arc::new(MockSdk::new().with_geometry(8, 8));
        let interface = DetectorInterface::new(sdk.clone(), buffers(2, 8, 8)).unwrap();
        interface.prepare_acq().unwrap();
        interface.start_acq().unwrap();
        assert!(sdk.fire_frame_ready());
        assert_eq!(interface.nb_hw_acquired_frames(), 1);

        drop(interface);
        assert!(!sdk.fire_frame_ready());
    }

    #[test]
    fn test_stop_issued_once_per_acquisition() {
        let sdk = Arc::new(MockSdk::new().with_geometry(8, 8));
        let mgr = Arc::new(StdBufferManager::with_buffers(2, ImageSize::new(8, 8)).unwrap());
        mgr.set_nb_frames(2);
        let interface = DetectorInterface::new(sdk.clone(), mgr).unwrap();

        interface.prepare_acq().unwrap();
        interface.start_acq().unwrap();
        for _ in 0..3 {
            sdk.fire_frame_ready();
        }
        assert_eq!(interface.nb_hw_acquired_frames(), 3);
        assert_eq!(sdk.abort_count(), 1);

        // A new acquisition re-arms the stop
        interface.prepare_acq().unwrap();
        interface.start_acq().unwrap();
        sdk.fire_frame_ready();
        sdk.fire_frame_ready();
        assert_eq!(sdk.abort_count(), 2);
    }
}
