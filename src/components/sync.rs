//! Trigger and exposure synchronization.
//!
//! `SyncController` keeps the framework's view of trigger mode, exposure time
//! and frame count consistent with the detector. In internal-trigger mode the
//! requested exposure is programmed into the detector's timer right away and
//! the value the hardware actually applied is stored back, so `exp_time()`
//! always reports the quantized exposure.
//!
//! The controller also owns the correction planes, because their validity
//! depends on the exposure they were calibrated at.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::components::correction::{ArmedPlanes, CorrectionBuffers, CorrectionMode};
use crate::components::det_info::ImageSize;
use crate::error::{DetectorError, Result};
use crate::sdk::{AcqHandle, AcquireRequest, AcquisitionSdk, SequenceMode, SyncMode};

/// Shortest exposure the detector supports (s).
pub const MIN_EXPO_TIME: f64 = 33.2e-3;

/// Longest exposure the detector supports (s).
pub const MAX_EXPO_TIME: f64 = 5.0;

/// SDK side frame buffers used for every acquisition.
const SDK_FRAME_BUFFERS: u32 = 2;

/// Trigger modes of the camera-control framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Internal timer, one start for the whole sequence
    IntTrig,
    /// Internal timer, one start per frame
    IntTrigMult,
    /// One external trigger for the whole sequence
    ExtTrigSingle,
    /// One external trigger per frame
    ExtTrigMult,
    /// External gate defines exposure
    ExtGate,
    /// External start/stop pulses
    ExtStartStop,
    /// External trigger starts readout
    ExtTrigReadout,
}

impl TriggerMode {
    /// All framework trigger modes.
    pub const ALL: [TriggerMode; 7] = [
        Self::IntTrig,
        Self::IntTrigMult,
        Self::ExtTrigSingle,
        Self::ExtTrigMult,
        Self::ExtGate,
        Self::ExtStartStop,
        Self::ExtTrigReadout,
    ];

    /// Detector sync mode implementing this trigger mode, if supported.
    pub fn sync_mode(self) -> Option<SyncMode> {
        match self {
            Self::IntTrig => Some(SyncMode::InternalTimer),
            Self::ExtStartStop | Self::ExtTrigReadout => Some(SyncMode::ExternalTrigger),
            _ => None,
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Exposure and latency limits, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidRanges {
    /// Minimum exposure
    pub min_exp_time: f64,
    /// Maximum exposure
    pub max_exp_time: f64,
    /// Minimum latency
    pub min_lat_time: f64,
    /// Maximum latency
    pub max_lat_time: f64,
}

/// Trigger, exposure and correction state of one detector.
pub struct SyncController {
    sdk: Arc<dyn AcquisitionSdk>,
    handle: AcqHandle,
    trig_mode: TriggerMode,
    expo_time: f64,
    nb_frames: u32,
    keep_first_image: bool,
    corrections: CorrectionBuffers,
}

impl fmt::Debug for SyncController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncController")
            .field("handle", &self.handle)
            .field("trig_mode", &self.trig_mode)
            .field("expo_time", &self.expo_time)
            .field("nb_frames", &self.nb_frames)
            .field("keep_first_image", &self.keep_first_image)
            .field("correction_mode", &self.corrections.mode())
            .finish()
    }
}

impl SyncController {
    /// Controller for an open handle already in internal-timer sync mode.
    ///
    /// Programs the minimum exposure so the timer and the stored exposure
    /// agree from the start.
    pub fn new(sdk: Arc<dyn AcquisitionSdk>, handle: AcqHandle) -> Result<Self> {
        let mut sync = Self {
            sdk,
            handle,
            trig_mode: TriggerMode::IntTrig,
            expo_time: MIN_EXPO_TIME,
            nb_frames: 1,
            keep_first_image: false,
            corrections: CorrectionBuffers::new(),
        };
        sync.apply_exp_time(MIN_EXPO_TIME)?;
        Ok(sync)
    }

    /// Whether `mode` can be used with this detector.
    pub fn check_trig_mode(&self, mode: TriggerMode) -> bool {
        mode.sync_mode().is_some()
    }

    /// Switch trigger mode. The previous mode is kept on any failure.
    pub fn set_trig_mode(&mut self, mode: TriggerMode) -> Result<()> {
        let sync_mode = mode
            .sync_mode()
            .ok_or(DetectorError::UnsupportedTriggerMode(mode))?;
        self.sdk
            .set_frame_sync_mode(self.handle, sync_mode)
            .map_err(|status| {
                DetectorError::hardware(format!("set frame sync mode for {mode}"), status)
            })?;
        info!(%mode, ?sync_mode, "trigger mode set");
        self.trig_mode = mode;

        // Timer is only meaningful in internal mode; re-program it on entry.
        if mode == TriggerMode::IntTrig {
            self.apply_exp_time(self.expo_time)?;
        }
        Ok(())
    }

    /// Current trigger mode.
    pub fn trig_mode(&self) -> TriggerMode {
        self.trig_mode
    }

    /// Set the exposure time in seconds.
    pub fn set_exp_time(&mut self, exp_time: f64) -> Result<()> {
        if !exp_time.is_finite() || exp_time < 0.0 {
            return Err(DetectorError::InvalidArgument(format!(
                "exposure time must be a non-negative number of seconds, got {exp_time}"
            )));
        }
        self.apply_exp_time(exp_time)
    }

    fn sends_to_hardware(&self) -> bool {
        self.trig_mode == TriggerMode::IntTrig && !self.keep_first_image
    }

    fn apply_exp_time(&mut self, exp_time: f64) -> Result<()> {
        let applied = if self.sends_to_hardware() {
            let micros = self.program_timer(exp_time)?;
            micros as f64 * 1e-6
        } else {
            exp_time
        };
        debug!(requested = exp_time, applied, "exposure time set");
        self.expo_time = applied;

        let had_planes = self.corrections.offset().is_some();
        if self.corrections.exposure_changed(applied) && had_planes {
            info!(exposure = applied, "correction images invalidated by exposure change");
        }
        Ok(())
    }

    /// Program the detector timer, returning the applied microseconds.
    fn program_timer(&self, exp_time: f64) -> Result<u32> {
        let micros = (exp_time * 1e6).round();
        if micros > f64::from(u32::MAX) {
            return Err(DetectorError::InvalidArgument(format!(
                "exposure time {exp_time}s exceeds the timer range"
            )));
        }
        self.sdk
            .set_timer_sync(self.handle, micros as u32)
            .map_err(|status| DetectorError::hardware("set timer sync", status))
    }

    /// Current exposure time in seconds.
    pub fn exp_time(&self) -> f64 {
        self.expo_time
    }

    /// Latency is fixed at zero; any other value is ignored.
    pub fn set_lat_time(&mut self, lat_time: f64) -> Result<()> {
        if !lat_time.is_finite() || lat_time < 0.0 {
            return Err(DetectorError::InvalidArgument(format!(
                "latency time must be a non-negative number of seconds, got {lat_time}"
            )));
        }
        if lat_time != 0.0 {
            warn!(lat_time, "latency time is not managed by this detector, ignored");
        }
        Ok(())
    }

    /// Always 0.
    pub fn lat_time(&self) -> f64 {
        0.0
    }

    /// Number of frames the framework expects per acquisition.
    pub fn set_nb_hw_frames(&mut self, nb_frames: u32) -> Result<()> {
        if nb_frames == 0 {
            return Err(DetectorError::InvalidArgument(
                "number of frames must be positive".into(),
            ));
        }
        self.nb_frames = nb_frames;
        Ok(())
    }

    /// Frame count set with [`set_nb_hw_frames`](Self::set_nb_hw_frames).
    pub fn nb_hw_frames(&self) -> u32 {
        self.nb_frames
    }

    /// Exposure and latency limits.
    pub fn valid_ranges(&self) -> ValidRanges {
        ValidRanges {
            min_exp_time: MIN_EXPO_TIME,
            max_exp_time: MAX_EXPO_TIME,
            min_lat_time: 0.0,
            max_lat_time: 0.0,
        }
    }

    /// Hold the exposure in software and run the first frame at minimum
    /// exposure. Turning it off re-programs the stored exposure.
    pub fn set_keep_first_image(&mut self, keep: bool) -> Result<()> {
        self.keep_first_image = keep;
        if !keep && self.trig_mode == TriggerMode::IntTrig {
            self.apply_exp_time(self.expo_time)?;
        }
        Ok(())
    }

    /// Whether the first image is kept.
    pub fn keep_first_image(&self) -> bool {
        self.keep_first_image
    }

    /// Correction planes and their validity.
    pub fn corrections(&self) -> &CorrectionBuffers {
        &self.corrections
    }

    /// Active correction mode.
    pub fn correction_mode(&self) -> CorrectionMode {
        self.corrections.mode()
    }

    /// Select the correction mode for the next acquisition.
    pub fn set_correction_mode(&mut self, mode: CorrectionMode) -> Result<()> {
        self.corrections.set_mode(mode)
    }

    /// Allocate a zeroed offset plane of `size`, dropping any gain plane.
    pub fn reallocate_offset_buffer(&mut self, size: ImageSize) -> Result<()> {
        self.corrections.reallocate_offset(size)
    }

    /// Allocate a zeroed gain plane of `size`. Requires an offset plane.
    pub fn reallocate_gain_buffer(&mut self, size: ImageSize) -> Result<()> {
        self.corrections.reallocate_gain(size)
    }

    /// Load an offset image calibrated at the current exposure.
    pub fn load_offset_image(&mut self, data: &[u16]) -> Result<()> {
        self.corrections.load_offset(data, self.expo_time)
    }

    /// Load a gain image. Requires a valid offset image.
    pub fn load_gain_image(&mut self, data: &[u32]) -> Result<()> {
        self.corrections.load_gain(data)
    }

    /// Drop both correction planes.
    pub fn invalidate_correction_image(&mut self) {
        self.corrections.invalidate();
        debug!("correction images invalidated");
    }

    /// Start a continuous acquisition with the planes of the current mode.
    ///
    /// The returned planes must stay alive until the acquisition ends.
    pub fn start_acq(&mut self) -> Result<ArmedPlanes> {
        if self.trig_mode == TriggerMode::IntTrig && self.keep_first_image {
            let micros = self.program_timer(MIN_EXPO_TIME)?;
            debug!(micros, "first frame at minimum exposure");
        }

        let armed = self.corrections.armed_planes();
        let request = AcquireRequest {
            frame_buffers: SDK_FRAME_BUFFERS,
            skip_frames: 0,
            mode: SequenceMode::Continuous,
            planes: armed.as_planes(),
        };
        self.sdk
            .acquire_image(self.handle, &request)
            .map_err(|status| DetectorError::hardware("start acquisition", status))?;
        debug!(correction = ?self.corrections.mode(), "acquisition armed");
        Ok(armed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::mock::{MockOp, MockSdk};
    use crate::sdk::{AcquisitionSdk, SensorPosition};

    fn controller(sdk: MockSdk) -> (Arc<MockSdk>, SyncController) {
        let sdk = Arc::new(sdk);
        sdk.enum_sensors().unwrap();
        let handle = sdk.next_sensor(&mut SensorPosition::default()).unwrap();
        let sync = SyncController::new(sdk.clone(), handle).unwrap();
        (sdk, sync)
    }

    fn small() -> MockSdk {
        MockSdk::new().with_geometry(8, 4)
    }

    const SIZE: ImageSize = ImageSize {
        width: 8,
        height: 4,
    };

    #[test]
    fn test_new_programs_minimum_exposure() {
        let (sdk, sync) = controller(MockSdk::new());
        assert_eq!(sdk.timer_us(), 33_200);
        assert_eq!(sync.trig_mode(), TriggerMode::IntTrig);
        assert_eq!(sync.nb_hw_frames(), 1);
    }

    #[test]
    fn test_supported_trigger_modes() {
        let (sdk, mut sync) = controller(MockSdk::new());
        for mode in [
            TriggerMode::IntTrig,
            TriggerMode::ExtStartStop,
            TriggerMode::ExtTrigReadout,
        ] {
            assert!(sync.check_trig_mode(mode));
            sync.set_trig_mode(mode).unwrap();
            assert_eq!(sync.trig_mode(), mode);
        }
        assert_eq!(sdk.sync_mode(), SyncMode::ExternalTrigger);
        sync.set_trig_mode(TriggerMode::IntTrig).unwrap();
        assert_eq!(sdk.sync_mode(), SyncMode::InternalTimer);
    }

    #[test]
    fn test_unsupported_trigger_modes() {
        let (_sdk, mut sync) = controller(MockSdk::new());
        sync.set_trig_mode(TriggerMode::ExtTrigReadout).unwrap();
        for mode in [
            TriggerMode::IntTrigMult,
            TriggerMode::ExtTrigSingle,
            TriggerMode::ExtTrigMult,
            TriggerMode::ExtGate,
        ] {
            assert!(!sync.check_trig_mode(mode));
            let err = sync.set_trig_mode(mode).unwrap_err();
            assert!(matches!(err, DetectorError::UnsupportedTriggerMode(m) if m == mode));
            assert_eq!(sync.trig_mode(), TriggerMode::ExtTrigReadout);
        }
    }

    #[test]
    fn test_trigger_mode_sdk_failure_keeps_mode() {
        let (sdk, mut sync) = controller(MockSdk::new());
        sdk.fail(MockOp::SetFrameSyncMode);
        let err = sync.set_trig_mode(TriggerMode::ExtStartStop).unwrap_err();
        assert!(err.is_hardware());
        assert_eq!(sync.trig_mode(), TriggerMode::IntTrig);
    }

    #[test]
    fn test_exposure_quantized_by_hardware() {
        let (sdk, mut sync) = controller(MockSdk::new().with_timer_step(100));
        sync.set_exp_time(0.10005).unwrap();
        assert_eq!(sdk.timer_us(), 100_000);
        assert!((sync.exp_time() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_exposure_held_in_software_when_external() {
        let (sdk, mut sync) = controller(MockSdk::new());
        sync.set_trig_mode(TriggerMode::ExtStartStop).unwrap();
        sync.set_exp_time(1.5).unwrap();
        assert_eq!(sync.exp_time(), 1.5);
        assert_eq!(sdk.timer_us(), 33_200);

        // Back to internal: stored exposure reaches the timer
        sync.set_trig_mode(TriggerMode::IntTrig).unwrap();
        assert_eq!(sdk.timer_us(), 1_500_000);
    }

    #[test]
    fn test_exposure_rejects_invalid_values() {
        let (_sdk, mut sync) = controller(MockSdk::new());
        for bad in [-1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                sync.set_exp_time(bad),
                Err(DetectorError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_exposure_timer_failure() {
        let (sdk, mut sync) = controller(MockSdk::new());
        sdk.fail(MockOp::SetTimerSync);
        assert!(sync.set_exp_time(0.5).unwrap_err().is_hardware());
        assert!((sync.exp_time() - MIN_EXPO_TIME).abs() < 1e-9);
    }

    #[test]
    fn test_keep_first_image() {
        let (sdk, mut sync) = controller(MockSdk::new());
        sync.set_keep_first_image(true).unwrap();
        sync.set_exp_time(0.25).unwrap();
        assert_eq!(sdk.timer_us(), 33_200);
        assert_eq!(sync.exp_time(), 0.25);

        sync.set_keep_first_image(false).unwrap();
        assert_eq!(sdk.timer_us(), 250_000);
    }

    #[test]
    fn test_latency_is_fixed() {
        let (_sdk, mut sync) = controller(MockSdk::new());
        sync.set_lat_time(0.0).unwrap();
        sync.set_lat_time(0.2).unwrap();
        assert_eq!(sync.lat_time(), 0.0);
        assert!(sync.set_lat_time(-1.0).is_err());
    }

    #[test]
    fn test_frame_count() {
        let (_sdk, mut sync) = controller(MockSdk::new());
        assert!(matches!(
            sync.set_nb_hw_frames(0),
            Err(DetectorError::InvalidArgument(_))
        ));
        sync.set_nb_hw_frames(100).unwrap();
        assert_eq!(sync.nb_hw_frames(), 100);
    }

    #[test]
    fn test_valid_ranges() {
        let (_sdk, sync) = controller(MockSdk::new());
        let ranges = sync.valid_ranges();
        assert_eq!(ranges.min_exp_time, 0.0332);
        assert_eq!(ranges.max_exp_time, 5.0);
        assert_eq!((ranges.min_lat_time, ranges.max_lat_time), (0.0, 0.0));
    }

    #[test]
    fn test_exposure_change_invalidates_corrections() {
        let (_sdk, mut sync) = controller(small());
        sync.set_exp_time(0.1).unwrap();
        sync.reallocate_offset_buffer(SIZE).unwrap();
        sync.load_offset_image(&[3; 32]).unwrap();
        sync.set_correction_mode(CorrectionMode::OffsetOnly).unwrap();

        sync.set_exp_time(0.1).unwrap();
        assert_eq!(sync.correction_mode(), CorrectionMode::OffsetOnly);

        sync.set_exp_time(0.2).unwrap();
        assert_eq!(sync.correction_mode(), CorrectionMode::None);
        assert!(sync.corrections().offset().is_none());
        assert!(sync.corrections().gain().is_none());
    }

    #[test]
    fn test_unset_correction_exposure_invalidates() {
        let (_sdk, mut sync) = controller(small());
        sync.reallocate_offset_buffer(SIZE).unwrap();
        sync.set_exp_time(MIN_EXPO_TIME).unwrap();
        assert!(sync.corrections().offset().is_none());
    }

    /// Open the mock, register `frames` destination frames and build a controller.
    fn armed_controller(frames: &mut [u16]) -> (Arc<MockSdk>, SyncController) {
        let sdk = Arc::new(small());
        sdk.enum_sensors().unwrap();
        let handle = sdk.next_sensor(&mut SensorPosition::default()).unwrap();
        let base = std::ptr::NonNull::new(frames.as_mut_ptr()).unwrap();
        let nb = (frames.len() / SIZE.pixels()) as u32;
        // SAFETY: the mock records the region without writing to it.
        let region = unsafe { crate::sdk::FrameRegion::new(base, nb, 4, 8) };
        sdk.define_dest_buffers(handle, region).unwrap();
        let sync = SyncController::new(sdk.clone(), handle).unwrap();
        (sdk, sync)
    }

    #[test]
    fn test_start_acq_passes_planes() {
        let mut frames = vec![0u16; 64];
        let (sdk, mut sync) = armed_controller(&mut frames);
        sync.reallocate_offset_buffer(SIZE).unwrap();
        sync.load_offset_image(&[1; 32]).unwrap();
        sync.set_correction_mode(CorrectionMode::OffsetOnly).unwrap();
        let armed = sync.start_acq().unwrap();
        assert!(!armed.is_empty());

        let record = sdk.last_acquire().unwrap();
        assert_eq!(record.frame_buffers, 2);
        assert_eq!(record.skip_frames, 0);
        assert_eq!(record.mode, SequenceMode::Continuous);
        assert_eq!(record.offset_len, Some(32));
        assert_eq!(record.gain_len, None);

        // Planes in use cannot be overwritten
        assert!(sync.load_offset_image(&[2; 32]).is_err());
    }

    #[test]
    fn test_start_acq_without_correction() {
        let mut frames = vec![0u16; 32];
        let (sdk, mut sync) = armed_controller(&mut frames);
        let armed = sync.start_acq().unwrap();
        assert!(armed.is_empty());
        let record = sdk.last_acquire().unwrap();
        assert_eq!((record.offset_len, record.gain_len), (None, None));
    }

    #[test]
    fn test_start_acq_keep_first_image_programs_minimum() {
        let mut frames = vec![0u16; 32];
        let (sdk, mut sync) = armed_controller(&mut frames);
        sync.set_exp_time(1.0).unwrap();
        assert_eq!(sdk.timer_us(), 1_000_000);

        sync.set_keep_first_image(true).unwrap();
        sync.start_acq().unwrap();
        assert_eq!(sdk.timer_us(), 33_200);
        assert!((sync.exp_time() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_start_acq_failure() {
        let (_sdk, mut sync) = controller(small());
        // No destination buffers registered
        assert!(sync.start_acq().unwrap_err().is_hardware());
    }
}
