//! Vendor acquisition SDK surface.
//!
//! The detector is driven through PerkinElmer's XISL library: a handle based C
//! API where every call returns a status code and frames are announced through
//! two callbacks invoked on the library's own thread. [`AcquisitionSdk`] is the
//! subset of that API this driver consumes. Two backends implement it:
//!
//! - [`xisl::XislSdk`] talks to the real library (feature `xisl_hardware`)
//! - [`mock::MockSdk`] simulates a detector for tests and offline use
//!
//! Callbacks are delivered to an [`AcquisitionEvents`] context bound at
//! registration time instead of a process-wide "current interface" pointer.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Weak;

pub mod mock;
#[cfg(feature = "xisl_hardware")]
pub mod xisl;

/// Binning mode value that selects unbinned (1x1) readout.
pub const BINNING_1X1: u16 = 1;

/// ROI mask that selects all four readout quadrants (full frame).
pub const ROI_FULL_FRAME: u16 = 0xf;

/// Non-success status code returned by an SDK call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SdkStatus(u32);

impl SdkStatus {
    /// Memory or buffer could not be provided.
    pub const MEMORY: Self = Self(1);
    /// Frame grabber initialization failed.
    pub const BOARD_INIT: Self = Self(2);
    /// No detector connected.
    pub const NO_CAMERA: Self = Self(3);
    /// Correction buffer does not match the frame geometry.
    pub const CORR_BUFFER_INCOMPATIBLE: Self = Self(4);
    /// An acquisition is already running on this handle.
    pub const ACQ_ALREADY_RUNNING: Self = Self(5);
    /// Timeout while waiting on the hardware.
    pub const TIMEOUT: Self = Self(6);
    /// The acquisition handle is not valid.
    pub const INVALID_ACQ_DESC: Self = Self(7);

    /// Wrap a raw status code.
    pub const fn new(code: u32) -> Self {
        Self(code)
    }

    /// Raw status code.
    pub const fn code(self) -> u32 {
        self.0
    }

    fn name(self) -> Option<&'static str> {
        match self.0 {
            1 => Some("memory"),
            2 => Some("board init"),
            3 => Some("no camera"),
            4 => Some("correction buffer incompatible"),
            5 => Some("acquisition already running"),
            6 => Some("timeout"),
            7 => Some("invalid acquisition descriptor"),
            _ => None,
        }
    }
}

impl fmt::Display for SdkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "SDK status {} ({})", self.0, name),
            None => write!(f, "SDK status {}", self.0),
        }
    }
}

/// Result of a single SDK call.
pub type SdkResult<T> = std::result::Result<T, SdkStatus>;

/// Opaque acquisition session token handed out by the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AcqHandle(usize);

impl AcqHandle {
    /// Wrap a raw handle value.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw handle value.
    pub const fn as_raw(self) -> usize {
        self.0
    }
}

/// Enumeration cursor passed to [`AcquisitionSdk::next_sensor`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorPosition(pub usize);

/// Frame synchronization mode of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Frame start driven by an external electrical trigger
    ExternalTrigger,
    /// Frame start driven by the internal timer
    InternalTimer,
    /// Frame start driven by a software trigger
    SoftTrigger,
    /// Detector reads out as fast as it can
    FreeRunning,
}

/// Frame grabber or link the detector is attached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardType {
    /// XRD-FG or XRD-FGe frame grabber
    Eltec,
    /// XRD-FGX frame grabber
    EltecXrdFgx,
    /// XRD-FGe Opto
    EltecXrdFgeOpto,
    /// Gigabit Ethernet interface
    EltecGbif,
    /// Anything else
    Unknown(u32),
}

impl BoardType {
    /// Human readable board description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Eltec => "XRD-FG or XRD-FGe Frame Grabber",
            Self::EltecXrdFgx => "XRD-FGX frame grabber",
            Self::EltecXrdFgeOpto => "XRD-FGe Opto",
            Self::EltecGbif => "GigabitEthernet",
            Self::Unknown(_) => "Unknown",
        }
    }
}

/// Communication channel the detector was opened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommChannel {
    /// Board type
    pub board: BoardType,
    /// Channel number on that board
    pub channel_id: i32,
}

/// Detector configuration as reported by the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensorConfiguration {
    /// Frames in the currently defined destination buffer
    pub frames: u32,
    /// Sensor rows
    pub rows: u32,
    /// Sensor columns
    pub columns: u32,
    /// Pixel data type
    pub data_type: u32,
    /// Sorting scheme applied by the library
    pub sort_flags: u32,
    /// Interrupts enabled on the board
    pub irq_enabled: bool,
    /// Acquisition type
    pub acq_type: u32,
    /// Detector system id (model identifier)
    pub system_id: u32,
    /// Raw frame sync mode
    pub sync_mode: u32,
    /// Hardware access mode
    pub hw_access: u32,
}

/// Sequencing mode for [`AcquisitionSdk::acquire_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceMode {
    /// Run forever through the destination buffers
    Continuous,
    /// Fill the destination buffers once and stop
    OneBuffer,
}

/// Correction planes applied by the SDK to every frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrectionPlanes<'a> {
    /// Per-pixel offset
    pub offset: Option<&'a [u16]>,
    /// Per-pixel gain
    pub gain: Option<&'a [u32]>,
}

/// Parameters of an acquisition start.
#[derive(Debug, Clone, Copy)]
pub struct AcquireRequest<'a> {
    /// Number of SDK side frame buffers
    pub frame_buffers: u32,
    /// Frames skipped before the first one is delivered
    pub skip_frames: u32,
    /// Sequencing mode
    pub mode: SequenceMode,
    /// Correction planes, if any
    pub planes: CorrectionPlanes<'a>,
}

/// Destination memory the SDK writes frames into.
///
/// Holds a raw pointer because the frames are written by DMA outside of Rust's
/// view. Only constructible through [`FrameRegion::new`], whose caller vouches
/// for the memory.
#[derive(Debug, Clone, Copy)]
pub struct FrameRegion {
    base: NonNull<u16>,
    frames: u32,
    rows: u32,
    columns: u32,
}

// SAFETY: a FrameRegion is only a description of memory owned elsewhere; the
// creator guarantees validity for as long as the SDK may write to it.
unsafe impl Send for FrameRegion {}
unsafe impl Sync for FrameRegion {}

impl FrameRegion {
    /// Describe `frames` contiguous frames of `rows * columns` samples.
    ///
    /// # Safety
    ///
    /// `base` must point to writable memory of at least
    /// `frames * rows * columns` `u16` samples that stays allocated until a new
    /// region is registered or the acquisition handle is closed.
    pub unsafe fn new(base: NonNull<u16>, frames: u32, rows: u32, columns: u32) -> Self {
        Self {
            base,
            frames,
            rows,
            columns,
        }
    }

    /// Base pointer of the first frame.
    pub fn base(&self) -> NonNull<u16> {
        self.base
    }

    /// Number of frames.
    pub fn frames(&self) -> u32 {
        self.frames
    }

    /// Rows per frame.
    pub fn rows(&self) -> u32 {
        self.rows
    }

    /// Columns per frame.
    pub fn columns(&self) -> u32 {
        self.columns
    }
}

/// Receiver of the two hardware callbacks.
///
/// Called on the SDK's thread; the SDK serializes the two callbacks with
/// respect to each other.
pub trait AcquisitionEvents: Send + Sync {
    /// A frame has been written to the destination buffer.
    fn on_frame_ready(&self);
    /// The acquisition has ended (completed or aborted).
    fn on_acquisition_end(&self);
}

/// Subset of the XISL API consumed by the driver.
pub trait AcquisitionSdk: Send + Sync {
    /// Enumerate attached sensors, returning how many were found.
    fn enum_sensors(&self) -> SdkResult<u32>;

    /// Open the sensor at `pos` and advance the cursor.
    fn next_sensor(&self, pos: &mut SensorPosition) -> SdkResult<AcqHandle>;

    /// Board type and channel number of an open handle.
    fn comm_channel(&self, handle: AcqHandle) -> SdkResult<CommChannel>;

    /// Select the binning mode.
    fn set_binning_mode(&self, handle: AcqHandle, mode: u16) -> SdkResult<()>;

    /// Select the readout ROI mask.
    fn set_camera_roi(&self, handle: AcqHandle, mask: u16) -> SdkResult<()>;

    /// Read back the detector configuration.
    fn configuration(&self, handle: AcqHandle) -> SdkResult<SensorConfiguration>;

    /// Select the frame synchronization mode.
    fn set_frame_sync_mode(&self, handle: AcqHandle, mode: SyncMode) -> SdkResult<()>;

    /// Program the internal timer, returning the value actually applied (µs).
    fn set_timer_sync(&self, handle: AcqHandle, micros: u32) -> SdkResult<u32>;

    /// Bind the callback context for this handle.
    fn register_callbacks(
        &self,
        handle: AcqHandle,
        events: Weak<dyn AcquisitionEvents>,
    ) -> SdkResult<()>;

    /// Register the memory frames are written to.
    fn define_dest_buffers(&self, handle: AcqHandle, region: FrameRegion) -> SdkResult<()>;

    /// Start an acquisition.
    fn acquire_image(&self, handle: AcqHandle, request: &AcquireRequest<'_>) -> SdkResult<()>;

    /// Abort a running acquisition.
    fn abort(&self, handle: AcqHandle) -> SdkResult<()>;

    /// Release the handle.
    fn close(&self, handle: AcqHandle) -> SdkResult<()>;
}
