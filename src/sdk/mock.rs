//! Simulated XISL backend.
//!
//! `MockSdk` behaves like a single attached flat panel: it hands out one
//! handle, remembers every configuration call, validates destination buffers
//! and correction planes against its geometry, and delivers callbacks either
//! on demand ([`MockSdk::fire_frame_ready`]) or from a background thread when
//! a frame period is configured.
//!
//! Any operation can be made to fail with [`MockSdk::fail`] to exercise error
//! paths.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    AcqHandle, AcquireRequest, AcquisitionEvents, AcquisitionSdk, BoardType, CommChannel,
    FrameRegion, SdkResult, SdkStatus, SensorConfiguration, SensorPosition, SequenceMode,
    SyncMode,
};

/// Default simulated geometry (columns, rows).
pub const DEFAULT_GEOMETRY: (u32, u32) = (1024, 1024);

/// System id reported by the simulated detector.
pub const MOCK_SYSTEM_ID: u32 = 0x0821;

/// SDK operations, used for call recording and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// `enum_sensors`
    EnumSensors,
    /// `next_sensor`
    NextSensor,
    /// `comm_channel`
    CommChannel,
    /// `set_binning_mode`
    SetBinning,
    /// `set_camera_roi`
    SetRoi,
    /// `configuration`
    GetConfiguration,
    /// `set_frame_sync_mode`
    SetFrameSyncMode,
    /// `set_timer_sync`
    SetTimerSync,
    /// `register_callbacks`
    RegisterCallbacks,
    /// `define_dest_buffers`
    DefineDestBuffers,
    /// `acquire_image`
    AcquireImage,
    /// `abort`
    Abort,
    /// `close`
    Close,
}

/// Destination buffers as last registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestBuffers {
    /// Number of frames
    pub frames: u32,
    /// Rows per frame
    pub rows: u32,
    /// Columns per frame
    pub columns: u32,
}

/// Record of the last `acquire_image` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireRecord {
    /// SDK side frame buffers requested
    pub frame_buffers: u32,
    /// Frames skipped
    pub skip_frames: u32,
    /// Sequencing mode
    pub mode: SequenceMode,
    /// Length of the offset plane passed, if any
    pub offset_len: Option<usize>,
    /// Length of the gain plane passed, if any
    pub gain_len: Option<usize>,
}

#[derive(Debug)]
struct MockState {
    sensors: u32,
    columns: u32,
    rows: u32,
    board: BoardType,
    channel_id: i32,
    open: Option<AcqHandle>,
    closed: Vec<AcqHandle>,
    binning: u16,
    roi: u16,
    sync_mode: SyncMode,
    timer_step_us: u32,
    timer_us: u32,
    dest: Option<DestBuffers>,
    acquiring: Option<Arc<AtomicBool>>,
    last_acquire: Option<AcquireRecord>,
    abort_count: u32,
    failures: HashSet<MockOp>,
    calls: Vec<MockOp>,
}

/// Simulated detector implementing [`AcquisitionSdk`].
pub struct MockSdk {
    state: Mutex<MockState>,
    events: Mutex<Option<Weak<dyn AcquisitionEvents>>>,
    frame_period: Option<Duration>,
}

impl MockSdk {
    /// One 1024x1024 detector behind a Gigabit Ethernet link.
    pub fn new() -> Self {
        let (columns, rows) = DEFAULT_GEOMETRY;
        Self {
            state: Mutex::new(MockState {
                sensors: 1,
                columns,
                rows,
                board: BoardType::EltecGbif,
                channel_id: 0,
                open: None,
                closed: Vec::new(),
                binning: 0,
                roi: 0,
                sync_mode: SyncMode::FreeRunning,
                timer_step_us: 1,
                timer_us: 0,
                dest: None,
                acquiring: None,
                last_acquire: None,
                abort_count: 0,
                failures: HashSet::new(),
                calls: Vec::new(),
            }),
            events: Mutex::new(None),
            frame_period: None,
        }
    }

    /// Number of sensors reported by enumeration.
    pub fn with_sensors(self, sensors: u32) -> Self {
        self.state.lock().sensors = sensors;
        self
    }

    /// Sensor geometry.
    pub fn with_geometry(self, columns: u32, rows: u32) -> Self {
        {
            let mut state = self.state.lock();
            state.columns = columns;
            state.rows = rows;
        }
        self
    }

    /// Timer quantization step in microseconds.
    pub fn with_timer_step(self, step_us: u32) -> Self {
        self.state.lock().timer_step_us = step_us.max(1);
        self
    }

    /// Deliver frames from a background thread every `period` while acquiring.
    pub fn with_frame_period(mut self, period: Duration) -> Self {
        self.frame_period = Some(period);
        self
    }

    /// Make every subsequent call of `op` fail.
    pub fn fail(&self, op: MockOp) {
        self.state.lock().failures.insert(op);
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Every SDK call made so far, in order.
    pub fn calls(&self) -> Vec<MockOp> {
        self.state.lock().calls.clone()
    }

    /// Current frame sync mode.
    pub fn sync_mode(&self) -> SyncMode {
        self.state.lock().sync_mode
    }

    /// Current timer value in microseconds.
    pub fn timer_us(&self) -> u32 {
        self.state.lock().timer_us
    }

    /// Current binning mode and ROI mask.
    pub fn binning_and_roi(&self) -> (u16, u16) {
        let state = self.state.lock();
        (state.binning, state.roi)
    }

    /// Registered destination buffers.
    pub fn dest_buffers(&self) -> Option<DestBuffers> {
        self.state.lock().dest
    }

    /// Last acquisition start.
    pub fn last_acquire(&self) -> Option<AcquireRecord> {
        self.state.lock().last_acquire
    }

    /// Number of `abort` calls.
    pub fn abort_count(&self) -> u32 {
        self.state.lock().abort_count
    }

    /// Whether an acquisition is running.
    pub fn is_acquiring(&self) -> bool {
        self.state.lock().acquiring.is_some()
    }

    /// Handles released through `close`.
    pub fn closed_handles(&self) -> Vec<AcqHandle> {
        self.state.lock().closed.clone()
    }

    /// Invoke the frame-ready callback. Returns false if no context is bound.
    pub fn fire_frame_ready(&self) -> bool {
        match self.bound_events() {
            Some(events) => {
                events.on_frame_ready();
                true
            }
            None => false,
        }
    }

    /// End the running acquisition as the hardware would and invoke the
    /// end-of-acquisition callback.
    pub fn finish_acquisition(&self) -> bool {
        if let Some(flag) = self.state.lock().acquiring.take() {
            flag.store(false, Ordering::SeqCst);
        }
        match self.bound_events() {
            Some(events) => {
                events.on_acquisition_end();
                true
            }
            None => false,
        }
    }

    fn bound_events(&self) -> Option<Arc<dyn AcquisitionEvents>> {
        self.events.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Record the call and check handle validity and injected failures.
    fn enter(&self, state: &mut MockState, op: MockOp, handle: Option<AcqHandle>) -> SdkResult<()> {
        state.calls.push(op);
        trace!(?op, "mock SDK call");
        if let Some(handle) = handle {
            if state.open != Some(handle) {
                return Err(SdkStatus::INVALID_ACQ_DESC);
            }
        }
        if state.failures.contains(&op) {
            debug!(?op, "mock SDK injected failure");
            return Err(SdkStatus::BOARD_INIT);
        }
        Ok(())
    }

    fn spawn_frame_thread(&self, period: Duration, running: Arc<AtomicBool>) {
        let events = self.events.lock().clone();
        std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                std::thread::sleep(period);
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                match events.as_ref().and_then(Weak::upgrade) {
                    Some(events) => events.on_frame_ready(),
                    None => break,
                }
            }
        });
    }
}

impl Default for MockSdk {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionSdk for MockSdk {
    fn enum_sensors(&self) -> SdkResult<u32> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockOp::EnumSensors, None)?;
        if state.sensors == 0 {
            return Err(SdkStatus::NO_CAMERA);
        }
        Ok(state.sensors)
    }

    fn next_sensor(&self, pos: &mut SensorPosition) -> SdkResult<AcqHandle> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockOp::NextSensor, None)?;
        if pos.0 >= state.sensors as usize {
            return Err(SdkStatus::NO_CAMERA);
        }
        let handle = AcqHandle::from_raw(0x1000 + pos.0);
        pos.0 += 1;
        state.open = Some(handle);
        Ok(handle)
    }

    fn comm_channel(&self, handle: AcqHandle) -> SdkResult<CommChannel> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockOp::CommChannel, Some(handle))?;
        Ok(CommChannel {
            board: state.board,
            channel_id: state.channel_id,
        })
    }

    fn set_binning_mode(&self, handle: AcqHandle, mode: u16) -> SdkResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockOp::SetBinning, Some(handle))?;
        state.binning = mode;
        Ok(())
    }

    fn set_camera_roi(&self, handle: AcqHandle, mask: u16) -> SdkResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockOp::SetRoi, Some(handle))?;
        state.roi = mask;
        Ok(())
    }

    fn configuration(&self, handle: AcqHandle) -> SdkResult<SensorConfiguration> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockOp::GetConfiguration, Some(handle))?;
        Ok(SensorConfiguration {
            frames: state.dest.map_or(0, |d| d.frames),
            rows: state.rows,
            columns: state.columns,
            data_type: 16,
            sort_flags: 0,
            irq_enabled: true,
            acq_type: 0,
            system_id: MOCK_SYSTEM_ID,
            sync_mode: match state.sync_mode {
                SyncMode::ExternalTrigger => 1,
                SyncMode::InternalTimer => 2,
                SyncMode::SoftTrigger => 3,
                SyncMode::FreeRunning => 4,
            },
            hw_access: 0,
        })
    }

    fn set_frame_sync_mode(&self, handle: AcqHandle, mode: SyncMode) -> SdkResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockOp::SetFrameSyncMode, Some(handle))?;
        state.sync_mode = mode;
        Ok(())
    }

    fn set_timer_sync(&self, handle: AcqHandle, micros: u32) -> SdkResult<u32> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockOp::SetTimerSync, Some(handle))?;
        let step = state.timer_step_us;
        let applied = (micros / step) * step;
        state.timer_us = applied;
        Ok(applied)
    }

    fn register_callbacks(
        &self,
        handle: AcqHandle,
        events: Weak<dyn AcquisitionEvents>,
    ) -> SdkResult<()> {
        {
            let mut state = self.state.lock();
            self.enter(&mut state, MockOp::RegisterCallbacks, Some(handle))?;
        }
        *self.events.lock() = Some(events);
        Ok(())
    }

    fn define_dest_buffers(&self, handle: AcqHandle, region: FrameRegion) -> SdkResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockOp::DefineDestBuffers, Some(handle))?;
        if state.acquiring.is_some() {
            return Err(SdkStatus::ACQ_ALREADY_RUNNING);
        }
        if region.frames() == 0 || region.rows() != state.rows || region.columns() != state.columns
        {
            return Err(SdkStatus::MEMORY);
        }
        state.dest = Some(DestBuffers {
            frames: region.frames(),
            rows: region.rows(),
            columns: region.columns(),
        });
        Ok(())
    }

    fn acquire_image(&self, handle: AcqHandle, request: &AcquireRequest<'_>) -> SdkResult<()> {
        let running = {
            let mut state = self.state.lock();
            self.enter(&mut state, MockOp::AcquireImage, Some(handle))?;
            if state.acquiring.is_some() {
                return Err(SdkStatus::ACQ_ALREADY_RUNNING);
            }
            if state.dest.is_none() {
                return Err(SdkStatus::MEMORY);
            }
            let pixels = state.rows as usize * state.columns as usize;
            let offset_len = request.planes.offset.map(<[u16]>::len);
            let gain_len = request.planes.gain.map(<[u32]>::len);
            if offset_len.is_some_and(|len| len != pixels)
                || gain_len.is_some_and(|len| len != pixels)
            {
                return Err(SdkStatus::CORR_BUFFER_INCOMPATIBLE);
            }
            state.last_acquire = Some(AcquireRecord {
                frame_buffers: request.frame_buffers,
                skip_frames: request.skip_frames,
                mode: request.mode,
                offset_len,
                gain_len,
            });
            let running = Arc::new(AtomicBool::new(true));
            state.acquiring = Some(running.clone());
            running
        };

        if let Some(period) = self.frame_period {
            self.spawn_frame_thread(period, running);
        }
        Ok(())
    }

    fn abort(&self, handle: AcqHandle) -> SdkResult<()> {
        let was_running = {
            let mut state = self.state.lock();
            self.enter(&mut state, MockOp::Abort, Some(handle))?;
            state.abort_count += 1;
            match state.acquiring.take() {
                Some(flag) => {
                    flag.store(false, Ordering::SeqCst);
                    true
                }
                None => false,
            }
        };

        // The library reports the end of an aborted acquisition through the
        // regular callback; the state lock must not be held while it runs.
        if was_running {
            if let Some(events) = self.bound_events() {
                events.on_acquisition_end();
            }
        }
        Ok(())
    }

    fn close(&self, handle: AcqHandle) -> SdkResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockOp::Close, Some(handle))?;
        if let Some(flag) = state.acquiring.take() {
            flag.store(false, Ordering::SeqCst);
        }
        state.open = None;
        state.closed.push(handle);
        Ok(())
    }
}
