//! Trigger, exposure and correction control through an opened interface.

use std::sync::Arc;

use daq_driver_perkinelmer::sdk::mock::MockSdk;
use daq_driver_perkinelmer::sdk::SyncMode;
use daq_driver_perkinelmer::{
    CapType, CorrectionMode, DetectorConfig, DetectorError, DetectorInterface, HwCap, ImageSize,
    StdBufferManager, TriggerMode,
};

fn detector(sdk: &Arc<MockSdk>) -> DetectorInterface {
    DetectorInterface::new(sdk.clone(), Arc::new(StdBufferManager::new())).unwrap()
}

#[test]
fn trigger_mode_round_trip() {
    let sdk = Arc::new(MockSdk::new());
    let detector = detector(&sdk);
    let sync = detector.sync();
    let mut sync = sync.lock();

    for mode in [
        TriggerMode::ExtStartStop,
        TriggerMode::ExtTrigReadout,
        TriggerMode::IntTrig,
    ] {
        sync.set_trig_mode(mode).unwrap();
        assert_eq!(sync.trig_mode(), mode);
    }
    assert_eq!(sdk.sync_mode(), SyncMode::InternalTimer);
}

#[test]
fn unsupported_trigger_modes_leave_state_untouched() {
    let sdk = Arc::new(MockSdk::new());
    let detector = detector(&sdk);
    let sync = detector.sync();
    let mut sync = sync.lock();
    sync.set_trig_mode(TriggerMode::ExtStartStop).unwrap();

    let supported = [
        TriggerMode::IntTrig,
        TriggerMode::ExtStartStop,
        TriggerMode::ExtTrigReadout,
    ];
    for mode in TriggerMode::ALL {
        assert_eq!(sync.check_trig_mode(mode), supported.contains(&mode));
        if supported.contains(&mode) {
            continue;
        }
        assert!(matches!(
            sync.set_trig_mode(mode),
            Err(DetectorError::UnsupportedTriggerMode(m)) if m == mode
        ));
        assert_eq!(sync.trig_mode(), TriggerMode::ExtStartStop);
        assert_eq!(sdk.sync_mode(), SyncMode::ExternalTrigger);
    }
}

#[test]
fn exposure_reports_hardware_quantization() {
    let sdk = Arc::new(MockSdk::new().with_timer_step(1000));
    let detector = detector(&sdk);
    let sync = detector.sync();
    let mut sync = sync.lock();

    sync.set_exp_time(0.1234).unwrap();
    assert_eq!(sdk.timer_us(), 123_000);
    assert!((sync.exp_time() - 0.123).abs() < 1e-9);
}

#[test]
fn exposure_change_invalidates_corrections() {
    let size = ImageSize::new(16, 8);
    let sdk = Arc::new(MockSdk::new().with_geometry(16, 8));
    let detector = detector(&sdk);
    let sync = detector.sync();
    let mut sync = sync.lock();

    sync.set_exp_time(0.2).unwrap();
    sync.reallocate_offset_buffer(size).unwrap();
    sync.reallocate_gain_buffer(size).unwrap();
    sync.load_offset_image(&vec![7; size.pixels()]).unwrap();
    sync.load_gain_image(&vec![9; size.pixels()]).unwrap();
    sync.set_correction_mode(CorrectionMode::OffsetAndGain).unwrap();

    // Same exposure: planes survive
    sync.set_exp_time(0.2).unwrap();
    assert_eq!(sync.correction_mode(), CorrectionMode::OffsetAndGain);

    sync.set_exp_time(0.3).unwrap();
    assert_eq!(sync.correction_mode(), CorrectionMode::None);
    assert!(sync.corrections().offset().is_none());
    assert!(sync.corrections().gain().is_none());
    assert_eq!(sync.corrections().valid_exposure(), None);
}

#[test]
fn valid_ranges() {
    let sdk = Arc::new(MockSdk::new());
    let detector = detector(&sdk);
    let ranges = detector.sync().lock().valid_ranges();
    assert!((ranges.min_exp_time - 0.0332).abs() < 1e-12);
    assert_eq!(ranges.max_exp_time, 5.0);
    assert_eq!(ranges.min_lat_time, 0.0);
    assert_eq!(ranges.max_lat_time, 0.0);
}

#[test]
fn repeated_gain_reallocation_tracks_size() {
    let sdk = Arc::new(MockSdk::new());
    let detector = detector(&sdk);
    let sync = detector.sync();
    let mut sync = sync.lock();

    sync.reallocate_offset_buffer(ImageSize::new(1024, 1024)).unwrap();
    for size in [
        ImageSize::new(1024, 1024),
        ImageSize::new(512, 256),
        ImageSize::new(2048, 2048),
    ] {
        sync.reallocate_gain_buffer(size).unwrap();
        assert_eq!(sync.corrections().gain().unwrap().len(), size.pixels());
        assert!(!sync.corrections().is_offset_valid());
    }
}

#[test]
fn gain_without_offset_is_rejected() {
    let sdk = Arc::new(MockSdk::new());
    let detector = detector(&sdk);
    let err = detector
        .sync()
        .lock()
        .reallocate_gain_buffer(ImageSize::new(8, 8))
        .unwrap_err();
    assert!(matches!(err, DetectorError::InvalidArgument(_)));
}

#[test]
fn capability_list() {
    let sdk = Arc::new(MockSdk::new().with_geometry(2048, 2048));
    let detector = detector(&sdk);
    let caps = detector.cap_list();
    assert_eq!(caps.len(), 3);
    assert_eq!(
        caps.iter().map(HwCap::cap_type).collect::<Vec<_>>(),
        [CapType::DetInfo, CapType::BufferCtrl, CapType::Sync]
    );
    match &caps[0] {
        HwCap::DetInfo(info) => {
            assert_eq!(info.max_image_size(), ImageSize::new(2048, 2048));
            assert_eq!(info.detector_type(), "PerkinElmer");
        }
        other => panic!("unexpected capability {other:?}"),
    }
}

#[test]
fn config_applied_to_controller() {
    let sdk = Arc::new(MockSdk::new());
    let detector = detector(&sdk);

    let mut config = DetectorConfig::default();
    config.detector.trigger_mode = TriggerMode::ExtTrigReadout;
    config.detector.exposure_s = 2.0;
    config.detector.nb_frames = 12;
    config.validate().unwrap();
    config.apply(&mut detector.sync().lock()).unwrap();

    let sync = detector.sync();
    let sync = sync.lock();
    assert_eq!(sync.trig_mode(), TriggerMode::ExtTrigReadout);
    assert_eq!(sync.exp_time(), 2.0);
    assert_eq!(sync.nb_hw_frames(), 12);
    assert_eq!(sdk.sync_mode(), SyncMode::ExternalTrigger);
}
