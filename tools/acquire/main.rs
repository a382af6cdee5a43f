//! PerkinElmer acquisition tool
//!
//! Opens the detector, applies the configuration, runs one acquisition and
//! prints a summary. Without the `xisl_hardware` feature a simulated detector
//! is used.
//!
//! # Usage
//!
//! ```bash
//! # Ten frames at 100 ms with the default config file
//! cargo run --bin pe_acquire -- --frames 10 --exposure 0.1
//!
//! # Show the effective configuration and exit
//! cargo run --bin pe_acquire -- --config my.toml --print-config
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use daq_driver_perkinelmer::{
    logging, AcquisitionSdk, BufferManager, DetectorConfig, DetectorInterface, HwStatus,
    StdBufferManager, TriggerMode,
};
use tracing::info;

/// Run one acquisition on a PerkinElmer XRD detector
#[derive(Parser, Debug)]
#[command(name = "pe_acquire")]
#[command(version)]
#[command(about = "Acquire frames from a PerkinElmer XRD detector", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = daq_driver_perkinelmer::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Frames to acquire (overrides detector.nb_frames)
    #[arg(short = 'n', long)]
    frames: Option<u32>,

    /// Exposure time in seconds (overrides detector.exposure_s)
    #[arg(short, long)]
    exposure: Option<f64>,

    /// Trigger mode (overrides detector.trigger_mode)
    #[arg(short, long, value_enum)]
    trigger: Option<Trigger>,

    /// Destination buffers (overrides buffers.count)
    #[arg(short, long)]
    buffers: Option<usize>,

    /// Give up if the acquisition has not ended after this many seconds
    #[arg(long, default_value_t = 60.0)]
    timeout: f64,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// Trigger modes the detector supports
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Trigger {
    /// Internal timer
    Internal,
    /// External start/stop pulses
    StartStop,
    /// External trigger starts readout
    Readout,
}

impl From<Trigger> for TriggerMode {
    fn from(trigger: Trigger) -> Self {
        match trigger {
            Trigger::Internal => TriggerMode::IntTrig,
            Trigger::StartStop => TriggerMode::ExtStartStop,
            Trigger::Readout => TriggerMode::ExtTrigReadout,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = DetectorConfig::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    apply_overrides(&mut config, &args);
    config.validate().context("invalid configuration")?;

    if args.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    if !args.timeout.is_finite() || args.timeout <= 0.0 {
        bail!("--timeout must be a positive number of seconds");
    }
    logging::init(&config.logging)?;
    run(&config, Duration::from_secs_f64(args.timeout))
}

fn apply_overrides(config: &mut DetectorConfig, args: &Args) {
    if let Some(frames) = args.frames {
        config.detector.nb_frames = frames;
    }
    if let Some(exposure) = args.exposure {
        config.detector.exposure_s = exposure;
    }
    if let Some(trigger) = args.trigger {
        config.detector.trigger_mode = trigger.into();
    }
    if let Some(buffers) = args.buffers {
        config.buffers.count = buffers;
    }
    if args.verbose {
        config.logging.level = "debug".into();
    }
}

#[cfg(feature = "xisl_hardware")]
fn open_sdk(_config: &DetectorConfig) -> Arc<dyn AcquisitionSdk> {
    Arc::new(daq_driver_perkinelmer::XislSdk::new())
}

#[cfg(not(feature = "xisl_hardware"))]
fn open_sdk(config: &DetectorConfig) -> Arc<dyn AcquisitionSdk> {
    let period = Duration::from_secs_f64(config.detector.exposure_s);
    Arc::new(daq_driver_perkinelmer::MockSdk::new().with_frame_period(period))
}

fn run(config: &DetectorConfig, timeout: Duration) -> Result<()> {
    let buffers = Arc::new(StdBufferManager::new());
    let detector = DetectorInterface::new(open_sdk(config), buffers.clone())
        .context("opening detector")?;

    let info = detector.det_info();
    let size = info.detector_image_size();
    info!(
        model = %info.detector_model(),
        board = info.comm_channel().board.description(),
        width = size.width,
        height = size.height,
        "detector ready"
    );

    config.apply(&mut detector.sync().lock())?;
    buffers.allocate(config.buffers.count, size)?;
    buffers.set_nb_frames(u64::from(config.detector.nb_frames));

    detector.prepare_acq()?;
    let started = Instant::now();
    detector.start_acq()?;

    while detector.status() == HwStatus::Exposure {
        if started.elapsed() > timeout {
            detector.stop_acq()?;
            bail!(
                "acquisition timed out after {} of {} frames",
                detector.nb_hw_acquired_frames(),
                config.detector.nb_frames
            );
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    let elapsed = started.elapsed();
    let frames = detector.nb_hw_acquired_frames();
    println!("Detector:   {} ({})", info.detector_type(), info.detector_model());
    println!("Image:      {}x{} x {} buffers", size.width, size.height, buffers.nb_buffers());
    println!("Exposure:   {:.4} s", detector.sync().lock().exp_time());
    println!("Frames:     {frames}");
    println!("Elapsed:    {:.3} s", elapsed.as_secs_f64());
    if let Some(last) = buffers.last_frame() {
        println!("Last frame: #{} at {}", last.acq_frame_nb, last.timestamp.to_rfc3339());
    }
    Ok(())
}
