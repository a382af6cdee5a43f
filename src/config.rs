//! Driver configuration using Figment.
//!
//! Loaded from a TOML file merged with environment variables prefixed with
//! `PERKINELMER_`. Nested keys are separated by a double underscore, e.g.
//! `PERKINELMER_DETECTOR__EXPOSURE_S=0.5`.
//!
//! ```toml
//! [detector]
//! trigger_mode = "int_trig"
//! exposure_s = 0.1
//! keep_first_image = false
//! nb_frames = 10
//!
//! [buffers]
//! count = 4
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::components::sync::{SyncController, TriggerMode, MAX_EXPO_TIME, MIN_EXPO_TIME};
use crate::error::{DetectorError, Result};
use crate::logging::LoggingConfig;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/perkinelmer.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PERKINELMER_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Acquisition settings
    pub detector: DetectorSettings,
    /// Frame buffer pool
    pub buffers: BufferSettings,
    /// Tracing output
    pub logging: LoggingConfig,
}

/// `[detector]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    /// Trigger mode, one of the three modes the detector supports
    pub trigger_mode: TriggerMode,
    /// Exposure time in seconds
    pub exposure_s: f64,
    /// Run the first frame at minimum exposure
    pub keep_first_image: bool,
    /// Frames per acquisition
    pub nb_frames: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            trigger_mode: TriggerMode::IntTrig,
            exposure_s: 0.1,
            keep_first_image: false,
            nb_frames: 1,
        }
    }
}

/// `[buffers]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// Frames in the destination pool
    pub count: usize,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self { count: 4 }
    }
}

impl DetectorConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment. A missing file leaves defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Check values the type system does not.
    pub fn validate(&self) -> Result<()> {
        self.logging.level()?;

        let detector = &self.detector;
        if detector.trigger_mode.sync_mode().is_none() {
            return Err(DetectorError::Configuration(format!(
                "trigger mode {} is not supported, use int_trig, ext_start_stop or ext_trig_readout",
                detector.trigger_mode
            )));
        }
        if !(MIN_EXPO_TIME..=MAX_EXPO_TIME).contains(&detector.exposure_s) {
            return Err(DetectorError::Configuration(format!(
                "exposure_s {} outside [{MIN_EXPO_TIME}, {MAX_EXPO_TIME}]",
                detector.exposure_s
            )));
        }
        if detector.nb_frames == 0 {
            return Err(DetectorError::Configuration(
                "nb_frames must be positive".into(),
            ));
        }
        if self.buffers.count == 0 {
            return Err(DetectorError::Configuration(
                "buffers.count must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Push the `[detector]` section to a controller.
    pub fn apply(&self, sync: &mut SyncController) -> Result<()> {
        let detector = &self.detector;
        sync.set_keep_first_image(detector.keep_first_image)?;
        sync.set_trig_mode(detector.trigger_mode)?;
        sync.set_exp_time(detector.exposure_s)?;
        sync.set_nb_hw_frames(detector.nb_frames)?;
        Ok(())
    }
}
