//! Error types for the PerkinElmer detector driver.
//!
//! Every hardware-facing failure is surfaced immediately as a [`DetectorError`].
//! There is no retry and no degraded mode: a failed SDK call fails the whole
//! operation that issued it.
//!
//! ## Error Hierarchy
//!
//! - **`DeviceNotFound`**: sensor enumeration found nothing to open.
//! - **`HardwareConfig`**: any configuration or control call rejected by the SDK.
//! - **`BufferRegistration`**: the SDK refused the destination frame buffers.
//! - **`UnsupportedTriggerMode`**: a framework trigger mode this detector cannot do.
//! - **`InvalidArgument`**: caller error (zero frame count, negative exposure, ...).
//! - **`Config`** / **`Configuration`**: loading or validating `DetectorConfig`.

use crate::components::sync::TriggerMode;
use crate::sdk::SdkStatus;
use thiserror::Error;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DetectorError>;

/// Errors raised by the detector driver.
#[derive(Error, Debug)]
pub enum DetectorError {
    /// No sensor could be enumerated or opened.
    #[error("No detector found: {message}")]
    DeviceNotFound {
        /// What the enumeration step reported
        message: String,
    },

    /// The SDK rejected a configuration or control call.
    #[error("Hardware configuration failed during {operation}: {status}")]
    HardwareConfig {
        /// Human readable name of the failed step
        operation: String,
        /// Status code returned by the SDK
        status: SdkStatus,
    },

    /// Destination buffer registration was rejected.
    #[error("Unable to register destination buffers: {message}")]
    BufferRegistration {
        /// Rejection details
        message: String,
    },

    /// Trigger mode outside the three modes the detector supports.
    #[error("Trigger mode {0:?} is not supported by this detector")]
    UnsupportedTriggerMode(TriggerMode),

    /// Caller supplied an invalid value.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl DetectorError {
    /// Wrap an SDK status code with the name of the step that failed.
    pub(crate) fn hardware(operation: impl Into<String>, status: SdkStatus) -> Self {
        Self::HardwareConfig {
            operation: operation.into(),
            status,
        }
    }

    /// Check if this error came from the SDK rejecting a call.
    pub fn is_hardware(&self) -> bool {
        matches!(
            self,
            Self::HardwareConfig { .. } | Self::BufferRegistration { .. }
        )
    }
}

impl From<figment::Error> for DetectorError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}
