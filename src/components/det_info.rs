//! Static detector description.

use serde::{Deserialize, Serialize};

use crate::sdk::{CommChannel, SensorConfiguration};

/// Pixel pitch of the XRD flat panels, in meters.
pub const PIXEL_SIZE: f64 = 200e-6;

/// Image width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    /// Columns
    pub width: u32,
    /// Rows
    pub height: u32,
}

impl ImageSize {
    /// Create a size.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Pixels per image.
    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Pixel format of delivered frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    /// 16-bit unsigned
    Bpp16,
}

impl ImageType {
    /// Bytes per pixel.
    pub fn depth(self) -> usize {
        match self {
            Self::Bpp16 => 2,
        }
    }
}

/// Geometry and identification read once at initialization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorInfo {
    max_size: ImageSize,
    system_id: u32,
    channel: CommChannel,
}

impl DetectorInfo {
    /// Build from the configuration read back after reset.
    pub fn new(config: &SensorConfiguration, channel: CommChannel) -> Self {
        Self {
            max_size: ImageSize::new(config.columns, config.rows),
            system_id: config.system_id,
            channel,
        }
    }

    /// Full sensor size.
    pub fn max_image_size(&self) -> ImageSize {
        self.max_size
    }

    /// Current image size. Binning and ROI are reset at init, so this is
    /// always the full sensor.
    pub fn detector_image_size(&self) -> ImageSize {
        self.max_size
    }

    /// Always [`ImageType::Bpp16`].
    pub fn image_type(&self) -> ImageType {
        ImageType::Bpp16
    }

    /// `"PerkinElmer"`.
    pub fn detector_type(&self) -> &'static str {
        "PerkinElmer"
    }

    /// Model string built from the system id.
    pub fn detector_model(&self) -> String {
        format!("XRD system id {:#06x}", self.system_id)
    }

    /// Raw system id.
    pub fn system_id(&self) -> u32 {
        self.system_id
    }

    /// Pixel size (x, y) in meters.
    pub fn pixel_size(&self) -> (f64, f64) {
        (PIXEL_SIZE, PIXEL_SIZE)
    }

    /// Communication channel the detector was opened on.
    pub fn comm_channel(&self) -> CommChannel {
        self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::BoardType;

    fn info() -> DetectorInfo {
        let config = SensorConfiguration {
            rows: 2048,
            columns: 1024,
            system_id: 0x0821,
            ..Default::default()
        };
        DetectorInfo::new(
            &config,
            CommChannel {
                board: BoardType::EltecXrdFgx,
                channel_id: 1,
            },
        )
    }

    #[test]
    fn test_geometry() {
        let info = info();
        assert_eq!(info.max_image_size(), ImageSize::new(1024, 2048));
        assert_eq!(info.detector_image_size(), info.max_image_size());
        assert_eq!(info.max_image_size().pixels(), 1024 * 2048);
    }

    #[test]
    fn test_identification() {
        let info = info();
        assert_eq!(info.detector_type(), "PerkinElmer");
        assert_eq!(info.detector_model(), "XRD system id 0x0821");
        assert_eq!(info.image_type().depth(), 2);
        assert_eq!(info.pixel_size(), (200e-6, 200e-6));
        assert_eq!(info.comm_channel().channel_id, 1);
    }
}
