mod params;

pub use params::{
    CodecConfig, EncodeConfig, GopLength, H264Config, HevcConfig, InitializeParams,
    RateControlParams, ReconfigureParams,
};

use crate::{
    settings::{Codec, CodecProfile, EncodePreset, PixelFormat, TuningInfo},
    EncoderError, Result,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest frame the encoder is initialized for. Resizing beyond it is rejected.
pub const MAX_ENCODE_WIDTH: u32 = 4096;
pub const MAX_ENCODE_HEIGHT: u32 = 4096;

/// Settings of one encode session.
///
/// Only `width` and `height` change after creation, and only through a resize. Everything the
/// backend receives is derived from this struct on every initialize and reconfigure call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeSessionConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub format: PixelFormat,
    /// Number of resource slots in the ring.
    pub ring_size: usize,
    /// Upper bound on the wait for a single frame's completion signal.
    pub completion_timeout_ms: u64,
    pub codec: Codec,
    pub preset: EncodePreset,
    pub profile: CodecProfile,
    pub tuning_info: TuningInfo,
}

impl Default for EncodeSessionConfig {
    fn default() -> Self {
        EncodeSessionConfig {
            width: 1920,
            height: 1080,
            frame_rate: 60,
            format: PixelFormat::Rgba8,
            ring_size: 4,
            completion_timeout_ms: 10_000,
            codec: Codec::H264,
            preset: EncodePreset::LowLatencyDefault,
            profile: CodecProfile::H264Baseline,
            tuning_info: TuningInfo::Undefined,
        }
    }
}

impl EncodeSessionConfig {
    pub fn new(width: u32, height: u32, frame_rate: u32, format: PixelFormat) -> Self {
        EncodeSessionConfig {
            width,
            height,
            frame_rate,
            format,
            ..Default::default()
        }
    }

    /// Parses a JSON document. Missing fields take their default values.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| EncoderError::InvalidConfig(e.to_string()))
    }

    #[inline]
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    /// Copy of this configuration with a different frame size.
    pub fn with_size(&self, width: u32, height: u32) -> Self {
        EncodeSessionConfig {
            width,
            height,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_size(self.width, self.height)?;
        if self.frame_rate == 0 {
            return Err(EncoderError::InvalidConfig(
                "frame rate must be positive".to_string(),
            ));
        }
        if self.ring_size == 0 {
            return Err(EncoderError::InvalidConfig(
                "ring size must be at least 1".to_string(),
            ));
        }
        if let Some(codec) = self.profile.codec() {
            if codec != self.codec {
                return Err(EncoderError::InvalidConfig(format!(
                    "profile {:?} cannot be used with codec {:?}",
                    self.profile, self.codec
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn validate_size(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(EncoderError::InvalidConfig(format!(
            "frame size {width}x{height} has a zero dimension"
        )));
    }
    if width > MAX_ENCODE_WIDTH || height > MAX_ENCODE_HEIGHT {
        return Err(EncoderError::InvalidConfig(format!(
            "frame size {width}x{height} exceeds {MAX_ENCODE_WIDTH}x{MAX_ENCODE_HEIGHT}"
        )));
    }
    Ok(())
}
