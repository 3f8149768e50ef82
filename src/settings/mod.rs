use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Codec {
    H264,
    Hevc,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum CodecProfile {
    Autoselect,
    H264Baseline,
    H264Main,
    H264High,
    H264High444,
    H264ProgressiveHigh,
    H264ConstrainedHigh,
    HevcMain,
    HevcMain10,
    HevcFrext,
}

impl CodecProfile {
    /// The codec this profile belongs to. `None` for [`CodecProfile::Autoselect`].
    pub fn codec(self) -> Option<Codec> {
        match self {
            CodecProfile::Autoselect => None,
            CodecProfile::H264Baseline
            | CodecProfile::H264Main
            | CodecProfile::H264High
            | CodecProfile::H264High444
            | CodecProfile::H264ProgressiveHigh
            | CodecProfile::H264ConstrainedHigh => Some(Codec::H264),
            CodecProfile::HevcMain | CodecProfile::HevcMain10 | CodecProfile::HevcFrext => {
                Some(Codec::Hevc)
            }
        }
    }

    /// `profile_idc` written into the sequence parameter set.
    pub fn profile_idc(self) -> u8 {
        match self {
            CodecProfile::Autoselect | CodecProfile::H264Main => 77,
            CodecProfile::H264Baseline => 66,
            CodecProfile::H264High
            | CodecProfile::H264ProgressiveHigh
            | CodecProfile::H264ConstrainedHigh => 100,
            CodecProfile::H264High444 => 244,
            CodecProfile::HevcMain => 1,
            CodecProfile::HevcMain10 => 2,
            CodecProfile::HevcFrext => 4,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum EncodePreset {
    DefaultPreset,
    Hp,
    Hq,
    Bd,
    LowLatencyDefault,
    LowLatencyHq,
    LowLatencyHp,
    LosslessDefault,
    LosslessHp,
    Streaming,
    P1,
    P2,
    P3,
    P4,
    P5,
    P6,
    P7,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TuningInfo {
    Undefined,
    HighQuality,
    LowLatency,
    UltraLowLatency,
    Lossless,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateControlMode {
    ConstQp,
    Vbr,
    Cbr,
}

/// Format of the textures handed to the encoder.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// `DXGI_FORMAT_R8G8B8A8_UNORM`
    Rgba8,
    /// `DXGI_FORMAT_B8G8R8A8_UNORM`
    Bgra8,
    /// `DXGI_FORMAT_R10G10B10A2_UNORM`
    Rgb10A2,
}

impl PixelFormat {
    /// Word-ordered buffer format the encoder expects for textures of this format.
    pub fn buffer_format(self) -> BufferFormat {
        match self {
            PixelFormat::Rgba8 => BufferFormat::Abgr,
            PixelFormat::Bgra8 => BufferFormat::Argb,
            PixelFormat::Rgb10A2 => BufferFormat::Abgr10,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        4
    }
}

/// `NV_ENC_BUFFER_FORMAT` subset for RGB inputs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BufferFormat {
    Argb,
    Abgr,
    Abgr10,
}
