use super::{EncodeSessionConfig, MAX_ENCODE_HEIGHT, MAX_ENCODE_WIDTH};
use crate::settings::{
    BufferFormat, Codec, CodecProfile, EncodePreset, RateControlMode, TuningInfo,
};

const TARGET_QUALITY: u8 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GopLength {
    Infinite,
    Frames(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateControlParams {
    pub mode: RateControlMode,
    pub average_bit_rate: u32,
    pub max_bit_rate: u32,
    /// Target constant quality level for VBR, 0 lets the encoder choose.
    pub target_quality: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H264Config {
    /// Emit SPS/PPS with every IDR frame.
    pub repeat_sps_pps: bool,
    /// 0 lets the encoder choose.
    pub max_num_ref_frames: u32,
    pub idr_period: GopLength,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcConfig {
    /// Emit VPS/SPS/PPS with every IDR frame.
    pub repeat_sps_pps: bool,
    pub max_num_ref_frames_in_dpb: u32,
    pub idr_period: GopLength,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecConfig {
    H264(H264Config),
    Hevc(HevcConfig),
}

/// Counterpart of `NV_ENC_CONFIG`, as returned by the preset query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeConfig {
    pub profile: CodecProfile,
    pub gop_length: GopLength,
    pub frame_interval_p: u32,
    pub rate_control: RateControlParams,
    pub codec_config: CodecConfig,
}

impl EncodeConfig {
    /// Generic preset values for backends that have no preset table of their own.
    pub fn preset_default(codec: Codec, preset: EncodePreset) -> Self {
        let low_latency = matches!(
            preset,
            EncodePreset::LowLatencyDefault | EncodePreset::LowLatencyHp | EncodePreset::LowLatencyHq
        );
        let gop_length = if low_latency {
            GopLength::Infinite
        } else {
            GopLength::Frames(250)
        };
        let codec_config = match codec {
            Codec::Hevc => CodecConfig::Hevc(HevcConfig {
                repeat_sps_pps: false,
                max_num_ref_frames_in_dpb: 0,
                idr_period: gop_length,
            }),
            _ => CodecConfig::H264(H264Config {
                repeat_sps_pps: false,
                max_num_ref_frames: 0,
                idr_period: gop_length,
            }),
        };

        EncodeConfig {
            profile: CodecProfile::Autoselect,
            gop_length,
            frame_interval_p: if low_latency { 1 } else { 3 },
            rate_control: RateControlParams {
                mode: if low_latency {
                    RateControlMode::Cbr
                } else {
                    RateControlMode::Vbr
                },
                average_bit_rate: 5_000_000,
                max_bit_rate: 0,
                target_quality: 0,
            },
            codec_config,
        }
    }
}

/// Counterpart of `NV_ENC_INITIALIZE_PARAMS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeParams {
    pub codec: Codec,
    pub preset: EncodePreset,
    pub tuning_info: TuningInfo,
    pub encode_width: u32,
    pub encode_height: u32,
    pub dar_width: u32,
    pub dar_height: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    /// Picture type decision is left to the encoder.
    pub enable_ptd: bool,
    pub enable_encode_async: bool,
    pub enable_output_in_vidmem: bool,
    pub max_encode_width: u32,
    pub max_encode_height: u32,
    pub buffer_format: BufferFormat,
    pub encode_config: EncodeConfig,
}

impl InitializeParams {
    /// Builds the initialization parameters for `config` on top of the backend's preset
    /// configuration.
    pub fn derive(config: &EncodeSessionConfig, preset_config: &EncodeConfig) -> Self {
        let gcd = crate::util::gcd(config.width, config.height).max(1);

        let mut encode_config = preset_config.clone();
        encode_config.profile = config.profile;
        encode_config.frame_interval_p = 1;
        encode_config.gop_length = GopLength::Infinite;
        encode_config.rate_control = RateControlParams {
            mode: RateControlMode::Vbr,
            average_bit_rate: preset_config.rate_control.average_bit_rate,
            max_bit_rate: max_bit_rate(config.width, config.height),
            target_quality: TARGET_QUALITY,
        };
        encode_config.codec_config = match config.codec {
            Codec::Hevc => CodecConfig::Hevc(HevcConfig {
                repeat_sps_pps: true,
                max_num_ref_frames_in_dpb: 0,
                idr_period: encode_config.gop_length,
            }),
            _ => CodecConfig::H264(H264Config {
                repeat_sps_pps: true,
                max_num_ref_frames: 0,
                idr_period: encode_config.gop_length,
            }),
        };

        InitializeParams {
            codec: config.codec,
            preset: config.preset,
            tuning_info: config.tuning_info,
            encode_width: config.width,
            encode_height: config.height,
            dar_width: config.width / gcd,
            dar_height: config.height / gcd,
            frame_rate_num: config.frame_rate,
            frame_rate_den: 1,
            enable_ptd: true,
            enable_encode_async: true,
            enable_output_in_vidmem: false,
            max_encode_width: MAX_ENCODE_WIDTH,
            max_encode_height: MAX_ENCODE_HEIGHT,
            buffer_format: config.format.buffer_format(),
            encode_config,
        }
    }
}

/// Counterpart of `NV_ENC_RECONFIGURE_PARAMS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconfigureParams {
    pub reinit: InitializeParams,
    pub reset_encoder: bool,
    pub force_idr: bool,
}

impl ReconfigureParams {
    /// Reconfiguration to `config` that restarts the stream with an IDR frame.
    pub fn derive(config: &EncodeSessionConfig, preset_config: &EncodeConfig) -> Self {
        ReconfigureParams {
            reinit: InitializeParams::derive(config, preset_config),
            reset_encoder: true,
            force_idr: true,
        }
    }
}

/// 12 Mbps at 1080p, scaled by area in whole megabits.
fn max_bit_rate(width: u32, height: u32) -> u32 {
    let area = u64::from(width) * u64::from(height);
    let megabits = (12 * area / (1920 * 1080)).max(1);
    (megabits * 1_000_000).min(u64::from(u32::MAX)) as u32
}
