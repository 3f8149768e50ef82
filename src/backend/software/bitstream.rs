//! Synthetic Annex-B access units.
//!
//! The NAL headers are real so that parsers, packetizers and keyframe detection work on the
//! output. The payloads only identify the frame.

use crate::{
    config::InitializeParams,
    settings::Codec,
};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct AccessUnit {
    pub frame_idx: u32,
    pub idr: bool,
    pub parameter_sets: bool,
}

pub(super) fn write_access_unit(out: &mut Vec<u8>, params: &InitializeParams, unit: AccessUnit) {
    match params.codec {
        Codec::Hevc => write_hevc(out, params, unit),
        _ => write_h264(out, params, unit),
    }
}

fn write_h264(out: &mut Vec<u8>, params: &InitializeParams, unit: AccessUnit) {
    if unit.parameter_sets {
        // SPS: profile_idc, constraint flags, level_idc
        let profile_idc = params.encode_config.profile.profile_idc();
        write_nal(
            out,
            &[0x67],
            &[
                &[profile_idc, 0x00, level_idc(params)][..],
                &size_payload(params)[..],
            ]
            .concat(),
        );
        // PPS
        write_nal(out, &[0x68], &[0xce, 0x3c, 0x80]);
    }

    let header = if unit.idr { 0x65 } else { 0x41 };
    write_nal(out, &[header], &slice_payload(unit));
}

fn write_hevc(out: &mut Vec<u8>, params: &InitializeParams, unit: AccessUnit) {
    if unit.parameter_sets {
        let profile_idc = params.encode_config.profile.profile_idc();
        // VPS, SPS, PPS
        write_nal(out, &[0x40, 0x01], &[0x0c, 0x01, 0xff, 0xff]);
        write_nal(
            out,
            &[0x42, 0x01],
            &[&[0x01, profile_idc][..], &size_payload(params)[..]].concat(),
        );
        write_nal(out, &[0x44, 0x01], &[0xc1, 0x72, 0xb4]);
    }

    // IDR_W_RADL or TRAIL_R
    let header = if unit.idr { [0x26, 0x01] } else { [0x02, 0x01] };
    write_nal(out, &header, &slice_payload(unit));
}

fn size_payload(params: &InitializeParams) -> Vec<u8> {
    let width = params.encode_width.to_be_bytes();
    let height = params.encode_height.to_be_bytes();
    [width, height].concat()
}

fn slice_payload(unit: AccessUnit) -> Vec<u8> {
    // Keyframes are noticeably larger than predicted frames
    let body_len = if unit.idr { 96 } else { 24 };
    let mut payload = Vec::with_capacity(4 + body_len);
    payload.extend_from_slice(&unit.frame_idx.to_be_bytes());
    payload.extend((0..body_len).map(|i| (i as u8).wrapping_mul(37) ^ unit.frame_idx as u8));
    payload
}

/// 1080p60 needs level 4.2, anything larger 5.1.
fn level_idc(params: &InitializeParams) -> u8 {
    let area = params.encode_width * params.encode_height;
    if area <= 1280 * 720 {
        31
    } else if area <= 1920 * 1088 {
        42
    } else {
        51
    }
}

/// Writes a start code, the NAL header and the payload with emulation prevention bytes.
fn write_nal(out: &mut Vec<u8>, header: &[u8], payload: &[u8]) {
    out.extend_from_slice(&START_CODE);
    out.extend_from_slice(header);

    let mut zeros = 0;
    for &byte in payload {
        if zeros >= 2 && byte <= 3 {
            out.push(0x03);
            zeros = 0;
        }
        out.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    // rbsp trailing bits
    out.push(0x80);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{EncodeConfig, EncodeSessionConfig},
        settings::{CodecProfile, EncodePreset},
    };

    fn params(codec: Codec) -> InitializeParams {
        let config = EncodeSessionConfig {
            codec,
            profile: CodecProfile::Autoselect,
            ..Default::default()
        };
        let preset = EncodeConfig::preset_default(codec, EncodePreset::LowLatencyDefault);
        InitializeParams::derive(&config, &preset)
    }

    fn start_code_offsets(data: &[u8]) -> Vec<usize> {
        data.windows(4)
            .enumerate()
            .filter(|(_, window)| *window == START_CODE)
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn h264_keyframe_with_parameter_sets() {
        let mut out = Vec::new();
        let unit = AccessUnit {
            frame_idx: 0,
            idr: true,
            parameter_sets: true,
        };
        write_access_unit(&mut out, &params(Codec::H264), unit);

        let offsets = start_code_offsets(&out);
        let nal_types: Vec<u8> = offsets.iter().map(|&i| out[i + 4] & 0x1f).collect();
        assert_eq!(nal_types, [7, 8, 5]);
    }

    #[test]
    fn h264_predicted_frame() {
        let mut out = Vec::new();
        let unit = AccessUnit {
            frame_idx: 7,
            idr: false,
            parameter_sets: false,
        };
        write_access_unit(&mut out, &params(Codec::H264), unit);
        assert_eq!(&out[..5], &[0, 0, 0, 1, 0x41]);
        assert_eq!(start_code_offsets(&out), [0]);
    }

    #[test]
    fn hevc_keyframe_with_parameter_sets() {
        let mut out = Vec::new();
        let unit = AccessUnit {
            frame_idx: 3,
            idr: true,
            parameter_sets: true,
        };
        write_access_unit(&mut out, &params(Codec::Hevc), unit);

        let nal_types: Vec<u8> = start_code_offsets(&out)
            .iter()
            .map(|&i| (out[i + 4] >> 1) & 0x3f)
            .collect();
        assert_eq!(nal_types, [32, 33, 34, 19]);
    }

    #[test]
    fn payload_never_emulates_start_code() {
        let mut out = Vec::new();
        // Frame index 0x00000001 puts 00 00 00 01 into the payload
        let unit = AccessUnit {
            frame_idx: 1,
            idr: false,
            parameter_sets: false,
        };
        write_access_unit(&mut out, &params(Codec::H264), unit);
        assert_eq!(start_code_offsets(&out), [0]);
        assert!(out[5..].windows(3).all(|w| w != [0, 0, 1]));
    }
}
