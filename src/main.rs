use anyhow::{bail, Context};
use nvenc_pipeline::{
    backend::{
        library::SharedLibrary,
        software::{SoftwareLoader, SoftwareOptions},
    },
    device::{software::SoftwareDevice, TextureDesc},
    EncodeSessionConfig, FrameEncoder, SubmitOutcome,
};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

const DEFAULT_FRAMES: u64 = 120;

/// Encodes synthetic frames with the software encoder and writes the Annex-B stream to a file.
///
/// Usage: `encode-demo [frames] [output] [config.json]`
fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let frames = match args.next() {
        Some(frames) => frames
            .parse()
            .with_context(|| format!("invalid frame count `{frames}`"))?,
        None => DEFAULT_FRAMES,
    };
    let output = PathBuf::from(args.next().unwrap_or_else(|| "out.h264".to_string()));
    let config = match args.next() {
        Some(path) => {
            let json = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            EncodeSessionConfig::from_json(&json)?
        }
        None => EncodeSessionConfig::default(),
    };

    let device = Arc::new(SoftwareDevice::new());
    let library = Arc::new(SharedLibrary::new(SoftwareLoader::new(SoftwareOptions {
        encode_latency: Duration::from_millis(2),
        ..Default::default()
    })));
    let mut encoder = FrameEncoder::new(config.clone(), &device, library);
    if !encoder.is_valid() {
        bail!(
            "encoder failed to start: {}",
            encoder.error().unwrap_or_default()
        );
    }

    let frame = device.create_texture(&TextureDesc {
        width: config.width,
        height: config.height,
        format: config.format,
    });
    let mut file = BufWriter::new(
        File::create(&output).with_context(|| format!("creating {}", output.display()))?,
    );

    let frame_interval = Duration::from_secs(1) / config.frame_rate;
    let keyframe_interval = u64::from(config.frame_rate);
    let mut accepted = 0;
    let mut written = 0;
    let mut bytes = 0;

    for i in 0..frames {
        frame.set_tag(i);
        match encoder.submit(&frame, i > 0 && i % keyframe_interval == 0) {
            SubmitOutcome::Accepted { .. } => accepted += 1,
            SubmitOutcome::Busy => log::warn!("Encoder busy, dropped frame {i}"),
            SubmitOutcome::Failed => {
                log::error!("Frame {i}: {}", encoder.error().unwrap_or_default());
                encoder.clear_error();
            }
        }

        for packet in encoder.copy_encoded_data() {
            file.write_all(&packet.data)?;
            written += 1;
            bytes += packet.len();
        }
        thread::sleep(frame_interval);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while written < accepted && Instant::now() < deadline {
        encoder.request_output();
        for packet in encoder.copy_encoded_data() {
            file.write_all(&packet.data)?;
            written += 1;
            bytes += packet.len();
        }
        thread::sleep(Duration::from_millis(1));
    }
    file.flush()?;

    log::info!(
        "Wrote {written} of {accepted} frames ({bytes} bytes) to {}",
        output.display()
    );
    if written < accepted {
        bail!("{} frames never came out of the encoder", accepted - written);
    }
    Ok(())
}
