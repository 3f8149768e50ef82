//! Asynchronous hardware video encoding of rendered frames.
//!
//! Frames go through a fixed ring of GPU-side slots: [`EncodeSession`] copies each submitted
//! texture into the next free slot and hands it to the encoder, and the bitstream is drained in
//! submission order once the slot's completion event fires. [`FrameEncoder`] runs the draining
//! on a thread of its own and [`EncoderRegistry`] exposes encoders through integer ids.

pub mod backend;
pub mod config;
pub mod device;
pub mod encoder;
mod error;
pub mod event;
pub mod frame_encoder;
pub mod os;
pub mod registry;
pub mod settings;
mod util;

pub use config::EncodeSessionConfig;
pub use encoder::{EncodeSession, EncodedPacket, SubmitStatus};
pub use error::{EncoderError, ErrorKind, NvEncStatus, Result};
pub use frame_encoder::{EncoderState, FrameEncoder, SubmitOutcome};
pub use registry::{EncoderId, EncoderRegistry};
pub use settings::{Codec, CodecProfile, EncodePreset, PixelFormat, TuningInfo};
