//! Integer handles for hosts that cannot hold Rust values.

use crate::{
    backend::library::{BackendLoader, SharedLibrary},
    config::EncodeSessionConfig,
    device::{DeviceProvider, GraphicsDevice},
    encoder::EncodedPacket,
    frame_encoder::{FrameEncoder, SubmitOutcome},
    settings::PixelFormat,
    util::lock,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, Mutex,
    },
};

pub type EncoderId = i32;

type Texture<P> = <<P as DeviceProvider>::Device as GraphicsDevice>::Texture;
type SharedHandle<P> = <<P as DeviceProvider>::Device as GraphicsDevice>::SharedHandle;
type Entry<L, D> = Arc<Mutex<FrameEncoder<L, D>>>;

/// Owns every [`FrameEncoder`] created through it, keyed by an id that is never reused.
///
/// Lookups of unknown ids return `false`, `None` or `0`.
pub struct EncoderRegistry<P: DeviceProvider, L: BackendLoader> {
    provider: P,
    library: Arc<SharedLibrary<L>>,
    encoders: Mutex<HashMap<EncoderId, Entry<L, P::Device>>>,
    next_id: AtomicI32,
}

impl<P: DeviceProvider, L: BackendLoader> EncoderRegistry<P, L> {
    pub fn new(provider: P, library: Arc<SharedLibrary<L>>) -> Self {
        EncoderRegistry {
            provider,
            library,
            encoders: Mutex::new(HashMap::new()),
            next_id: AtomicI32::new(1),
        }
    }

    /// Creates an encoder and returns its id. The encoder is kept even if it failed to start,
    /// so the host can query the error.
    pub fn create(&self, config: EncodeSessionConfig) -> EncoderId {
        let encoder = FrameEncoder::new(config, &self.provider, Arc::clone(&self.library));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if !encoder.is_valid() {
            log::warn!("Encoder {id} was created in an invalid state");
        }
        lock(&self.encoders).insert(id, Arc::new(Mutex::new(encoder)));
        id
    }

    pub fn destroy(&self, id: EncoderId) -> bool {
        // Dropping joins the output thread, so it happens outside the lock. A call still
        // running on another thread drops the encoder when it finishes.
        let encoder = lock(&self.encoders).remove(&id);
        encoder.is_some()
    }

    pub fn len(&self) -> usize {
        lock(&self.encoders).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Runs `f` on encoder `id`. The map is only locked for the lookup, so a slow call such as
    /// a resize blocks just that encoder.
    fn with<R>(
        &self,
        id: EncoderId,
        f: impl FnOnce(&mut FrameEncoder<L, P::Device>) -> R,
    ) -> Option<R> {
        let entry = lock(&self.encoders).get(&id).map(Arc::clone)?;
        let mut encoder = lock(&entry);
        Some(f(&mut *encoder))
    }

    pub fn is_valid(&self, id: EncoderId) -> bool {
        self.with(id, |encoder| encoder.is_valid()).unwrap_or(false)
    }

    pub fn width(&self, id: EncoderId) -> u32 {
        self.with(id, |encoder| encoder.width()).unwrap_or(0)
    }

    pub fn height(&self, id: EncoderId) -> u32 {
        self.with(id, |encoder| encoder.height()).unwrap_or(0)
    }

    pub fn frame_rate(&self, id: EncoderId) -> u32 {
        self.with(id, |encoder| encoder.frame_rate()).unwrap_or(0)
    }

    pub fn format(&self, id: EncoderId) -> Option<PixelFormat> {
        self.with(id, |encoder| encoder.format())
    }

    /// `true` if the frame was queued or dropped because the encoder is busy.
    pub fn encode(&self, id: EncoderId, texture: &Texture<P>, force_idr: bool) -> bool {
        self.with(id, |encoder| encoder.submit(texture, force_idr))
            .map_or(false, handled)
    }

    pub fn encode_shared(&self, id: EncoderId, handle: SharedHandle<P>, force_idr: bool) -> bool {
        self.with(id, |encoder| encoder.submit_shared(handle, force_idr))
            .map_or(false, handled)
    }

    pub fn resize(&self, id: EncoderId, width: u32, height: u32) -> bool {
        self.with(id, |encoder| encoder.resize(width, height))
            .unwrap_or(false)
    }

    /// Moves the packets collected so far into the encoder's copy buffer, where
    /// [`with_encoded_data`](Self::with_encoded_data) reads them.
    pub fn copy_encoded_data(&self, id: EncoderId) -> bool {
        self.with(id, |encoder| {
            encoder.copy_encoded_data();
        })
        .is_some()
    }

    pub fn encoded_data_count(&self, id: EncoderId) -> usize {
        self.with(id, |encoder| encoder.encoded_data().len())
            .unwrap_or(0)
    }

    pub fn encoded_data_size(&self, id: EncoderId, index: usize) -> usize {
        self.with(id, |encoder| encoder.encoded_data().get(index).map(EncodedPacket::len))
            .flatten()
            .unwrap_or(0)
    }

    /// Runs `f` on packet `index` of the last copy.
    pub fn with_encoded_data<R>(
        &self,
        id: EncoderId,
        index: usize,
        f: impl FnOnce(&EncodedPacket) -> R,
    ) -> Option<R> {
        self.with(id, |encoder| encoder.encoded_data().get(index).map(f))
            .flatten()
    }

    pub fn error(&self, id: EncoderId) -> Option<String> {
        self.with(id, |encoder| encoder.error()).flatten()
    }

    pub fn has_error(&self, id: EncoderId) -> bool {
        self.with(id, |encoder| encoder.has_error())
            .unwrap_or(false)
    }

    pub fn clear_error(&self, id: EncoderId) -> bool {
        self.with(id, |encoder| encoder.clear_error()).is_some()
    }

    pub fn set_primary_source(&self, id: EncoderId, texture: Texture<P>) -> bool {
        self.with(id, |encoder| encoder.set_primary_source(texture))
            .is_some()
    }

    pub fn encode_primary_source(&self, id: EncoderId) -> bool {
        self.with(id, |encoder| encoder.encode_primary_source())
            .map_or(false, handled)
    }
}

fn handled(outcome: SubmitOutcome) -> bool {
    !matches!(outcome, SubmitOutcome::Failed)
}
