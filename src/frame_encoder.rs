//! Owns an [`EncodeSession`] and the thread that drains it.

use crate::{
    backend::library::{BackendLoader, SharedLibrary},
    config::EncodeSessionConfig,
    device::{DeviceProvider, GraphicsDevice},
    encoder::{EncodeSession, EncodedPacket, SubmitStatus},
    settings::PixelFormat,
    util::lock,
    EncoderError, Result,
};
use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, PoisonError},
    thread::{self, JoinHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Uninitialized,
    DeviceReady,
    SessionReady,
    /// The output thread is up and frames can be submitted.
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { index: u64 },
    /// Every slot is still being encoded and the frame was dropped.
    Busy,
    /// See [`FrameEncoder::error`].
    Failed,
}

#[derive(Default)]
struct WakeFlags {
    requested: bool,
    stop: bool,
}

struct Shared<L: BackendLoader, D: GraphicsDevice> {
    session: EncodeSession<L, D>,
    wake: Mutex<WakeFlags>,
    condvar: Condvar,
    output: Mutex<Vec<EncodedPacket>>,
}

type LastError = Arc<Mutex<Option<String>>>;

/// Encodes textures submitted from the render thread and collects the packets on a thread of
/// its own.
///
/// None of the methods return errors. Failures are logged and kept as the last error.
pub struct FrameEncoder<L: BackendLoader, D: GraphicsDevice> {
    config: EncodeSessionConfig,
    state: EncoderState,
    device: Option<Arc<D>>,
    shared: Option<Arc<Shared<L, D>>>,
    consumer: Option<JoinHandle<()>>,
    copied: Vec<EncodedPacket>,
    primary_source: Option<D::Texture>,
    last_error: LastError,
}

impl<L: BackendLoader, D: GraphicsDevice> FrameEncoder<L, D> {
    /// Acquires a device, initializes an encode session on it and starts the output thread.
    ///
    /// If any step fails the encoder is returned anyway; [`is_valid`](Self::is_valid) is
    /// `false` and [`error`](Self::error) says why.
    pub fn new<P>(
        config: EncodeSessionConfig,
        provider: &P,
        library: Arc<SharedLibrary<L>>,
    ) -> Self
    where
        P: DeviceProvider<Device = D> + ?Sized,
    {
        let mut encoder = FrameEncoder {
            config,
            state: EncoderState::Uninitialized,
            device: None,
            shared: None,
            consumer: None,
            copied: Vec::new(),
            primary_source: None,
            last_error: Arc::new(Mutex::new(None)),
        };

        if let Err(e) = encoder.start(provider, library) {
            record(&encoder.last_error, &e);
        }
        encoder
    }

    fn start<P>(&mut self, provider: &P, library: Arc<SharedLibrary<L>>) -> Result<()>
    where
        P: DeviceProvider<Device = D> + ?Sized,
    {
        self.config.validate()?;

        let device = provider.acquire_device()?;
        self.device = Some(Arc::clone(&device));
        self.state = EncoderState::DeviceReady;

        let session = EncodeSession::new(self.config.clone(), device, library);
        session.initialize()?;
        self.state = EncoderState::SessionReady;

        let shared = Arc::new(Shared {
            session,
            wake: Mutex::new(WakeFlags::default()),
            condvar: Condvar::new(),
            output: Mutex::new(Vec::new()),
        });
        let consumer = {
            let shared = Arc::clone(&shared);
            let last_error = Arc::clone(&self.last_error);
            thread::Builder::new()
                .name("encoder-output".to_string())
                .spawn(move || run_consumer(&*shared, &*last_error))
                .map_err(EncoderError::OutputThread)?
        };

        self.shared = Some(shared);
        self.consumer = Some(consumer);
        self.state = EncoderState::Running;
        log::debug!(
            "Frame encoder running at {}x{}",
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    /// Queues `texture` for encoding. It is copied before this returns.
    pub fn submit(&self, texture: &D::Texture, force_idr: bool) -> SubmitOutcome {
        let Some(shared) = self.running() else {
            return SubmitOutcome::Failed;
        };

        match shared.session.submit(texture, force_idr) {
            Ok(SubmitStatus::Accepted { index }) => {
                self.request_output();
                SubmitOutcome::Accepted { index }
            }
            Ok(SubmitStatus::SlotBusy) => {
                // Draining is what frees the slot
                self.request_output();
                SubmitOutcome::Busy
            }
            Err(e) => {
                record(&self.last_error, &e);
                SubmitOutcome::Failed
            }
        }
    }

    /// Opens a texture another process or device shared and queues it.
    pub fn submit_shared(&self, handle: D::SharedHandle, force_idr: bool) -> SubmitOutcome {
        let Some(device) = &self.device else {
            record(&self.last_error, &EncoderError::NotInitialized);
            return SubmitOutcome::Failed;
        };
        match device.open_shared_texture(handle) {
            Ok(texture) => self.submit(&texture, force_idr),
            Err(e) => {
                record(&self.last_error, &e);
                SubmitOutcome::Failed
            }
        }
    }

    /// Wakes the output thread. Does not wait for it.
    pub fn request_output(&self) {
        if let Some(shared) = &self.shared {
            lock(&shared.wake).requested = true;
            shared.condvar.notify_one();
        }
    }

    /// Takes every packet collected so far. They stay available through
    /// [`encoded_data`](Self::encoded_data) until the next call.
    pub fn copy_encoded_data(&mut self) -> &[EncodedPacket] {
        self.copied.clear();
        if let Some(shared) = &self.shared {
            std::mem::swap(&mut *lock(&shared.output), &mut self.copied);
        }
        &self.copied
    }

    /// Packets returned by the last [`copy_encoded_data`](Self::copy_encoded_data).
    pub fn encoded_data(&self) -> &[EncodedPacket] {
        &self.copied
    }

    pub fn take_encoded_data(&mut self) -> Vec<EncodedPacket> {
        match &self.shared {
            Some(shared) => std::mem::take(&mut *lock(&shared.output)),
            None => Vec::new(),
        }
    }

    /// Changes the encoded size. Frames submitted before the call are still delivered.
    pub fn resize(&mut self, width: u32, height: u32) -> bool {
        let result = match self.running() {
            Some(shared) => shared
                .session
                .resize(width, height)
                .map(|()| shared.session.config()),
            None => return false,
        };

        match result {
            Ok(config) => {
                self.config = config;
                // Packets flushed by the resize wait in the session until the next drain
                self.request_output();
                true
            }
            Err(e) => {
                record(&self.last_error, &e);
                false
            }
        }
    }

    /// Remembers the texture the host renders into, for
    /// [`encode_primary_source`](Self::encode_primary_source).
    pub fn set_primary_source(&mut self, texture: D::Texture) {
        self.primary_source = Some(texture);
    }

    pub fn encode_primary_source(&self) -> SubmitOutcome {
        match &self.primary_source {
            Some(texture) => self.submit(texture, false),
            None => {
                record(&self.last_error, &"no primary source texture has been set");
                SubmitOutcome::Failed
            }
        }
    }

    pub fn error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    pub fn has_error(&self) -> bool {
        lock(&self.last_error).is_some()
    }

    pub fn clear_error(&self) {
        *lock(&self.last_error) = None;
    }

    pub fn is_valid(&self) -> bool {
        self.state == EncoderState::Running
            && self
                .shared
                .as_ref()
                .map_or(false, |shared| shared.session.is_usable())
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn config(&self) -> &EncodeSessionConfig {
        &self.config
    }

    pub fn width(&self) -> u32 {
        self.config.width
    }

    pub fn height(&self) -> u32 {
        self.config.height
    }

    pub fn frame_rate(&self) -> u32 {
        self.config.frame_rate
    }

    pub fn format(&self) -> PixelFormat {
        self.config.format
    }

    pub fn device(&self) -> Option<&Arc<D>> {
        self.device.as_ref()
    }

    fn running(&self) -> Option<&Shared<L, D>> {
        match &self.shared {
            Some(shared) if self.state == EncoderState::Running => Some(shared),
            _ => {
                record(&self.last_error, &EncoderError::NotInitialized);
                None
            }
        }
    }

    fn stop(&mut self) {
        if let Some(shared) = &self.shared {
            lock(&shared.wake).stop = true;
            shared.condvar.notify_all();
        }
        if let Some(consumer) = self.consumer.take() {
            if consumer.join().is_err() {
                record(&self.last_error, &"encoder output thread panicked");
            }
        }
        if let Some(shared) = self.shared.take() {
            if let Err(e) = shared.session.finalize() {
                record(&self.last_error, &e);
            }
        }
        self.primary_source = None;
        self.device = None;

        if self.state != EncoderState::Uninitialized {
            log::debug!("Frame encoder stopped");
        }
        self.state = EncoderState::Stopped;
    }
}

impl<L: BackendLoader, D: GraphicsDevice> Drop for FrameEncoder<L, D> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn record(last_error: &Mutex<Option<String>>, error: &dyn fmt::Display) {
    let message = error.to_string();
    log::error!("{message}");
    *lock(last_error) = Some(message);
}

fn run_consumer<L: BackendLoader, D: GraphicsDevice>(
    shared: &Shared<L, D>,
    last_error: &Mutex<Option<String>>,
) {
    let mut packets = Vec::new();

    loop {
        {
            let flags = lock(&shared.wake);
            let mut flags = shared
                .condvar
                .wait_while(flags, |flags| !flags.requested && !flags.stop)
                .unwrap_or_else(PoisonError::into_inner);
            if flags.stop {
                break;
            }
            flags.requested = false;
        }

        if let Err(e) = shared.session.drain(&mut packets) {
            record(last_error, &e);
        }
        if !packets.is_empty() {
            log::trace!("Collected {} packets", packets.len());
            lock(&shared.output).append(&mut packets);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::software::{SoftwareLoader, SoftwareOptions},
        device::{
            software::{SoftwareDevice, SoftwareTexture},
            TextureDesc,
        },
    };
    use std::time::{Duration, Instant};

    type Encoder = FrameEncoder<SoftwareLoader, SoftwareDevice>;

    fn small_config() -> EncodeSessionConfig {
        EncodeSessionConfig::new(320, 240, 30, PixelFormat::Rgba8)
    }

    fn library() -> Arc<SharedLibrary<SoftwareLoader>> {
        Arc::new(SharedLibrary::new(SoftwareLoader::default()))
    }

    fn texture(device: &SoftwareDevice, width: u32, height: u32) -> SoftwareTexture {
        device.create_texture(&TextureDesc {
            width,
            height,
            format: PixelFormat::Rgba8,
        })
    }

    fn collect(encoder: &mut Encoder, count: usize) -> Vec<EncodedPacket> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut packets = Vec::new();
        while packets.len() < count && Instant::now() < deadline {
            encoder.request_output();
            packets.extend_from_slice(encoder.copy_encoded_data());
            thread::sleep(Duration::from_millis(1));
        }
        packets
    }

    #[test]
    fn output_thread_collects_packets() {
        let device = Arc::new(SoftwareDevice::new());
        let mut encoder = Encoder::new(small_config(), &device, library());
        assert!(encoder.is_valid(), "{:?}", encoder.error());
        assert_eq!(encoder.state(), EncoderState::Running);

        let frame = texture(&device, 320, 240);
        for expected in 0..3 {
            assert_eq!(
                encoder.submit(&frame, false),
                SubmitOutcome::Accepted { index: expected }
            );
        }

        let packets = collect(&mut encoder, 3);
        let indices: Vec<u64> = packets.iter().map(|packet| packet.index).collect();
        assert_eq!(indices, [0, 1, 2]);
        assert!(!encoder.has_error());
    }

    #[test]
    fn invalid_config_leaves_encoder_invalid() {
        let device = Arc::new(SoftwareDevice::new());
        let config = EncodeSessionConfig {
            frame_rate: 0,
            ..small_config()
        };
        let encoder = Encoder::new(config, &device, library());

        assert!(!encoder.is_valid());
        assert_eq!(encoder.state(), EncoderState::Uninitialized);
        assert!(encoder.has_error());

        encoder.clear_error();
        let frame = texture(&device, 320, 240);
        assert_eq!(encoder.submit(&frame, false), SubmitOutcome::Failed);
        assert!(encoder.has_error());
    }

    #[test]
    fn old_driver_stops_after_device() {
        let device = Arc::new(SoftwareDevice::new());
        let library = Arc::new(SharedLibrary::new(SoftwareLoader::new(SoftwareOptions {
            max_supported_version: 10 << 4,
            ..Default::default()
        })));
        let encoder = Encoder::new(small_config(), &device, Arc::clone(&library));

        assert!(!encoder.is_valid());
        assert_eq!(encoder.state(), EncoderState::DeviceReady);
        assert!(encoder.error().is_some());
        assert!(!library.is_loaded());
    }

    #[test]
    fn resize_changes_reported_size() {
        let device = Arc::new(SoftwareDevice::new());
        let mut encoder = Encoder::new(small_config(), &device, library());
        let small = texture(&device, 320, 240);
        encoder.submit(&small, false);

        assert!(encoder.resize(640, 480));
        assert_eq!((encoder.width(), encoder.height()), (640, 480));

        // The mismatched texture is rejected by the copy
        assert_eq!(encoder.submit(&small, false), SubmitOutcome::Failed);
        encoder.clear_error();
        let large = texture(&device, 640, 480);
        assert!(matches!(
            encoder.submit(&large, false),
            SubmitOutcome::Accepted { .. }
        ));

        let packets = collect(&mut encoder, 2);
        assert_eq!(packets.len(), 2);
        assert!(packets[1].is_keyframe());

        assert!(!encoder.resize(0, 480));
        assert!(encoder.has_error());
        assert!(encoder.is_valid());
    }

    #[test]
    fn primary_source() {
        let device = Arc::new(SoftwareDevice::new());
        let mut encoder = Encoder::new(small_config(), &device, library());
        assert_eq!(encoder.encode_primary_source(), SubmitOutcome::Failed);

        encoder.clear_error();
        encoder.set_primary_source(texture(&device, 320, 240));
        assert_eq!(
            encoder.encode_primary_source(),
            SubmitOutcome::Accepted { index: 0 }
        );
        assert!(!encoder.has_error());
    }

    #[test]
    fn submit_shared_opens_the_handle() {
        let device = Arc::new(SoftwareDevice::new());
        let mut encoder = Encoder::new(small_config(), &device, library());
        let (_texture, handle) = device
            .create_shared_texture(&TextureDesc {
                width: 320,
                height: 240,
                format: PixelFormat::Rgba8,
            })
            .unwrap();

        assert_eq!(
            encoder.submit_shared(handle, true),
            SubmitOutcome::Accepted { index: 0 }
        );
        let packets = collect(&mut encoder, 1);
        assert!(packets[0].is_keyframe());
    }

    #[test]
    fn drop_releases_everything() {
        let device = Arc::new(SoftwareDevice::new());
        let library = library();
        {
            let encoder = Encoder::new(small_config(), &device, Arc::clone(&library));
            let frame = texture(&device, 320, 240);
            encoder.submit(&frame, false);
            assert!(library.is_loaded());
        }
        assert!(!library.is_loaded());
        assert_eq!(library.ref_count(), 0);
        assert_eq!(device.live_shared_textures(), 0);
        assert_eq!(Arc::strong_count(&device), 1);
    }
}
