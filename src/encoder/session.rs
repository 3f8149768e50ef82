use super::{
    packet::EncodedPacket,
    slot::{keep_first, ResourceSlot},
};
use crate::{
    backend::{
        library::{BackendLoader, LibraryLease, SharedLibrary},
        BitstreamLock, BitstreamPtr, EncodeBackend, EncoderPtr, PicFlags, PicParams,
    },
    config::{validate_size, EncodeConfig, EncodeSessionConfig, InitializeParams, ReconfigureParams},
    device::GraphicsDevice,
    error::{BackendResultExt, NvEncStatus},
    event::{EventObjectTrait, WaitStatus},
    settings::BufferFormat,
    util::{lock, read, write},
    EncoderError, Result,
};
use bytes::Bytes;
use crossbeam_utils::CachePadded;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    /// The frame was queued under this input index.
    Accepted { index: u64 },
    /// The slot for the next frame is still being encoded. The frame was dropped.
    SlotBusy,
}

/// An encoder context and the ring of slots frames are encoded through.
///
/// Frames are submitted into the slot at `input_index % ring_size` and drained in the same
/// order from `output_index % ring_size`. Submit and drain may run on different threads.
pub struct EncodeSession<L: BackendLoader, D: GraphicsDevice> {
    library: Arc<SharedLibrary<L>>,
    device: Arc<D>,
    config: RwLock<EncodeSessionConfig>,
    active: RwLock<Option<Active<L, D>>>,
    /// Serializes drain passes with resize and finalize
    drain_lock: Mutex<()>,
    /// Packets drained while flushing, handed out by the next drain
    flushed: Mutex<Vec<EncodedPacket>>,
    /// A reconfiguration failed and the slots are unusable
    invalid: AtomicBool,
}

/// Everything that exists only between initialize and finalize.
struct Active<L: BackendLoader, D: GraphicsDevice> {
    backend: LibraryLease<L>,
    encoder: EncoderPtr,
    preset_config: EncodeConfig,
    slots: Box<[CachePadded<ResourceSlot<D>>]>,
    input_index: AtomicU64,
    output_index: AtomicU64,
}

impl<L: BackendLoader, D: GraphicsDevice> Active<L, D> {
    #[inline]
    fn slot(&self, index: u64) -> (usize, &ResourceSlot<D>) {
        let slot_index = (index % self.slots.len() as u64) as usize;
        (slot_index, &*self.slots[slot_index])
    }
}

impl<L: BackendLoader, D: GraphicsDevice> EncodeSession<L, D> {
    /// Creates an inert session. Nothing is acquired until [`initialize`](Self::initialize).
    pub fn new(
        config: EncodeSessionConfig,
        device: Arc<D>,
        library: Arc<SharedLibrary<L>>,
    ) -> Self {
        EncodeSession {
            library,
            device,
            config: RwLock::new(config),
            active: RwLock::new(None),
            drain_lock: Mutex::new(()),
            flushed: Mutex::new(Vec::new()),
            invalid: AtomicBool::new(false),
        }
    }

    /// Loads the backend, opens and initializes the encoder, and creates every slot.
    ///
    /// On failure everything acquired so far is released again. Does nothing if the session is
    /// already initialized.
    pub fn initialize(&self) -> Result<()> {
        let mut active = write(&self.active);
        if active.is_some() {
            return Ok(());
        }

        let config = read(&self.config).clone();
        config.validate()?;
        if !self.device.supports_format(config.format) {
            return Err(EncoderError::UnsupportedFormat(config.format));
        }

        let backend = self.library.acquire()?;
        let encoder = backend
            .open_encode_session(self.device.as_ptr(), D::device_type())
            .call("nvEncOpenEncodeSessionEx")?;

        let mut state = Active {
            backend,
            encoder,
            preset_config: EncodeConfig::preset_default(config.codec, config.preset),
            slots: Box::default(),
            input_index: AtomicU64::new(0),
            output_index: AtomicU64::new(0),
        };

        match self.build(&mut state, &config) {
            Ok(()) => {
                log::debug!(
                    "Encode session initialized: {}x{} @ {} fps, {} slots",
                    config.width,
                    config.height,
                    config.frame_rate,
                    config.ring_size
                );
                *active = Some(state);
                self.invalid.store(false, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to initialize the encode session: {e}");
                // Report the build failure rather than a teardown one
                let _ = self.teardown(state);
                Err(e)
            }
        }
    }

    fn build(&self, state: &mut Active<L, D>, config: &EncodeSessionConfig) -> Result<()> {
        state.preset_config = state
            .backend
            .get_encode_preset_config(
                state.encoder,
                config.codec,
                config.preset,
                config.tuning_info,
            )
            .call("nvEncGetEncodePresetConfigEx")?;

        let params = InitializeParams::derive(config, &state.preset_config);
        state
            .backend
            .initialize_encoder(state.encoder, &params)
            .call("nvEncInitializeEncoder")?;

        state.slots = (0..config.ring_size)
            .map(|_| ResourceSlot::new().map(CachePadded::new))
            .collect::<Result<_>>()?;

        let state = &*state;
        for slot in state.slots.iter() {
            slot.resources()
                .register_event(&*state.backend, state.encoder, slot.event())?;
        }
        for slot in state.slots.iter() {
            slot.resources().acquire_size_dependent(
                &self.device,
                &*state.backend,
                state.encoder,
                config,
            )?;
        }
        Ok(())
    }

    /// Releases every slot resource and the encoder in reverse order of acquisition. The
    /// backend lease is dropped last.
    fn teardown(&self, state: Active<L, D>) -> Result<()> {
        let mut result = Ok(());
        let backend = &*state.backend;

        for slot in state.slots.iter().rev() {
            keep_first(
                &mut result,
                slot.resources()
                    .release_size_dependent(backend, state.encoder),
            );
            slot.release();
        }
        for slot in state.slots.iter().rev() {
            keep_first(
                &mut result,
                slot.resources()
                    .unregister_event(backend, state.encoder, slot.event()),
            );
        }
        keep_first(
            &mut result,
            backend
                .destroy_encoder(state.encoder)
                .call("nvEncDestroyEncoder"),
        );

        result
    }

    /// Flushes the encoder with an end-of-stream picture and releases everything. Packets that
    /// come out of the flush are kept for the next [`drain`](Self::drain).
    ///
    /// Every resource is released even if some release fails; the first failure is returned.
    pub fn finalize(&self) -> Result<()> {
        let _drain = lock(&self.drain_lock);
        let mut active = write(&self.active);
        let Some(state) = active.take() else {
            return Ok(());
        };

        let mut result = Ok(());
        if !self.invalid.load(Ordering::Acquire) {
            let config = read(&self.config).clone();
            let mut flushed = Vec::new();
            keep_first(&mut result, self.flush(&state, &config, &mut flushed));
            lock(&self.flushed).append(&mut flushed);
        }
        keep_first(&mut result, self.teardown(state));
        self.invalid.store(false, Ordering::Release);

        log::debug!("Encode session finalized");
        result
    }

    /// Copies `source` into the next slot and queues it for encoding.
    ///
    /// `SlotBusy` is returned, without error, when that slot has not been drained yet. On error
    /// the frame is dropped and the input index does not advance.
    pub fn submit(&self, source: &D::Texture, force_idr: bool) -> Result<SubmitStatus> {
        let active = read(&self.active);
        let state = active.as_ref().ok_or(EncoderError::NotInitialized)?;
        if self.invalid.load(Ordering::Acquire) {
            return Err(EncoderError::SessionInvalid);
        }
        // Held for the whole submission so a resize cannot swap the slot textures underneath
        let config = read(&self.config);

        let index = state.input_index.load(Ordering::Acquire);
        let (slot_index, slot) = state.slot(index);
        if !slot.try_claim() {
            log::trace!("Slot {slot_index} is still being encoded, dropping frame {index}");
            return Ok(SubmitStatus::SlotBusy);
        }

        match self.encode_into(state, slot_index, slot, index, source, force_idr, &config) {
            Ok(()) => {
                state.input_index.store(index + 1, Ordering::Release);
                log::trace!("Submitted frame {index} into slot {slot_index}");
                Ok(SubmitStatus::Accepted { index })
            }
            Err(e) => {
                slot.release();
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn encode_into(
        &self,
        state: &Active<L, D>,
        slot_index: usize,
        slot: &ResourceSlot<D>,
        index: u64,
        source: &D::Texture,
        force_idr: bool,
        config: &EncodeSessionConfig,
    ) -> Result<()> {
        let mut resources = slot.resources();

        let surface = resources
            .input_surface
            .as_ref()
            .ok_or(EncoderError::NotInitialized)?;
        self.device.copy_texture(surface, source)?;
        self.device.flush();

        if resources.mapped.is_some() {
            return Err(EncoderError::AlreadyMapped { slot: slot_index });
        }
        let registered = resources.registered.ok_or(EncoderError::NotInitialized)?;
        let output = resources.output.ok_or(EncoderError::NotInitialized)?;

        // Drops a completion that arrived after its wait timed out. One arriving later still
        // is recognized by its timestamp when the slot is drained.
        slot.event().reset()?;

        let mapped = state
            .backend
            .map_input_resource(state.encoder, registered)
            .call("nvEncMapInputResource")?;
        resources.mapped = Some(mapped);
        resources.end_of_stream = false;

        let flags = if force_idr {
            PicFlags::FORCE_IDR | PicFlags::OUTPUT_SPSPPS
        } else {
            PicFlags::NONE
        };
        let params = PicParams {
            input: Some(mapped),
            output: Some(output),
            completion_event: Arc::clone(slot.event()),
            input_width: config.width,
            input_height: config.height,
            buffer_format: config.format.buffer_format(),
            frame_idx: index as u32,
            input_timestamp: index,
            flags,
        };

        match state.backend.encode_picture(state.encoder, &params) {
            Ok(()) | Err(NvEncStatus::NeedMoreInput) => Ok(()),
            Err(status) => {
                resources.mapped = None;
                if let Err(e) = state
                    .backend
                    .unmap_input_resource(state.encoder, mapped)
                    .call("nvEncUnmapInputResource")
                {
                    log::warn!("{e}");
                }
                Err(EncoderError::backend("nvEncEncodePicture", status))
            }
        }
    }

    /// Queues the end-of-stream picture, which makes the encoder emit everything it buffered.
    ///
    /// If no frame was ever submitted nothing is queued and `Accepted { index: 0 }` is
    /// returned with the input index still at 0. Compare [`input_index`](Self::input_index)
    /// before and after to tell the two apart.
    pub fn end_of_stream(&self) -> Result<SubmitStatus> {
        let active = read(&self.active);
        let state = active.as_ref().ok_or(EncoderError::NotInitialized)?;
        let format = read(&self.config).format.buffer_format();
        self.send_end_of_stream(state, format)
    }

    fn send_end_of_stream(
        &self,
        state: &Active<L, D>,
        buffer_format: BufferFormat,
    ) -> Result<SubmitStatus> {
        let index = state.input_index.load(Ordering::Acquire);
        if index == 0 {
            return Ok(SubmitStatus::Accepted { index });
        }

        let (slot_index, slot) = state.slot(index);
        if !slot.try_claim() {
            return Ok(SubmitStatus::SlotBusy);
        }

        let mut resources = slot.resources();
        if let Err(e) = slot.event().reset() {
            drop(resources);
            slot.release();
            return Err(e);
        }
        resources.end_of_stream = true;

        let params = PicParams {
            input: None,
            output: None,
            completion_event: Arc::clone(slot.event()),
            input_width: 0,
            input_height: 0,
            buffer_format,
            frame_idx: index as u32,
            input_timestamp: index,
            flags: PicFlags::EOS,
        };

        match state.backend.encode_picture(state.encoder, &params) {
            Ok(()) | Err(NvEncStatus::NeedMoreInput) => {
                state.input_index.store(index + 1, Ordering::Release);
                log::debug!("Queued end of stream into slot {slot_index}");
                Ok(SubmitStatus::Accepted { index })
            }
            Err(status) => {
                resources.end_of_stream = false;
                drop(resources);
                slot.release();
                Err(EncoderError::backend("nvEncEncodePicture", status))
            }
        }
    }

    /// Collects the output of every submitted frame, in submission order, into `out`.
    ///
    /// Blocks up to the completion timeout per frame. A frame that fails is skipped and logged;
    /// the pass continues and the last failure is returned after it.
    pub fn drain(&self, out: &mut Vec<EncodedPacket>) -> Result<()> {
        let _drain = lock(&self.drain_lock);
        out.append(&mut lock(&self.flushed));

        let active = read(&self.active);
        let Some(state) = active.as_ref() else {
            return Ok(());
        };
        let timeout = read(&self.config).completion_timeout();
        self.drain_active(state, timeout, out)
    }

    fn drain_active(
        &self,
        state: &Active<L, D>,
        timeout: Duration,
        out: &mut Vec<EncodedPacket>,
    ) -> Result<()> {
        let mut last_error = None;

        loop {
            let output_index = state.output_index.load(Ordering::Acquire);
            if output_index >= state.input_index.load(Ordering::Acquire) {
                break;
            }

            let (_, slot) = state.slot(output_index);
            let claimed = slot.is_in_flight();
            let result = if claimed {
                self.drain_slot(state, output_index, timeout, out)
            } else {
                Err(EncoderError::NotInFlight {
                    index: output_index,
                })
            };
            // Advance before freeing the slot: at most ring_size frames are ever outstanding
            state
                .output_index
                .store(output_index + 1, Ordering::Release);
            if claimed {
                slot.release();
            }

            if let Err(e) = result {
                log::error!("{e}");
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Waits for the slot of frame `index` and reads its packet. The slot stays claimed; the
    /// caller frees it.
    fn drain_slot(
        &self,
        state: &Active<L, D>,
        index: u64,
        timeout: Duration,
        out: &mut Vec<EncodedPacket>,
    ) -> Result<()> {
        let (slot_index, slot) = state.slot(index);
        let deadline = Instant::now() + timeout;

        let result = loop {
            let wait = slot
                .event()
                .wait(deadline.saturating_duration_since(Instant::now()));
            let resources = slot.resources();
            match wait {
                Ok(WaitStatus::Signaled) if resources.end_of_stream => break Ok(()),
                Ok(WaitStatus::Signaled) => {
                    let Some(output) = resources.output else {
                        break Err(EncoderError::NotInitialized);
                    };
                    match read_bitstream(&*state.backend, state.encoder, output, index) {
                        // A completion of an earlier frame that timed out in this slot
                        Ok(packet) if packet.timestamp != index => {
                            log::debug!(
                                "Discarding late output of frame {} from slot {slot_index}",
                                packet.timestamp
                            );
                        }
                        Ok(packet) => {
                            out.push(packet);
                            break Ok(());
                        }
                        Err(e) => break Err(e),
                    }
                }
                Ok(WaitStatus::TimedOut) => break Err(EncoderError::Timeout { index }),
                Err(e) => break Err(e),
            }
        };

        let mut resources = slot.resources();
        if let Some(mapped) = resources.mapped.take() {
            if let Err(e) = state
                .backend
                .unmap_input_resource(state.encoder, mapped)
                .call("nvEncUnmapInputResource")
            {
                log::warn!("{e}");
            }
        }
        resources.end_of_stream = false;

        result
    }

    /// Drains, sends end of stream and drains again, so nothing is left in flight.
    fn flush(
        &self,
        state: &Active<L, D>,
        config: &EncodeSessionConfig,
        out: &mut Vec<EncodedPacket>,
    ) -> Result<()> {
        let timeout = config.completion_timeout();
        let mut result = self.drain_active(state, timeout, out);
        match self.send_end_of_stream(state, config.format.buffer_format()) {
            Ok(SubmitStatus::Accepted { .. }) => {}
            Ok(SubmitStatus::SlotBusy) => {
                log::warn!("No free slot for the end of stream picture");
            }
            Err(e) => keep_first(&mut result, Err(e)),
        }
        keep_first(&mut result, self.drain_active(state, timeout, out));
        result
    }

    /// Changes the encoded frame size.
    ///
    /// Frames already submitted are flushed first; their packets are returned by the next
    /// drain. The slot textures, registrations and output buffers are recreated at the new
    /// size, while the encoder context and completion events are kept. Does nothing if the size
    /// is unchanged. If the encoder rejects the new size the session becomes unusable.
    pub fn resize(&self, width: u32, height: u32) -> Result<()> {
        let _drain = lock(&self.drain_lock);
        let active = read(&self.active);
        let state = active.as_ref().ok_or(EncoderError::NotInitialized)?;
        let mut config = write(&self.config);

        if config.width == width && config.height == height {
            return Ok(());
        }
        if self.invalid.load(Ordering::Acquire) {
            return Err(EncoderError::SessionInvalid);
        }
        validate_size(width, height)?;
        let new_config = config.with_size(width, height);

        let mut flushed = Vec::new();
        if let Err(e) = self.flush(state, &config, &mut flushed) {
            log::warn!("Flush before resize did not complete cleanly: {e}");
        }
        lock(&self.flushed).append(&mut flushed);

        log::debug!(
            "Resizing encoder from {}x{} to {width}x{height}",
            config.width,
            config.height
        );

        for slot in state.slots.iter().rev() {
            if let Err(e) = slot
                .resources()
                .release_size_dependent(&*state.backend, state.encoder)
            {
                log::warn!("Releasing slot resources for resize: {e}");
            }
        }

        let params = ReconfigureParams::derive(&new_config, &state.preset_config);
        if let Err(e) = state
            .backend
            .reconfigure_encoder(state.encoder, &params)
            .call("nvEncReconfigureEncoder")
        {
            self.invalid.store(true, Ordering::Release);
            return Err(e);
        }
        *config = new_config;

        for slot in state.slots.iter() {
            if let Err(e) = slot.resources().acquire_size_dependent(
                &self.device,
                &*state.backend,
                state.encoder,
                &config,
            ) {
                self.invalid.store(true, Ordering::Release);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn config(&self) -> EncodeSessionConfig {
        read(&self.config).clone()
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn is_initialized(&self) -> bool {
        read(&self.active).is_some()
    }

    /// `false` once a resize failed, until the session is finalized.
    pub fn is_usable(&self) -> bool {
        self.is_initialized() && !self.invalid.load(Ordering::Acquire)
    }

    pub fn input_index(&self) -> u64 {
        read(&self.active)
            .as_ref()
            .map_or(0, |state| state.input_index.load(Ordering::Acquire))
    }

    pub fn output_index(&self) -> u64 {
        read(&self.active)
            .as_ref()
            .map_or(0, |state| state.output_index.load(Ordering::Acquire))
    }

    /// Number of slots currently being encoded.
    pub fn in_flight(&self) -> usize {
        read(&self.active).as_ref().map_or(0, |state| {
            state
                .slots
                .iter()
                .filter(|slot| slot.is_in_flight())
                .count()
        })
    }

    /// Shared handle of the input texture of slot `slot`.
    pub fn shared_handle(&self, slot: usize) -> Option<D::SharedHandle> {
        let active = read(&self.active);
        let state = active.as_ref()?;
        let handle = state.slots.get(slot)?.resources().shared_handle;
        handle
    }
}

impl<L: BackendLoader, D: GraphicsDevice> Drop for EncodeSession<L, D> {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            log::error!("Error while finalizing the encode session: {e}");
        }
    }
}

fn read_bitstream<B: EncodeBackend + ?Sized>(
    backend: &B,
    encoder: EncoderPtr,
    output: BitstreamPtr,
    index: u64,
) -> Result<EncodedPacket> {
    let mut packet = None;
    backend
        .lock_bitstream(encoder, output, &mut |lock: BitstreamLock<'_>| {
            packet = Some(EncodedPacket {
                index,
                data: Bytes::copy_from_slice(lock.data),
                picture_type: lock.picture_type,
                timestamp: lock.output_timestamp,
            });
        })
        .call("nvEncLockBitstream")?;
    backend
        .unlock_bitstream(encoder, output)
        .call("nvEncUnlockBitstream")?;

    packet.ok_or(EncoderError::backend("nvEncLockBitstream", NvEncStatus::Generic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{
            software::{SoftwareBackend, SoftwareLoader, SoftwareOptions},
            DevicePtr, ResourcePtr,
        },
        device::{
            software::{SoftwareDevice, SoftwareSharedHandle, SoftwareTexture},
            DeviceType, TextureDesc,
        },
        settings::PixelFormat,
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::sync::atomic::AtomicUsize;

    type Session<D = SoftwareDevice> = EncodeSession<SoftwareLoader, D>;

    struct Fixture<D: GraphicsDevice = SoftwareDevice> {
        session: Session<D>,
        device: Arc<D>,
        library: Arc<SharedLibrary<SoftwareLoader>>,
        // Keeps the backend loaded so its counters outlive the session
        _lease: LibraryLease<SoftwareLoader>,
    }

    impl<D: GraphicsDevice> Fixture<D> {
        fn backend(&self) -> Arc<SoftwareBackend> {
            self.library.api().unwrap()
        }
    }

    fn fixture_with<D: GraphicsDevice>(config: EncodeSessionConfig, device: D) -> Fixture<D> {
        fixture_with_loader(config, device, SoftwareLoader::default())
    }

    fn fixture_with_loader<D: GraphicsDevice>(
        config: EncodeSessionConfig,
        device: D,
        loader: SoftwareLoader,
    ) -> Fixture<D> {
        let device = Arc::new(device);
        let library = Arc::new(SharedLibrary::new(loader));
        let lease = library.acquire().unwrap();
        let session = EncodeSession::new(config, Arc::clone(&device), Arc::clone(&library));
        Fixture {
            session,
            device,
            library,
            _lease: lease,
        }
    }

    fn fixture(config: EncodeSessionConfig) -> Fixture {
        let fixture = fixture_with(config, SoftwareDevice::new());
        fixture.session.initialize().unwrap();
        fixture
    }

    fn small_config(ring_size: usize) -> EncodeSessionConfig {
        EncodeSessionConfig {
            ring_size,
            ..EncodeSessionConfig::new(320, 240, 30, PixelFormat::Rgba8)
        }
    }

    fn frame(fixture: &Fixture) -> SoftwareTexture {
        let config = fixture.session.config();
        fixture.device.create_texture(&TextureDesc {
            width: config.width,
            height: config.height,
            format: config.format,
        })
    }

    #[test]
    fn submissions_get_consecutive_indices() {
        let fixture = fixture(small_config(4));
        let frame = frame(&fixture);

        for expected in 0..3 {
            assert_eq!(
                fixture.session.submit(&frame, false).unwrap(),
                SubmitStatus::Accepted { index: expected }
            );
        }
        assert_eq!(fixture.device.copy_count(), 3);
        assert_eq!(fixture.device.flush_count(), 3);

        let mut packets = Vec::new();
        fixture.session.drain(&mut packets).unwrap();
        let indices: Vec<u64> = packets.iter().map(|packet| packet.index).collect();
        assert_eq!(indices, [0, 1, 2]);
        assert!(packets[0].is_keyframe());
        assert!(!packets[1].is_keyframe());
        assert_eq!(fixture.session.output_index(), 3);
        assert_eq!(fixture.session.in_flight(), 0);
    }

    #[test]
    fn full_ring_reports_slot_busy() {
        let fixture = fixture(small_config(2));
        let frame = frame(&fixture);
        fixture.backend().pause_completions();

        assert!(matches!(
            fixture.session.submit(&frame, false),
            Ok(SubmitStatus::Accepted { index: 0 })
        ));
        assert!(matches!(
            fixture.session.submit(&frame, false),
            Ok(SubmitStatus::Accepted { index: 1 })
        ));
        assert_eq!(
            fixture.session.submit(&frame, false).unwrap(),
            SubmitStatus::SlotBusy
        );
        assert_eq!(fixture.session.input_index(), 2);
        assert_eq!(fixture.session.in_flight(), 2);

        fixture.backend().resume_completions();
        let mut packets = Vec::new();
        fixture.session.drain(&mut packets).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(
            fixture.session.submit(&frame, false).unwrap(),
            SubmitStatus::Accepted { index: 2 }
        );
    }

    #[test]
    fn forced_idr_carries_parameter_sets() {
        let fixture = fixture(small_config(4));
        let frame = frame(&fixture);
        for i in 0..3 {
            fixture.session.submit(&frame, i == 2).unwrap();
        }

        let mut packets = Vec::new();
        fixture.session.drain(&mut packets).unwrap();
        let nal_types: Vec<u8> = packets[2].nal_units().map(|nal| nal[0] & 0x1f).collect();
        assert_eq!(nal_types, [7, 8, 5]);
    }

    #[test]
    fn unchanged_resize_makes_no_calls() {
        let fixture = fixture(small_config(3));
        let before = fixture.backend().stats();

        fixture.session.resize(320, 240).unwrap();

        let after = fixture.backend().stats();
        assert_eq!(before, after);
    }

    #[test]
    fn resize_flushes_and_recreates_slots() {
        let fixture = fixture(small_config(3));
        let small = frame(&fixture);
        fixture.session.submit(&small, false).unwrap();
        fixture.session.submit(&small, false).unwrap();
        let register_calls = fixture.backend().stats().register_calls;

        fixture.session.resize(640, 360).unwrap();

        let config = fixture.session.config();
        assert_eq!((config.width, config.height), (640, 360));
        let stats = fixture.backend().stats();
        assert_eq!(stats.reconfigure_calls, 1);
        assert_eq!(stats.register_calls, register_calls + 3);
        assert_eq!(stats.registered_resources, 3);
        assert_eq!(stats.mapped_inputs, 0);
        assert_eq!(fixture.device.live_shared_textures(), 3);
        assert_eq!(fixture.session.in_flight(), 0);

        // Two frames and the end-of-stream picture went through the ring
        let larger = frame(&fixture);
        assert_eq!(
            fixture.session.submit(&larger, false).unwrap(),
            SubmitStatus::Accepted { index: 3 }
        );

        let mut packets = Vec::new();
        fixture.session.drain(&mut packets).unwrap();
        let indices: Vec<u64> = packets.iter().map(|packet| packet.index).collect();
        assert_eq!(indices, [0, 1, 3]);
        assert!(packets[2].is_keyframe());
    }

    #[test]
    fn invalid_resize_keeps_session_usable() {
        let fixture = fixture(small_config(2));
        assert!(matches!(
            fixture.session.resize(0, 240),
            Err(EncoderError::InvalidConfig(_))
        ));
        assert!(matches!(
            fixture.session.resize(8192, 240),
            Err(EncoderError::InvalidConfig(_))
        ));
        assert!(fixture.session.is_usable());
        assert_eq!(fixture.backend().stats().reconfigure_calls, 0);
        assert!(fixture.session.submit(&frame(&fixture), false).is_ok());
    }

    #[test]
    fn timed_out_frame_is_skipped() {
        let config = EncodeSessionConfig {
            completion_timeout_ms: 20,
            ..small_config(2)
        };
        let fixture = fixture(config);
        fixture.backend().pause_completions();
        fixture.session.submit(&frame(&fixture), false).unwrap();

        let mut packets = Vec::new();
        let result = fixture.session.drain(&mut packets);
        assert!(matches!(result, Err(EncoderError::Timeout { index: 0 })));
        assert!(packets.is_empty());
        assert_eq!(fixture.session.output_index(), 1);
        assert_eq!(fixture.session.in_flight(), 0);
        assert_eq!(fixture.backend().stats().mapped_inputs, 0);

        fixture.backend().resume_completions();
    }

    #[test]
    fn late_completion_is_not_taken_for_the_next_frame() {
        let config = EncodeSessionConfig {
            completion_timeout_ms: 200,
            ..small_config(1)
        };
        let loader = SoftwareLoader::new(SoftwareOptions {
            encode_latency: Duration::from_millis(30),
            ..Default::default()
        });
        let fixture = fixture_with_loader(config, SoftwareDevice::new(), loader);
        fixture.session.initialize().unwrap();
        let frame = frame(&fixture);

        fixture.backend().pause_completions();
        fixture.session.submit(&frame, false).unwrap();
        let mut packets = Vec::new();
        assert!(matches!(
            fixture.session.drain(&mut packets),
            Err(EncoderError::Timeout { index: 0 })
        ));
        assert_eq!(
            fixture.session.submit(&frame, false).unwrap(),
            SubmitStatus::Accepted { index: 1 }
        );

        // Frame 0 completes first and signals the slot frame 1 is waiting on
        fixture.backend().resume_completions();
        fixture.session.drain(&mut packets).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].index, 1);
        assert_eq!(packets[0].timestamp, 1);
        assert!(!packets[0].is_keyframe());
        assert_eq!(fixture.session.output_index(), 2);
    }

    #[test]
    fn drain_reports_a_slot_that_is_not_in_flight() {
        let fixture = fixture(small_config(2));
        fixture.session.submit(&frame(&fixture), false).unwrap();
        fixture.session.submit(&frame(&fixture), false).unwrap();
        {
            let active = read(&fixture.session.active);
            active.as_ref().unwrap().slot(0).1.release();
        }

        let mut packets = Vec::new();
        let result = fixture.session.drain(&mut packets);
        assert!(matches!(result, Err(EncoderError::NotInFlight { index: 0 })));
        // The rest of the pass still runs
        let indices: Vec<u64> = packets.iter().map(|packet| packet.index).collect();
        assert_eq!(indices, [1]);
        assert_eq!(fixture.session.output_index(), 2);
    }

    #[test]
    fn end_of_stream_needs_a_prior_frame() {
        let fixture = fixture(small_config(2));
        assert_eq!(
            fixture.session.end_of_stream().unwrap(),
            SubmitStatus::Accepted { index: 0 }
        );
        assert_eq!(fixture.session.input_index(), 0);
        assert_eq!(fixture.backend().stats().encode_calls, 0);

        fixture.session.submit(&frame(&fixture), false).unwrap();
        assert_eq!(
            fixture.session.end_of_stream().unwrap(),
            SubmitStatus::Accepted { index: 1 }
        );
        let mut packets = Vec::new();
        fixture.session.drain(&mut packets).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(fixture.session.output_index(), 2);
    }

    #[test]
    fn submit_requires_initialize() {
        let fixture = fixture_with(small_config(2), SoftwareDevice::new());
        let texture = fixture.device.create_texture(&TextureDesc {
            width: 320,
            height: 240,
            format: PixelFormat::Rgba8,
        });
        assert!(matches!(
            fixture.session.submit(&texture, false),
            Err(EncoderError::NotInitialized)
        ));
        assert!(matches!(
            fixture.session.resize(640, 480),
            Err(EncoderError::NotInitialized)
        ));

        let mut packets = Vec::new();
        fixture.session.drain(&mut packets).unwrap();
        assert!(packets.is_empty());
        fixture.session.finalize().unwrap();
    }

    #[test]
    fn finalize_releases_everything_and_keeps_packets() {
        let fixture = fixture(small_config(3));
        let frame = frame(&fixture);
        fixture.session.submit(&frame, false).unwrap();
        fixture.session.submit(&frame, false).unwrap();

        fixture.session.finalize().unwrap();
        assert!(!fixture.session.is_initialized());
        assert_eq!(fixture.backend().stats().live_objects(), 0);
        assert_eq!(fixture.device.live_shared_textures(), 0);

        let mut packets = Vec::new();
        fixture.session.drain(&mut packets).unwrap();
        assert_eq!(packets.len(), 2);

        // A finalized session can be brought up again
        fixture.session.initialize().unwrap();
        assert_eq!(fixture.session.input_index(), 0);
        assert_eq!(fixture.backend().stats().open_sessions, 1);
    }

    /// Fails texture creation once its budget is used up.
    struct LimitedDevice {
        inner: SoftwareDevice,
        budget: AtomicUsize,
    }

    impl GraphicsDevice for LimitedDevice {
        type Texture = SoftwareTexture;
        type SharedHandle = SoftwareSharedHandle;

        fn device_type() -> DeviceType {
            SoftwareDevice::device_type()
        }

        fn as_ptr(&self) -> DevicePtr {
            self.inner.as_ptr()
        }

        fn supports_format(&self, format: PixelFormat) -> bool {
            self.inner.supports_format(format)
        }

        fn create_shared_texture(
            &self,
            desc: &TextureDesc,
        ) -> Result<(SoftwareTexture, SoftwareSharedHandle)> {
            let left = self.budget.load(Ordering::Acquire);
            if left == 0 {
                return Err(EncoderError::Device("out of video memory".to_string()));
            }
            self.budget.store(left - 1, Ordering::Release);
            self.inner.create_shared_texture(desc)
        }

        fn open_shared_texture(&self, handle: SoftwareSharedHandle) -> Result<SoftwareTexture> {
            self.inner.open_shared_texture(handle)
        }

        fn copy_texture(&self, dst: &SoftwareTexture, src: &SoftwareTexture) -> Result<()> {
            self.inner.copy_texture(dst, src)
        }

        fn flush(&self) {
            self.inner.flush()
        }

        fn resource_ptr(texture: &SoftwareTexture) -> ResourcePtr {
            SoftwareDevice::resource_ptr(texture)
        }
    }

    #[test]
    fn failed_initialize_rolls_back() {
        let device = LimitedDevice {
            inner: SoftwareDevice::new(),
            budget: AtomicUsize::new(2),
        };
        let fixture = fixture_with(small_config(4), device);

        let result = fixture.session.initialize();
        assert!(matches!(result, Err(EncoderError::Device(_))));
        assert!(!fixture.session.is_initialized());
        assert_eq!(fixture.backend().stats().live_objects(), 0);
        assert_eq!(fixture.device.inner.live_shared_textures(), 0);
        // Only the fixture's own lease is left
        assert_eq!(fixture.library.ref_count(), 1);
    }

    #[test]
    fn failed_rebuild_leaves_session_invalid() {
        // Enough textures for the initial ring and nothing more
        let device = LimitedDevice {
            inner: SoftwareDevice::new(),
            budget: AtomicUsize::new(2),
        };
        let fixture = fixture_with(small_config(2), device);
        fixture.session.initialize().unwrap();
        let texture = fixture.device.inner.create_texture(&TextureDesc {
            width: 320,
            height: 240,
            format: PixelFormat::Rgba8,
        });
        fixture.session.submit(&texture, false).unwrap();

        let result = fixture.session.resize(640, 480);
        assert!(matches!(result, Err(EncoderError::Device(_))));
        assert!(fixture.session.is_initialized());
        assert!(!fixture.session.is_usable());
        assert_eq!(fixture.backend().stats().reconfigure_calls, 1);

        assert!(matches!(
            fixture.session.submit(&texture, false),
            Err(EncoderError::SessionInvalid)
        ));
        assert!(matches!(
            fixture.session.resize(800, 600),
            Err(EncoderError::SessionInvalid)
        ));
        assert_eq!(fixture.backend().stats().reconfigure_calls, 1);

        // The frame submitted before the resize was flushed out
        let mut packets = Vec::new();
        fixture.session.drain(&mut packets).unwrap();
        assert_eq!(packets.len(), 1);

        let _ = fixture.session.finalize();
        assert!(!fixture.session.is_initialized());
        assert_eq!(fixture.backend().stats().live_objects(), 0);
        assert_eq!(fixture.device.inner.live_shared_textures(), 0);
    }

    #[test]
    fn concurrent_drain_keeps_ring_bounds() {
        let ring_size = 2;
        let fixture = fixture(small_config(ring_size));
        let frame = frame(&fixture);
        let submitted = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let mut accepted = 0;
                while accepted < 500 {
                    if let SubmitStatus::Accepted { index } =
                        fixture.session.submit(&frame, false).unwrap()
                    {
                        let output = fixture.session.output_index();
                        assert!(index + 1 - output <= ring_size as u64);
                        accepted += 1;
                    }
                }
                submitted.store(true, Ordering::Release);
            });

            let mut packets = Vec::new();
            while !submitted.load(Ordering::Acquire) {
                fixture.session.drain(&mut packets).unwrap();
            }
            fixture.session.drain(&mut packets).unwrap();
            assert_eq!(packets.len(), 500);
        });
    }

    #[test]
    fn random_interleaving_keeps_ring_bounds() {
        let ring_size = 3;
        let fixture = fixture(small_config(ring_size));
        let frame = frame(&fixture);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut next_expected = 0;

        for _ in 0..200 {
            if rng.gen_bool(0.7) {
                match fixture.session.submit(&frame, rng.gen_bool(0.1)).unwrap() {
                    SubmitStatus::Accepted { index } => {
                        assert_eq!(index + 1, fixture.session.input_index())
                    }
                    SubmitStatus::SlotBusy => {
                        assert_eq!(fixture.session.in_flight(), ring_size)
                    }
                }
            } else {
                let mut packets = Vec::new();
                fixture.session.drain(&mut packets).unwrap();
                for packet in packets {
                    assert_eq!(packet.index, next_expected);
                    next_expected += 1;
                }
                assert_eq!(fixture.session.output_index(), next_expected);
            }

            let input = fixture.session.input_index();
            let output = fixture.session.output_index();
            assert!(output <= input);
            assert!(input - output <= ring_size as u64);
        }
    }
}
