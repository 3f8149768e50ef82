//! An encoder backend that runs on the CPU.
//!
//! It follows the function table contract closely: objects must be created, mapped and released
//! in the same order hardware requires, and completion is signaled asynchronously from a worker
//! thread through the registered event. The bitstream it produces is synthetic.

mod bitstream;

use self::bitstream::AccessUnit;
use super::{
    library::BackendLoader, BackendResult, BitstreamLock, BitstreamPtr, DevicePtr,
    EncodeBackend, EncoderPtr, MappedPtr, PicFlags, PicParams, PictureType, RegisterResource,
    RegisteredPtr, REQUIRED_API_VERSION,
};
use crate::{
    config::{CodecConfig, EncodeConfig, GopLength, InitializeParams, ReconfigureParams},
    device::DeviceType,
    error::NvEncStatus,
    event::{EventObject, EventObjectTrait},
    settings::{Codec, EncodePreset, TuningInfo},
    util::lock,
    EncoderError, Result,
};
use crossbeam_channel::{Receiver, Sender};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct SoftwareOptions {
    /// Time the worker spends on each picture before signaling completion.
    pub encode_latency: Duration,
    /// Reported by `max_supported_version`.
    pub max_supported_version: u32,
}

impl Default for SoftwareOptions {
    fn default() -> Self {
        SoftwareOptions {
            encode_latency: Duration::ZERO,
            max_supported_version: REQUIRED_API_VERSION,
        }
    }
}

#[derive(Default)]
pub struct SoftwareLoader {
    options: SoftwareOptions,
    loads: AtomicUsize,
}

impl SoftwareLoader {
    pub fn new(options: SoftwareOptions) -> Self {
        SoftwareLoader {
            options,
            loads: AtomicUsize::new(0),
        }
    }

    /// Number of times the backend has been loaded.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Acquire)
    }
}

impl BackendLoader for SoftwareLoader {
    type Api = SoftwareBackend;

    fn library_name(&self) -> &str {
        "software encoder"
    }

    fn load(&self) -> Result<SoftwareBackend> {
        let backend = SoftwareBackend::new(self.options.clone()).map_err(|e| {
            EncoderError::LibraryLoadingFailed {
                name: self.library_name().to_string(),
                reason: e.to_string(),
            }
        })?;
        self.loads.fetch_add(1, Ordering::AcqRel);
        Ok(backend)
    }
}

/// Live objects and call counts of a [`SoftwareBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftwareStats {
    pub open_sessions: usize,
    pub registered_resources: usize,
    pub mapped_inputs: usize,
    pub bitstream_buffers: usize,
    pub registered_events: usize,
    pub register_calls: u64,
    pub reconfigure_calls: u64,
    pub encode_calls: u64,
}

impl SoftwareStats {
    /// Objects that still have to be released.
    pub fn live_objects(&self) -> usize {
        self.open_sessions
            + self.registered_resources
            + self.mapped_inputs
            + self.bitstream_buffers
            + self.registered_events
    }
}

pub struct SoftwareBackend {
    options: SoftwareOptions,
    state: Mutex<BackendState>,
    gate: Arc<Gate>,
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct BackendState {
    next_handle: usize,
    sessions: HashMap<usize, Session>,
    resources: HashMap<usize, Resource>,
    /// Mapped input to its registered resource
    mappings: HashMap<usize, usize>,
    buffers: HashMap<usize, (usize, Arc<Mutex<OutputBuffer>>)>,
    /// (encoder, event pointer)
    events: HashSet<(usize, usize)>,
    register_calls: u64,
    reconfigure_calls: u64,
    encode_calls: u64,
}

#[derive(Default)]
struct Session {
    params: Option<InitializeParams>,
    frames_since_idr: u64,
    needs_idr: bool,
}

struct Resource {
    encoder: usize,
    mapped: bool,
}

struct OutputBuffer {
    data: Vec<u8>,
    frame_idx: u32,
    timestamp: u64,
    picture_type: PictureType,
    locked: bool,
}

struct EncodedFrame {
    data: Vec<u8>,
    frame_idx: u32,
    timestamp: u64,
    picture_type: PictureType,
}

struct Job {
    output: Option<(Arc<Mutex<OutputBuffer>>, EncodedFrame)>,
    event: Arc<EventObject>,
}

/// Holds completions back while closed.
struct Gate {
    paused: Mutex<bool>,
    condvar: Condvar,
}

impl Gate {
    fn set_paused(&self, paused: bool) {
        *lock(&self.paused) = paused;
        self.condvar.notify_all();
    }

    fn wait_open(&self) {
        let paused = lock(&self.paused);
        let _open = self
            .condvar
            .wait_while(paused, |paused| *paused)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

impl BackendState {
    fn allocate_handle(&mut self) -> usize {
        // Looks like a pointer and is never zero
        self.next_handle += 1;
        0x1000 + self.next_handle * 0x10
    }

    fn session(&mut self, encoder: EncoderPtr) -> BackendResult<&mut Session> {
        self.sessions
            .get_mut(&encoder.as_raw())
            .ok_or(NvEncStatus::InvalidEncoderDevice)
    }

    fn initialized_session(&mut self, encoder: EncoderPtr) -> BackendResult<&mut Session> {
        let session = self.session(encoder)?;
        if session.params.is_none() {
            return Err(NvEncStatus::EncoderNotInitialized);
        }
        Ok(session)
    }
}

fn handle<T>(raw: usize, from_raw: fn(usize) -> Option<T>) -> BackendResult<T> {
    from_raw(raw).ok_or(NvEncStatus::Generic)
}

fn check_size(width: u32, height: u32, params: &InitializeParams) -> BackendResult<()> {
    if width == 0
        || height == 0
        || width > params.max_encode_width
        || height > params.max_encode_height
    {
        return Err(NvEncStatus::InvalidParam);
    }
    Ok(())
}

impl SoftwareBackend {
    pub fn new(options: SoftwareOptions) -> std::io::Result<Self> {
        let gate = Arc::new(Gate {
            paused: Mutex::new(false),
            condvar: Condvar::new(),
        });
        let (sender, receiver) = crossbeam_channel::unbounded();

        let worker = {
            let gate = Arc::clone(&gate);
            let latency = options.encode_latency;
            thread::Builder::new()
                .name("software-encoder".to_string())
                .spawn(move || run_worker(receiver, gate, latency))?
        };

        Ok(SoftwareBackend {
            options,
            state: Mutex::new(BackendState::default()),
            gate,
            jobs: Some(sender),
            worker: Some(worker),
        })
    }

    /// Queued pictures are held back and their events stay unsignaled until
    /// [`resume_completions`](Self::resume_completions), like a stalled encoder.
    pub fn pause_completions(&self) {
        self.gate.set_paused(true);
    }

    pub fn resume_completions(&self) {
        self.gate.set_paused(false);
    }

    pub fn stats(&self) -> SoftwareStats {
        let state = lock(&self.state);
        SoftwareStats {
            open_sessions: state.sessions.len(),
            registered_resources: state.resources.len(),
            mapped_inputs: state.mappings.len(),
            bitstream_buffers: state.buffers.len(),
            registered_events: state.events.len(),
            register_calls: state.register_calls,
            reconfigure_calls: state.reconfigure_calls,
            encode_calls: state.encode_calls,
        }
    }

    fn queue(&self, job: Job) -> BackendResult<()> {
        match &self.jobs {
            Some(jobs) => jobs.send(job).map_err(|_| NvEncStatus::Generic),
            None => Err(NvEncStatus::Generic),
        }
    }
}

impl Drop for SoftwareBackend {
    fn drop(&mut self) {
        self.gate.set_paused(false);
        // Disconnecting the channel stops the worker once the queue is empty
        self.jobs = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Software encoder worker panicked");
            }
        }
    }
}

fn run_worker(jobs: Receiver<Job>, gate: Arc<Gate>, latency: Duration) {
    for job in jobs {
        gate.wait_open();
        if !latency.is_zero() {
            thread::sleep(latency);
        }

        if let Some((buffer, frame)) = job.output {
            let mut buffer = lock(&buffer);
            buffer.data = frame.data;
            buffer.frame_idx = frame.frame_idx;
            buffer.timestamp = frame.timestamp;
            buffer.picture_type = frame.picture_type;
        }

        if let Err(e) = job.event.signal() {
            log::error!("Failed to signal completion: {e}");
        }
    }
}

impl EncodeBackend for SoftwareBackend {
    fn max_supported_version(&self) -> BackendResult<u32> {
        Ok(self.options.max_supported_version)
    }

    fn open_encode_session(
        &self,
        _device: DevicePtr,
        _device_type: DeviceType,
    ) -> BackendResult<EncoderPtr> {
        let mut state = lock(&self.state);
        let raw = state.allocate_handle();
        state.sessions.insert(raw, Session::default());
        handle(raw, EncoderPtr::from_raw)
    }

    fn get_encode_preset_config(
        &self,
        encoder: EncoderPtr,
        codec: Codec,
        preset: EncodePreset,
        _tuning_info: TuningInfo,
    ) -> BackendResult<EncodeConfig> {
        lock(&self.state).session(encoder)?;
        Ok(EncodeConfig::preset_default(codec, preset))
    }

    fn initialize_encoder(
        &self,
        encoder: EncoderPtr,
        params: &InitializeParams,
    ) -> BackendResult<()> {
        let mut state = lock(&self.state);
        let session = state.session(encoder)?;
        if session.params.is_some() {
            return Err(NvEncStatus::InvalidCall);
        }
        check_size(params.encode_width, params.encode_height, params)?;

        session.params = Some(params.clone());
        session.needs_idr = true;
        Ok(())
    }

    fn reconfigure_encoder(
        &self,
        encoder: EncoderPtr,
        params: &ReconfigureParams,
    ) -> BackendResult<()> {
        let mut state = lock(&self.state);
        state.reconfigure_calls += 1;

        let session = state.initialized_session(encoder)?;
        let current = session.params.as_ref().ok_or(NvEncStatus::EncoderNotInitialized)?;
        // The maximum size is fixed at initialization
        check_size(
            params.reinit.encode_width,
            params.reinit.encode_height,
            current,
        )?;

        let mut reinit = params.reinit.clone();
        reinit.max_encode_width = current.max_encode_width;
        reinit.max_encode_height = current.max_encode_height;
        session.params = Some(reinit);
        if params.reset_encoder || params.force_idr {
            session.needs_idr = true;
        }
        Ok(())
    }

    fn register_resource(
        &self,
        encoder: EncoderPtr,
        params: &RegisterResource,
    ) -> BackendResult<RegisteredPtr> {
        let mut state = lock(&self.state);
        let session = state.initialized_session(encoder)?;
        if let Some(current) = &session.params {
            check_size(params.width, params.height, current)
                .map_err(|_| NvEncStatus::ResourceRegisterFailed)?;
        }

        state.register_calls += 1;
        let raw = state.allocate_handle();
        state.resources.insert(
            raw,
            Resource {
                encoder: encoder.as_raw(),
                mapped: false,
            },
        );
        handle(raw, RegisteredPtr::from_raw)
    }

    fn unregister_resource(
        &self,
        encoder: EncoderPtr,
        resource: RegisteredPtr,
    ) -> BackendResult<()> {
        let mut state = lock(&self.state);
        match state.resources.get(&resource.as_raw()) {
            Some(registered) if registered.encoder == encoder.as_raw() => {
                if registered.mapped {
                    return Err(NvEncStatus::InvalidCall);
                }
            }
            _ => return Err(NvEncStatus::ResourceNotRegistered),
        }
        state.resources.remove(&resource.as_raw());
        Ok(())
    }

    fn map_input_resource(
        &self,
        encoder: EncoderPtr,
        resource: RegisteredPtr,
    ) -> BackendResult<MappedPtr> {
        let mut state = lock(&self.state);
        state.initialized_session(encoder)?;

        match state.resources.get_mut(&resource.as_raw()) {
            Some(registered) if registered.encoder == encoder.as_raw() => {
                if registered.mapped {
                    return Err(NvEncStatus::MapFailed);
                }
                registered.mapped = true;
            }
            _ => return Err(NvEncStatus::ResourceNotRegistered),
        }

        let raw = state.allocate_handle();
        state.mappings.insert(raw, resource.as_raw());
        handle(raw, MappedPtr::from_raw)
    }

    fn unmap_input_resource(&self, _encoder: EncoderPtr, mapped: MappedPtr) -> BackendResult<()> {
        let mut state = lock(&self.state);
        let resource = state
            .mappings
            .remove(&mapped.as_raw())
            .ok_or(NvEncStatus::ResourceNotMapped)?;
        if let Some(registered) = state.resources.get_mut(&resource) {
            registered.mapped = false;
        }
        Ok(())
    }

    fn create_bitstream_buffer(&self, encoder: EncoderPtr) -> BackendResult<BitstreamPtr> {
        let mut state = lock(&self.state);
        state.initialized_session(encoder)?;

        let raw = state.allocate_handle();
        let buffer = OutputBuffer {
            data: Vec::new(),
            frame_idx: 0,
            timestamp: 0,
            picture_type: PictureType::Unknown,
            locked: false,
        };
        state
            .buffers
            .insert(raw, (encoder.as_raw(), Arc::new(Mutex::new(buffer))));
        handle(raw, BitstreamPtr::from_raw)
    }

    fn destroy_bitstream_buffer(
        &self,
        encoder: EncoderPtr,
        buffer: BitstreamPtr,
    ) -> BackendResult<()> {
        let mut state = lock(&self.state);
        match state.buffers.get(&buffer.as_raw()) {
            Some((owner, _)) if *owner == encoder.as_raw() => {
                state.buffers.remove(&buffer.as_raw());
                Ok(())
            }
            _ => Err(NvEncStatus::InvalidPtr),
        }
    }

    fn register_async_event(
        &self,
        encoder: EncoderPtr,
        event: &Arc<EventObject>,
    ) -> BackendResult<()> {
        let mut state = lock(&self.state);
        state.session(encoder)?;
        if !state
            .events
            .insert((encoder.as_raw(), event.as_ptr() as usize))
        {
            return Err(NvEncStatus::InvalidEvent);
        }
        Ok(())
    }

    fn unregister_async_event(
        &self,
        encoder: EncoderPtr,
        event: &Arc<EventObject>,
    ) -> BackendResult<()> {
        let mut state = lock(&self.state);
        if !state
            .events
            .remove(&(encoder.as_raw(), event.as_ptr() as usize))
        {
            return Err(NvEncStatus::EventNotRegistered);
        }
        Ok(())
    }

    fn encode_picture(&self, encoder: EncoderPtr, params: &PicParams) -> BackendResult<()> {
        let mut state = lock(&self.state);
        state.encode_calls += 1;
        state.initialized_session(encoder)?;
        if !state
            .events
            .contains(&(encoder.as_raw(), params.completion_event.as_ptr() as usize))
        {
            return Err(NvEncStatus::EventNotRegistered);
        }

        if params.flags.contains(PicFlags::EOS) {
            if params.input.is_some() || params.output.is_some() {
                return Err(NvEncStatus::InvalidParam);
            }
            drop(state);
            return self.queue(Job {
                output: None,
                event: Arc::clone(&params.completion_event),
            });
        }

        let input = params.input.ok_or(NvEncStatus::InvalidPtr)?;
        if !state.mappings.contains_key(&input.as_raw()) {
            return Err(NvEncStatus::ResourceNotMapped);
        }
        let output = params.output.ok_or(NvEncStatus::InvalidPtr)?;
        let buffer = match state.buffers.get(&output.as_raw()) {
            Some((owner, buffer)) if *owner == encoder.as_raw() => Arc::clone(buffer),
            _ => return Err(NvEncStatus::InvalidPtr),
        };

        let session = state.initialized_session(encoder)?;
        let init = session.params.as_ref().ok_or(NvEncStatus::EncoderNotInitialized)?;
        if params.input_width != init.encode_width || params.input_height != init.encode_height
        {
            return Err(NvEncStatus::InvalidParam);
        }

        let gop_expired = match init.encode_config.gop_length {
            GopLength::Frames(length) => session.frames_since_idr >= u64::from(length.max(1)),
            GopLength::Infinite => false,
        };
        let idr = session.needs_idr || gop_expired || params.flags.contains(PicFlags::FORCE_IDR);
        let repeat_sps_pps = match &init.encode_config.codec_config {
            CodecConfig::H264(h264) => h264.repeat_sps_pps,
            CodecConfig::Hevc(hevc) => hevc.repeat_sps_pps,
        };
        let parameter_sets = (idr && (repeat_sps_pps || session.needs_idr))
            || params.flags.contains(PicFlags::OUTPUT_SPSPPS);

        let mut data = Vec::new();
        bitstream::write_access_unit(
            &mut data,
            init,
            AccessUnit {
                frame_idx: params.frame_idx,
                idr,
                parameter_sets,
            },
        );

        session.needs_idr = false;
        session.frames_since_idr = if idr { 1 } else { session.frames_since_idr + 1 };
        drop(state);

        log::trace!("Queued frame {} ({} bytes, idr: {idr})", params.frame_idx, data.len());
        self.queue(Job {
            output: Some((
                buffer,
                EncodedFrame {
                    data,
                    frame_idx: params.frame_idx,
                    timestamp: params.input_timestamp,
                    picture_type: if idr { PictureType::Idr } else { PictureType::P },
                },
            )),
            event: Arc::clone(&params.completion_event),
        })
    }

    fn lock_bitstream(
        &self,
        encoder: EncoderPtr,
        buffer: BitstreamPtr,
        consume: &mut dyn FnMut(BitstreamLock<'_>),
    ) -> BackendResult<()> {
        let buffer = match lock(&self.state).buffers.get(&buffer.as_raw()) {
            Some((owner, buffer)) if *owner == encoder.as_raw() => Arc::clone(buffer),
            _ => return Err(NvEncStatus::InvalidPtr),
        };

        let mut buffer = lock(&buffer);
        if buffer.locked {
            return Err(NvEncStatus::LockBusy);
        }
        buffer.locked = true;
        consume(BitstreamLock {
            data: &buffer.data,
            frame_idx: buffer.frame_idx,
            output_timestamp: buffer.timestamp,
            picture_type: buffer.picture_type,
        });
        Ok(())
    }

    fn unlock_bitstream(&self, encoder: EncoderPtr, buffer: BitstreamPtr) -> BackendResult<()> {
        let buffer = match lock(&self.state).buffers.get(&buffer.as_raw()) {
            Some((owner, buffer)) if *owner == encoder.as_raw() => Arc::clone(buffer),
            _ => return Err(NvEncStatus::InvalidPtr),
        };

        let mut buffer = lock(&buffer);
        if !buffer.locked {
            return Err(NvEncStatus::InvalidCall);
        }
        buffer.locked = false;
        Ok(())
    }

    fn destroy_encoder(&self, encoder: EncoderPtr) -> BackendResult<()> {
        let mut state = lock(&self.state);
        let raw = encoder.as_raw();
        state
            .sessions
            .remove(&raw)
            .ok_or(NvEncStatus::InvalidEncoderDevice)?;

        // Destroying the encoder frees whatever the client leaked
        let resources_before = state.resources.len();
        let buffers_before = state.buffers.len();
        let events_before = state.events.len();
        state.resources.retain(|_, resource| resource.encoder != raw);
        let live_resources: HashSet<usize> = state.resources.keys().copied().collect();
        state
            .mappings
            .retain(|_, resource| live_resources.contains(resource));
        state.buffers.retain(|_, (owner, _)| *owner != raw);
        state.events.retain(|(owner, _)| *owner != raw);

        let leaked = (resources_before - state.resources.len())
            + (buffers_before - state.buffers.len())
            + (events_before - state.events.len());
        if leaked > 0 {
            log::warn!("Destroyed encoder {raw:#x} with {leaked} objects still alive");
        }
        Ok(())
    }
}
