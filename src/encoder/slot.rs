use crate::{
    backend::{BitstreamPtr, EncodeBackend, EncoderPtr, MappedPtr, RegisterResource, RegisteredPtr},
    config::EncodeSessionConfig,
    device::{GraphicsDevice, TextureDesc},
    error::BackendResultExt,
    event::{EventObject, EventObjectTrait},
    util::lock,
    Result,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};

/// One entry of the ring: an input texture, its encoder registration, an output buffer and the
/// event that reports the output is ready.
pub(crate) struct ResourceSlot<D: GraphicsDevice> {
    /// Set from submit until the output has been drained
    in_flight: AtomicBool,
    event: Arc<EventObject>,
    resources: Mutex<SlotResources<D>>,
}

pub(crate) struct SlotResources<D: GraphicsDevice> {
    pub input_surface: Option<D::Texture>,
    pub shared_handle: Option<D::SharedHandle>,
    pub registered: Option<RegisteredPtr>,
    pub mapped: Option<MappedPtr>,
    pub output: Option<BitstreamPtr>,
    pub event_registered: bool,
    /// The last submission was the end-of-stream picture, which has no output
    pub end_of_stream: bool,
}

impl<D: GraphicsDevice> ResourceSlot<D> {
    pub fn new() -> Result<Self> {
        Ok(ResourceSlot {
            in_flight: AtomicBool::new(false),
            event: Arc::new(EventObject::new()?),
            resources: Mutex::new(SlotResources {
                input_surface: None,
                shared_handle: None,
                registered: None,
                mapped: None,
                output: None,
                event_registered: false,
                end_of_stream: false,
            }),
        })
    }

    /// Marks the slot as in flight. Returns `false` if it already was.
    #[inline]
    pub fn try_claim(&self) -> bool {
        !self.in_flight.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn release(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    #[inline]
    pub fn event(&self) -> &Arc<EventObject> {
        &self.event
    }

    #[inline]
    pub fn resources(&self) -> MutexGuard<'_, SlotResources<D>> {
        lock(&self.resources)
    }
}

impl<D: GraphicsDevice> SlotResources<D> {
    pub fn register_event<B: EncodeBackend + ?Sized>(
        &mut self,
        backend: &B,
        encoder: EncoderPtr,
        event: &Arc<EventObject>,
    ) -> Result<()> {
        backend
            .register_async_event(encoder, event)
            .call("nvEncRegisterAsyncEvent")?;
        self.event_registered = true;
        Ok(())
    }

    pub fn unregister_event<B: EncodeBackend + ?Sized>(
        &mut self,
        backend: &B,
        encoder: EncoderPtr,
        event: &Arc<EventObject>,
    ) -> Result<()> {
        if !std::mem::take(&mut self.event_registered) {
            return Ok(());
        }
        backend
            .unregister_async_event(encoder, event)
            .call("nvEncUnregisterAsyncEvent")
    }

    /// Creates the input texture at the configured size, registers it and allocates the output
    /// buffer.
    pub fn acquire_size_dependent<B: EncodeBackend + ?Sized>(
        &mut self,
        device: &D,
        backend: &B,
        encoder: EncoderPtr,
        config: &EncodeSessionConfig,
    ) -> Result<()> {
        let desc = TextureDesc {
            width: config.width,
            height: config.height,
            format: config.format,
        };
        let (texture, shared_handle) = device.create_shared_texture(&desc)?;
        let resource = D::resource_ptr(&texture);
        self.input_surface = Some(texture);
        self.shared_handle = Some(shared_handle);

        let registered = backend
            .register_resource(
                encoder,
                &RegisterResource {
                    device_type: D::device_type(),
                    resource,
                    width: config.width,
                    height: config.height,
                    buffer_format: config.format.buffer_format(),
                },
            )
            .call("nvEncRegisterResource")?;
        self.registered = Some(registered);

        let output = backend
            .create_bitstream_buffer(encoder)
            .call("nvEncCreateBitstreamBuffer")?;
        self.output = Some(output);
        Ok(())
    }

    /// Releases what [`acquire_size_dependent`](Self::acquire_size_dependent) created, in
    /// reverse order. Keeps going after a failure and returns the first one.
    pub fn release_size_dependent<B: EncodeBackend + ?Sized>(
        &mut self,
        backend: &B,
        encoder: EncoderPtr,
    ) -> Result<()> {
        let mut result = Ok(());

        if let Some(mapped) = self.mapped.take() {
            keep_first(
                &mut result,
                backend
                    .unmap_input_resource(encoder, mapped)
                    .call("nvEncUnmapInputResource"),
            );
        }
        if let Some(output) = self.output.take() {
            keep_first(
                &mut result,
                backend
                    .destroy_bitstream_buffer(encoder, output)
                    .call("nvEncDestroyBitstreamBuffer"),
            );
        }
        if let Some(registered) = self.registered.take() {
            keep_first(
                &mut result,
                backend
                    .unregister_resource(encoder, registered)
                    .call("nvEncUnregisterResource"),
            );
        }
        self.shared_handle = None;
        self.input_surface = None;
        self.end_of_stream = false;

        result
    }
}

/// Records `next` in `result` unless `result` already holds an error. Every error is logged.
pub(crate) fn keep_first(result: &mut Result<()>, next: Result<()>) {
    if let Err(e) = next {
        log::warn!("{e}");
        if result.is_ok() {
            *result = Err(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::software::{SoftwareBackend, SoftwareOptions},
        device::{software::SoftwareDevice, DeviceType},
    };

    #[test]
    fn claim_is_exclusive() {
        let slot = ResourceSlot::<SoftwareDevice>::new().unwrap();
        assert!(slot.try_claim());
        assert!(!slot.try_claim());
        assert!(slot.is_in_flight());
        slot.release();
        assert!(!slot.is_in_flight());
        assert!(slot.try_claim());
    }

    #[test]
    fn acquire_then_release_leaves_nothing_behind() {
        let device = SoftwareDevice::new();
        let backend = SoftwareBackend::new(SoftwareOptions::default()).unwrap();
        let encoder = backend
            .open_encode_session(device.as_ptr(), DeviceType::DirectX)
            .unwrap();
        let config = EncodeSessionConfig::default().with_size(320, 240);
        let preset = backend
            .get_encode_preset_config(encoder, config.codec, config.preset, config.tuning_info)
            .unwrap();
        backend
            .initialize_encoder(
                encoder,
                &crate::config::InitializeParams::derive(&config, &preset),
            )
            .unwrap();

        let slot = ResourceSlot::<SoftwareDevice>::new().unwrap();
        let mut resources = slot.resources();
        resources
            .register_event(&backend, encoder, slot.event())
            .unwrap();
        resources
            .acquire_size_dependent(&device, &backend, encoder, &config)
            .unwrap();
        assert_eq!(device.live_shared_textures(), 1);
        assert_eq!(backend.stats().live_objects(), 4);

        resources.release_size_dependent(&backend, encoder).unwrap();
        resources
            .unregister_event(&backend, encoder, slot.event())
            .unwrap();
        assert!(resources.input_surface.is_none());
        assert_eq!(device.live_shared_textures(), 0);
        // Only the session itself is left
        assert_eq!(backend.stats().live_objects(), 1);
    }
}
