use super::{DeviceType, GraphicsDevice, TextureDesc};
use crate::{
    backend::{DevicePtr, ResourcePtr},
    settings::PixelFormat,
    util::lock,
    EncoderError, Result,
};
use std::{
    collections::HashMap,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

/// In-memory device. Textures carry a single tag value instead of pixels, which is enough to
/// observe copies.
#[derive(Default)]
pub struct SoftwareDevice {
    shared: Mutex<HashMap<u64, Weak<TextureInner>>>,
    next_id: AtomicU64,
    copies: AtomicU64,
    flushes: AtomicU64,
}

#[derive(Clone)]
pub struct SoftwareTexture(Arc<TextureInner>);

struct TextureInner {
    id: u64,
    desc: TextureDesc,
    tag: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoftwareSharedHandle(u64);

impl SoftwareTexture {
    pub fn desc(&self) -> TextureDesc {
        self.0.desc
    }

    pub fn tag(&self) -> u64 {
        self.0.tag.load(Ordering::Acquire)
    }

    pub fn set_tag(&self, tag: u64) {
        self.0.tag.store(tag, Ordering::Release);
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A plain texture, e.g. a render target the host would encode from.
    pub fn create_texture(&self, desc: &TextureDesc) -> SoftwareTexture {
        SoftwareTexture(Arc::new(TextureInner {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            desc: *desc,
            tag: AtomicU64::new(0),
        }))
    }

    pub fn copy_count(&self) -> u64 {
        self.copies.load(Ordering::Acquire)
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Acquire)
    }

    /// Shared textures that are still referenced by someone.
    pub fn live_shared_textures(&self) -> usize {
        lock(&self.shared)
            .values()
            .filter(|texture| texture.strong_count() > 0)
            .count()
    }
}

impl GraphicsDevice for SoftwareDevice {
    type Texture = SoftwareTexture;
    type SharedHandle = SoftwareSharedHandle;

    fn device_type() -> DeviceType {
        DeviceType::DirectX
    }

    fn as_ptr(&self) -> DevicePtr {
        DevicePtr::from_non_null(NonNull::from(self))
    }

    fn supports_format(&self, _format: PixelFormat) -> bool {
        true
    }

    fn create_shared_texture(
        &self,
        desc: &TextureDesc,
    ) -> Result<(SoftwareTexture, SoftwareSharedHandle)> {
        let texture = self.create_texture(desc);
        let handle = SoftwareSharedHandle(texture.id());

        let mut shared = lock(&self.shared);
        shared.retain(|_, texture| texture.strong_count() > 0);
        shared.insert(handle.0, Arc::downgrade(&texture.0));

        Ok((texture, handle))
    }

    fn open_shared_texture(&self, handle: SoftwareSharedHandle) -> Result<SoftwareTexture> {
        lock(&self.shared)
            .get(&handle.0)
            .and_then(Weak::upgrade)
            .map(SoftwareTexture)
            .ok_or_else(|| EncoderError::Device(format!("invalid shared handle {handle:?}")))
    }

    fn copy_texture(&self, dst: &SoftwareTexture, src: &SoftwareTexture) -> Result<()> {
        if dst.desc() != src.desc() {
            return Err(EncoderError::Device(format!(
                "cannot copy a {:?} texture into a {:?} texture",
                src.desc(),
                dst.desc()
            )));
        }
        dst.set_tag(src.tag());
        self.copies.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::AcqRel);
    }

    fn resource_ptr(texture: &SoftwareTexture) -> ResourcePtr {
        ResourcePtr::from_non_null(NonNull::from(&*texture.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(width: u32, height: u32) -> TextureDesc {
        TextureDesc {
            width,
            height,
            format: PixelFormat::Rgba8,
        }
    }

    #[test]
    fn copy_moves_contents() {
        let device = SoftwareDevice::new();
        let src = device.create_texture(&desc(64, 64));
        let (dst, _) = device.create_shared_texture(&desc(64, 64)).unwrap();
        src.set_tag(42);

        device.copy_texture(&dst, &src).unwrap();
        assert_eq!(dst.tag(), 42);
        assert_eq!(device.copy_count(), 1);
    }

    #[test]
    fn copy_rejects_size_mismatch() {
        let device = SoftwareDevice::new();
        let src = device.create_texture(&desc(64, 64));
        let dst = device.create_texture(&desc(32, 32));
        assert!(device.copy_texture(&dst, &src).is_err());
        assert_eq!(device.copy_count(), 0);
    }

    #[test]
    fn shared_handle_lives_as_long_as_texture() {
        let device = SoftwareDevice::new();
        let (texture, handle) = device.create_shared_texture(&desc(16, 16)).unwrap();

        let opened = device.open_shared_texture(handle).unwrap();
        assert_eq!(opened.id(), texture.id());
        assert_eq!(device.live_shared_textures(), 1);

        drop(texture);
        drop(opened);
        assert!(device.open_shared_texture(handle).is_err());
        assert_eq!(device.live_shared_textures(), 0);
    }

    #[test]
    fn resource_pointers_differ() {
        let device = SoftwareDevice::new();
        let a = device.create_texture(&desc(16, 16));
        let b = device.create_texture(&desc(16, 16));
        assert_ne!(
            SoftwareDevice::resource_ptr(&a),
            SoftwareDevice::resource_ptr(&b)
        );
        assert_eq!(
            SoftwareDevice::resource_ptr(&a),
            SoftwareDevice::resource_ptr(&a.clone())
        );
    }
}
