//! The graphics device the encoder reads its input textures from.

pub mod software;

use crate::{
    backend::{DevicePtr, ResourcePtr},
    settings::PixelFormat,
    Result,
};
use std::{fmt, sync::Arc};

/// `NV_ENC_DEVICE_TYPE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    DirectX,
    Cuda,
    OpenGl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// A GPU device able to create textures that other devices or processes can open.
///
/// Implementations are shared between the render thread and the encoder's output thread, so
/// immediate-context work must be serialized internally.
pub trait GraphicsDevice: Send + Sync + 'static {
    type Texture: Clone + Send + Sync + 'static;
    /// Cross-process handle of a shared texture.
    type SharedHandle: Copy + Send + Sync + fmt::Debug + 'static;

    fn device_type() -> DeviceType;

    fn as_ptr(&self) -> DevicePtr;

    fn supports_format(&self, format: PixelFormat) -> bool;

    /// Creates a texture usable as encoder input together with its shared handle.
    fn create_shared_texture(
        &self,
        desc: &TextureDesc,
    ) -> Result<(Self::Texture, Self::SharedHandle)>;

    fn open_shared_texture(&self, handle: Self::SharedHandle) -> Result<Self::Texture>;

    /// Copies all of `src` into `dst`. Both must have the same size and format.
    fn copy_texture(&self, dst: &Self::Texture, src: &Self::Texture) -> Result<()>;

    /// Submits queued commands so the copy is visible to the encoder.
    fn flush(&self);

    /// Pointer registered with the encoder for `texture`.
    fn resource_ptr(texture: &Self::Texture) -> ResourcePtr;
}

/// Hands out the device an encoder should run on.
pub trait DeviceProvider: Send + Sync {
    type Device: GraphicsDevice;

    fn acquire_device(&self) -> Result<Arc<Self::Device>>;
}

impl<D: GraphicsDevice> DeviceProvider for Arc<D> {
    type Device = D;

    fn acquire_device(&self) -> Result<Arc<D>> {
        Ok(Arc::clone(self))
    }
}
