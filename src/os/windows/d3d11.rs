use crate::{
    backend::{DevicePtr, ResourcePtr},
    device::{DeviceType, GraphicsDevice, TextureDesc},
    settings::PixelFormat,
    util::lock,
    EncoderError, Result,
};
use std::{ptr::NonNull, sync::Mutex};
use windows::{
    core::Interface,
    Win32::{
        Foundation::HANDLE,
        Graphics::{
            Direct3D::{self, D3D_DRIVER_TYPE_HARDWARE},
            Direct3D11::{
                self, D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Multithread,
                ID3D11Resource, ID3D11Texture2D, D3D11_BIND_RENDER_TARGET,
                D3D11_BIND_SHADER_RESOURCE, D3D11_CPU_ACCESS_FLAG, D3D11_FORMAT_SUPPORT_TEXTURE2D,
                D3D11_RESOURCE_MISC_SHARED, D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC,
                D3D11_USAGE_DEFAULT,
            },
            Dxgi::{
                Common::{
                    DXGI_FORMAT, DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_FORMAT_R10G10B10A2_UNORM,
                    DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_SAMPLE_DESC,
                },
                IDXGIResource,
            },
        },
    },
};

/// A Direct3D 11 device and its immediate context.
pub struct D3D11Device {
    device: ID3D11Device,
    /// The immediate context is not thread safe
    context: Mutex<ID3D11DeviceContext>,
}

// SAFETY: ID3D11Device is free threaded and every use of the immediate context goes through the
// mutex.
unsafe impl Send for D3D11Device {}
unsafe impl Sync for D3D11Device {}

#[derive(Clone)]
#[repr(transparent)]
pub struct D3D11Texture(pub ID3D11Texture2D);

// SAFETY: Textures are only read or copied through a device, which serializes context access.
unsafe impl Send for D3D11Texture {}
unsafe impl Sync for D3D11Texture {}

fn device_error(e: windows::core::Error) -> EncoderError {
    EncoderError::Device(e.to_string())
}

fn dxgi_format(format: PixelFormat) -> DXGI_FORMAT {
    match format {
        PixelFormat::Rgba8 => DXGI_FORMAT_R8G8B8A8_UNORM,
        PixelFormat::Bgra8 => DXGI_FORMAT_B8G8R8A8_UNORM,
        PixelFormat::Rgb10A2 => DXGI_FORMAT_R10G10B10A2_UNORM,
    }
}

impl D3D11Device {
    pub fn new(device: ID3D11Device) -> Result<Self> {
        let mut context = None;
        unsafe {
            device.GetImmediateContext(&mut context);
        }
        let context = context
            .ok_or_else(|| EncoderError::Device("device has no immediate context".to_string()))?;

        Ok(D3D11Device {
            device,
            context: Mutex::new(context),
        })
    }

    /// Creates a device on the default hardware adapter.
    pub fn create_hardware() -> Result<Self> {
        let feature_levels = [
            Direct3D::D3D_FEATURE_LEVEL_12_1,
            Direct3D::D3D_FEATURE_LEVEL_12_0,
            Direct3D::D3D_FEATURE_LEVEL_11_1,
            Direct3D::D3D_FEATURE_LEVEL_11_0,
        ];

        #[cfg(debug_assertions)]
        let flags = Direct3D11::D3D11_CREATE_DEVICE_DEBUG;

        #[cfg(not(debug_assertions))]
        let flags = Direct3D11::D3D11_CREATE_DEVICE_FLAG(0);

        let mut device = None;
        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                None,
                flags,
                Some(feature_levels.as_slice()),
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                None,
            )
            .map_err(device_error)?;
        }
        let device =
            device.ok_or_else(|| EncoderError::Device("D3D11CreateDevice failed".to_string()))?;
        let device = D3D11Device::new(device)?;

        // The output thread and the render thread both submit to the immediate context
        let multithread: ID3D11Multithread = lock(&device.context).cast().map_err(device_error)?;
        unsafe {
            multithread.SetMultithreadProtected(true);
        }

        Ok(device)
    }

    pub fn raw(&self) -> &ID3D11Device {
        &self.device
    }
}

impl GraphicsDevice for D3D11Device {
    type Texture = D3D11Texture;
    type SharedHandle = HANDLE;

    fn device_type() -> DeviceType {
        DeviceType::DirectX
    }

    fn as_ptr(&self) -> DevicePtr {
        // SAFETY: a live COM interface pointer is never null
        DevicePtr::from_non_null(unsafe { NonNull::new_unchecked(self.device.as_raw()) })
    }

    fn supports_format(&self, format: PixelFormat) -> bool {
        match unsafe { self.device.CheckFormatSupport(dxgi_format(format)) } {
            Ok(support) => support & D3D11_FORMAT_SUPPORT_TEXTURE2D.0 as u32 != 0,
            Err(_) => false,
        }
    }

    fn create_shared_texture(&self, desc: &TextureDesc) -> Result<(D3D11Texture, HANDLE)> {
        let texture_desc = D3D11_TEXTURE2D_DESC {
            Width: desc.width,
            Height: desc.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: dxgi_format(desc.format),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            // The encoder registers it as a render target
            BindFlags: D3D11_BIND_RENDER_TARGET | D3D11_BIND_SHADER_RESOURCE,
            CPUAccessFlags: D3D11_CPU_ACCESS_FLAG(0),
            // Opened by other devices through the legacy shared handle
            MiscFlags: D3D11_RESOURCE_MISC_SHARED,
        };

        let texture = unsafe { self.device.CreateTexture2D(&texture_desc, None) }
            .map_err(device_error)?;
        let resource: IDXGIResource = texture.cast().map_err(device_error)?;
        let handle = unsafe { resource.GetSharedHandle() }.map_err(device_error)?;

        Ok((D3D11Texture(texture), handle))
    }

    fn open_shared_texture(&self, handle: HANDLE) -> Result<D3D11Texture> {
        let texture: ID3D11Texture2D =
            unsafe { self.device.OpenSharedResource(handle) }.map_err(device_error)?;
        Ok(D3D11Texture(texture))
    }

    fn copy_texture(&self, dst: &D3D11Texture, src: &D3D11Texture) -> Result<()> {
        let dst: ID3D11Resource = dst.0.cast().map_err(device_error)?;
        let src: ID3D11Resource = src.0.cast().map_err(device_error)?;
        unsafe {
            lock(&self.context).CopyResource(&dst, &src);
        }
        Ok(())
    }

    fn flush(&self) {
        unsafe {
            lock(&self.context).Flush();
        }
    }

    fn resource_ptr(texture: &D3D11Texture) -> ResourcePtr {
        // SAFETY: a live COM interface pointer is never null
        ResourcePtr::from_non_null(unsafe { NonNull::new_unchecked(texture.0.as_raw()) })
    }
}
