//! The encoder function table and the handles it deals in.

pub mod library;
pub mod software;

use crate::{
    config::{EncodeConfig, InitializeParams, ReconfigureParams},
    device::DeviceType,
    error::NvEncStatus,
    event::EventObject,
    settings::{BufferFormat, Codec, EncodePreset, TuningInfo},
};
use std::{ffi::c_void, num::NonZeroUsize, ops::BitOr, ptr::NonNull, sync::Arc};

pub const API_MAJOR_VERSION: u32 = 11;
pub const API_MINOR_VERSION: u32 = 1;
/// Version the backend has to support, in the `NvEncodeAPIGetMaxSupportedVersion` encoding.
pub const REQUIRED_API_VERSION: u32 = (API_MAJOR_VERSION << 4) | API_MINOR_VERSION;

pub type BackendResult<T> = std::result::Result<T, NvEncStatus>;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        pub struct $name(NonZeroUsize);

        impl $name {
            /// `None` for a null pointer.
            #[inline]
            pub fn from_raw(raw: usize) -> Option<Self> {
                NonZeroUsize::new(raw).map($name)
            }

            #[inline]
            pub fn from_non_null<T>(ptr: NonNull<T>) -> Self {
                // SAFETY: the address of a non-null pointer is never zero
                $name(unsafe { NonZeroUsize::new_unchecked(ptr.as_ptr() as usize) })
            }

            #[inline]
            pub fn as_raw(self) -> usize {
                self.0.get()
            }

            #[inline]
            pub fn as_ptr(self) -> *mut c_void {
                self.0.get() as *mut c_void
            }
        }
    };
}

opaque_handle!(
    /// Encoder context returned by `nvEncOpenEncodeSessionEx`.
    EncoderPtr
);
opaque_handle!(
    /// Device the encode session is opened on.
    DevicePtr
);
opaque_handle!(
    /// Texture handed to `nvEncRegisterResource`.
    ResourcePtr
);
opaque_handle!(
    /// Token returned by `nvEncRegisterResource`.
    RegisteredPtr
);
opaque_handle!(
    /// Token returned by `nvEncMapInputResource`, valid until unmapped.
    MappedPtr
);
opaque_handle!(
    /// Output buffer returned by `nvEncCreateBitstreamBuffer`.
    BitstreamPtr
);

/// `NV_ENC_PIC_FLAGS`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PicFlags(u32);

impl PicFlags {
    pub const NONE: PicFlags = PicFlags(0);
    pub const FORCE_INTRA: PicFlags = PicFlags(0x1);
    pub const FORCE_IDR: PicFlags = PicFlags(0x2);
    pub const OUTPUT_SPSPPS: PicFlags = PicFlags(0x4);
    pub const EOS: PicFlags = PicFlags(0x8);

    #[inline]
    pub fn contains(self, other: PicFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for PicFlags {
    type Output = PicFlags;

    fn bitor(self, rhs: PicFlags) -> PicFlags {
        PicFlags(self.0 | rhs.0)
    }
}

/// `NV_ENC_PIC_TYPE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureType {
    P,
    B,
    I,
    Idr,
    Unknown,
}

/// `NV_ENC_REGISTER_RESOURCE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterResource {
    pub device_type: DeviceType,
    pub resource: ResourcePtr,
    pub width: u32,
    pub height: u32,
    pub buffer_format: BufferFormat,
}

/// `NV_ENC_PIC_PARAMS`
///
/// An end-of-stream picture has neither input nor output and only carries [`PicFlags::EOS`].
#[derive(Clone)]
pub struct PicParams {
    pub input: Option<MappedPtr>,
    pub output: Option<BitstreamPtr>,
    pub completion_event: Arc<EventObject>,
    pub input_width: u32,
    pub input_height: u32,
    pub buffer_format: BufferFormat,
    pub frame_idx: u32,
    pub input_timestamp: u64,
    pub flags: PicFlags,
}

/// Borrowed view of a locked output buffer.
#[derive(Debug, Clone, Copy)]
pub struct BitstreamLock<'a> {
    pub data: &'a [u8],
    pub frame_idx: u32,
    pub output_timestamp: u64,
    pub picture_type: PictureType,
}

/// Function table of an encoder driver.
///
/// Every method maps to one entry of `NV_ENCODE_API_FUNCTION_LIST` and reports failures with the
/// raw [`NvEncStatus`]. Callers attach the operation name when they turn it into an
/// [`EncoderError`](crate::EncoderError).
pub trait EncodeBackend: Send + Sync + 'static {
    /// `NvEncodeAPIGetMaxSupportedVersion`
    fn max_supported_version(&self) -> BackendResult<u32>;

    fn open_encode_session(
        &self,
        device: DevicePtr,
        device_type: DeviceType,
    ) -> BackendResult<EncoderPtr>;

    fn get_encode_preset_config(
        &self,
        encoder: EncoderPtr,
        codec: Codec,
        preset: EncodePreset,
        tuning_info: TuningInfo,
    ) -> BackendResult<EncodeConfig>;

    fn initialize_encoder(&self, encoder: EncoderPtr, params: &InitializeParams)
        -> BackendResult<()>;

    fn reconfigure_encoder(
        &self,
        encoder: EncoderPtr,
        params: &ReconfigureParams,
    ) -> BackendResult<()>;

    fn register_resource(
        &self,
        encoder: EncoderPtr,
        params: &RegisterResource,
    ) -> BackendResult<RegisteredPtr>;

    fn unregister_resource(&self, encoder: EncoderPtr, resource: RegisteredPtr)
        -> BackendResult<()>;

    fn map_input_resource(
        &self,
        encoder: EncoderPtr,
        resource: RegisteredPtr,
    ) -> BackendResult<MappedPtr>;

    fn unmap_input_resource(&self, encoder: EncoderPtr, mapped: MappedPtr) -> BackendResult<()>;

    fn create_bitstream_buffer(&self, encoder: EncoderPtr) -> BackendResult<BitstreamPtr>;

    fn destroy_bitstream_buffer(&self, encoder: EncoderPtr, buffer: BitstreamPtr)
        -> BackendResult<()>;

    fn register_async_event(&self, encoder: EncoderPtr, event: &Arc<EventObject>)
        -> BackendResult<()>;

    fn unregister_async_event(
        &self,
        encoder: EncoderPtr,
        event: &Arc<EventObject>,
    ) -> BackendResult<()>;

    /// Queues a picture. `Err(NvEncStatus::NeedMoreInput)` means the picture was accepted but
    /// is buffered for reordering.
    fn encode_picture(&self, encoder: EncoderPtr, params: &PicParams) -> BackendResult<()>;

    /// Locks `buffer` and hands its contents to `consume`. The buffer stays locked until
    /// [`unlock_bitstream`](EncodeBackend::unlock_bitstream).
    fn lock_bitstream(
        &self,
        encoder: EncoderPtr,
        buffer: BitstreamPtr,
        consume: &mut dyn FnMut(BitstreamLock<'_>),
    ) -> BackendResult<()>;

    fn unlock_bitstream(&self, encoder: EncoderPtr, buffer: BitstreamPtr) -> BackendResult<()>;

    fn destroy_encoder(&self, encoder: EncoderPtr) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_reject_null() {
        assert!(EncoderPtr::from_raw(0).is_none());
        assert_eq!(MappedPtr::from_raw(0x40).map(MappedPtr::as_raw), Some(0x40));
    }

    #[test]
    fn force_idr_flags() {
        let flags = PicFlags::FORCE_IDR | PicFlags::OUTPUT_SPSPPS;
        assert!(flags.contains(PicFlags::FORCE_IDR));
        assert!(flags.contains(PicFlags::OUTPUT_SPSPPS));
        assert!(!flags.contains(PicFlags::EOS));
        assert_eq!(flags.bits(), 0x6);
    }

    #[test]
    fn required_version_encoding() {
        assert_eq!(REQUIRED_API_VERSION, 0xb1);
    }
}
