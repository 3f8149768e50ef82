use std::fmt;

/// Every `NVENCSTATUS` code except `NV_ENC_SUCCESS`.
///
/// Backends report failures with this type. Keeping success out of the enum lets
/// `Result<(), NvEncStatus>` stand in for the raw status code.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum NvEncStatus {
    NoEncodeDevice = 1,
    UnsupportedDevice = 2,
    InvalidEncoderDevice = 3,
    InvalidDevice = 4,
    DeviceNotExist = 5,
    InvalidPtr = 6,
    InvalidEvent = 7,
    InvalidParam = 8,
    InvalidCall = 9,
    OutOfMemory = 10,
    EncoderNotInitialized = 11,
    UnsupportedParam = 12,
    LockBusy = 13,
    NotEnoughBuffer = 14,
    InvalidVersion = 15,
    MapFailed = 16,
    NeedMoreInput = 17,
    EncoderBusy = 18,
    EventNotRegistered = 19,
    Generic = 20,
    IncompatibleClientKey = 21,
    Unimplemented = 22,
    ResourceRegisterFailed = 23,
    ResourceNotRegistered = 24,
    ResourceNotMapped = 25,
}

impl NvEncStatus {
    /// Converts a raw status code. `Ok(())` for `NV_ENC_SUCCESS` (zero), `Err(Generic)` for codes
    /// this library does not know about.
    pub fn from_raw(code: i32) -> Result<(), NvEncStatus> {
        use NvEncStatus::*;

        let status = match code {
            0 => return Ok(()),
            1 => NoEncodeDevice,
            2 => UnsupportedDevice,
            3 => InvalidEncoderDevice,
            4 => InvalidDevice,
            5 => DeviceNotExist,
            6 => InvalidPtr,
            7 => InvalidEvent,
            8 => InvalidParam,
            9 => InvalidCall,
            10 => OutOfMemory,
            11 => EncoderNotInitialized,
            12 => UnsupportedParam,
            13 => LockBusy,
            14 => NotEnoughBuffer,
            15 => InvalidVersion,
            16 => MapFailed,
            17 => NeedMoreInput,
            18 => EncoderBusy,
            19 => EventNotRegistered,
            21 => IncompatibleClientKey,
            22 => Unimplemented,
            23 => ResourceRegisterFailed,
            24 => ResourceNotRegistered,
            25 => ResourceNotMapped,
            _ => Generic,
        };
        Err(status)
    }

    #[inline]
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Name of the status constant as it appears in `nvEncodeAPI.h`.
    pub fn name(self) -> &'static str {
        use NvEncStatus::*;

        match self {
            NoEncodeDevice => "NV_ENC_ERR_NO_ENCODE_DEVICE",
            UnsupportedDevice => "NV_ENC_ERR_UNSUPPORTED_DEVICE",
            InvalidEncoderDevice => "NV_ENC_ERR_INVALID_ENCODERDEVICE",
            InvalidDevice => "NV_ENC_ERR_INVALID_DEVICE",
            DeviceNotExist => "NV_ENC_ERR_DEVICE_NOT_EXIST",
            InvalidPtr => "NV_ENC_ERR_INVALID_PTR",
            InvalidEvent => "NV_ENC_ERR_INVALID_EVENT",
            InvalidParam => "NV_ENC_ERR_INVALID_PARAM",
            InvalidCall => "NV_ENC_ERR_INVALID_CALL",
            OutOfMemory => "NV_ENC_ERR_OUT_OF_MEMORY",
            EncoderNotInitialized => "NV_ENC_ERR_ENCODER_NOT_INITIALIZED",
            UnsupportedParam => "NV_ENC_ERR_UNSUPPORTED_PARAM",
            LockBusy => "NV_ENC_ERR_LOCK_BUSY",
            NotEnoughBuffer => "NV_ENC_ERR_NOT_ENOUGH_BUFFER",
            InvalidVersion => "NV_ENC_ERR_INVALID_VERSION",
            MapFailed => "NV_ENC_ERR_MAP_FAILED",
            NeedMoreInput => "NV_ENC_ERR_NEED_MORE_INPUT",
            EncoderBusy => "NV_ENC_ERR_ENCODER_BUSY",
            EventNotRegistered => "NV_ENC_ERR_EVENT_NOT_REGISTERD",
            Generic => "NV_ENC_ERR_GENERIC",
            IncompatibleClientKey => "NV_ENC_ERR_INCOMPATIBLE_CLIENT_KEY",
            Unimplemented => "NV_ENC_ERR_UNIMPLEMENTED",
            ResourceRegisterFailed => "NV_ENC_ERR_RESOURCE_REGISTER_FAILED",
            ResourceNotRegistered => "NV_ENC_ERR_RESOURCE_NOT_REGISTERED",
            ResourceNotMapped => "NV_ENC_ERR_RESOURCE_NOT_MAPPED",
        }
    }

    /// Readable description, taken from the comments in `nvEncodeAPI.h`.
    // `NvEncGetLastErrorString` is not useable here since that requires a pointer to an
    // initialized encoder
    pub fn description(self) -> &'static str {
        use NvEncStatus::*;

        match self {
            NoEncodeDevice => "No encode capable devices were detected.",
            UnsupportedDevice => "Devices pass by the client is not supported.",
            InvalidEncoderDevice => "Encoder device supplied by the client is not valid.",
            InvalidDevice => "Device passed to the API call is invalid.",
            DeviceNotExist => "Device passed to the API call is no longer available and needs to be reinitialized.",
            InvalidPtr => "One or more of the pointers passed to the API call is invalid.",
            InvalidEvent => "Completion event passed in the encode picture call is invalid.",
            InvalidParam => "One or more of the parameter passed to the API call is invalid.",
            InvalidCall => "An API call was made in wrong sequence/order.",
            OutOfMemory => "API call failed because it was unable to allocate enough memory to perform the requested operation.",
            EncoderNotInitialized => "Encoder has not been initialized or that initialization has failed.",
            UnsupportedParam => "Unsupported parameter was passed by the client.",
            LockBusy => "Failed to lock the output buffer. The client should retry the same operation after few milliseconds.",
            NotEnoughBuffer => "Size of the user buffer passed by the client is insufficient for the requested operation.",
            InvalidVersion => "Invalid struct version was used by the client.",
            MapFailed => "Failed to map the client provided input resource.",
            NeedMoreInput => "Encode driver requires more input buffers to produce an output bitstream.",
            EncoderBusy => "HW encoder is busy encoding and is unable to encode the input.",
            EventNotRegistered => "Completion event passed in the encode picture call has not been registered with the encoder driver.",
            Generic => "An unknown internal error has occurred.",
            IncompatibleClientKey => "Client is attempting to use a feature that is not available for the license type for the current system.",
            Unimplemented => "The client is attempting to use a feature that is not implemented for the current version.",
            ResourceRegisterFailed => "Failed to register the resource.",
            ResourceNotRegistered => "Client is attempting to unregister a resource that has not been successfully registered.",
            ResourceNotMapped => "Client is attempting to unmap a resource that has not been successfully mapped.",
        }
    }
}

impl fmt::Display for NvEncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
