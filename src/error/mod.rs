mod status;

pub use status::NvEncStatus;

use crate::settings::PixelFormat;

pub type Result<T> = std::result::Result<T, EncoderError>;

#[derive(thiserror::Error, Debug)]
pub enum EncoderError {
    /// A function table entry returned a failure status. `NV_ENC_ERR_NEED_MORE_INPUT` from
    /// `nvEncEncodePicture` never ends up here.
    #[error("{operation} call failed: {status} ({})", .status.description())]
    Backend {
        operation: &'static str,
        status: NvEncStatus,
    },

    #[error("Loading the shared library `{name}` for the encoder backend failed: {reason}")]
    LibraryLoadingFailed { name: String, reason: String },
    #[error("The installed driver supports API version {supported:#x} but {required:#x} is required.")]
    UnsupportedVersion { required: u32, supported: u32 },

    #[error("Invalid encoder configuration: {0}")]
    InvalidConfig(String),
    #[error("The graphics device does not support the {0:?} pixel format")]
    UnsupportedFormat(PixelFormat),
    #[error("Graphics device error: {0}")]
    Device(String),

    #[error("Could not create a completion event object")]
    EventObjectCreationFailed,
    #[error("Error while waiting for the event object to be signaled")]
    EventObjectWaitError,

    #[error("Timed out waiting for the bitstream of frame {index}")]
    Timeout { index: u64 },
    #[error("Tried to get the bitstream of frame {index} which is not being encoded")]
    NotInFlight { index: u64 },
    #[error("The input resource of slot {slot} is already mapped")]
    AlreadyMapped { slot: usize },

    #[error("The encode session has not been initialized")]
    NotInitialized,
    #[error("The encode session is unusable after a failed reconfiguration")]
    SessionInvalid,
    #[error("Failed to start the output thread: {0}")]
    OutputThread(#[source] std::io::Error),
}

/// Coarse classification of an [`EncoderError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid dimensions or an unsupported format. Fix the configuration and retry.
    Configuration,
    /// The backend module could not be loaded or is too old.
    Library,
    /// A function table call failed.
    Backend,
    /// The graphics device or an OS object failed.
    Device,
    /// A completion signal did not arrive in time.
    Timeout,
    /// Ring bookkeeping was violated. Indicates a bug in the caller or in this crate.
    Protocol,
    /// The session is not in a state that allows the operation.
    State,
}

impl EncoderError {
    /// Wraps a backend status with the name of the call that produced it.
    #[inline]
    pub fn backend(operation: &'static str, status: NvEncStatus) -> Self {
        EncoderError::Backend { operation, status }
    }

    pub fn kind(&self) -> ErrorKind {
        use EncoderError::*;

        match self {
            Backend { .. } => ErrorKind::Backend,
            LibraryLoadingFailed { .. } | UnsupportedVersion { .. } => ErrorKind::Library,
            InvalidConfig(_) | UnsupportedFormat(_) => ErrorKind::Configuration,
            Device(_) | EventObjectCreationFailed | EventObjectWaitError | OutputThread(_) => {
                ErrorKind::Device
            }
            Timeout { .. } => ErrorKind::Timeout,
            NotInFlight { .. } | AlreadyMapped { .. } => ErrorKind::Protocol,
            NotInitialized | SessionInvalid => ErrorKind::State,
        }
    }

    /// The status returned by the backend, if this error came from a function table call.
    pub fn status(&self) -> Option<NvEncStatus> {
        match self {
            EncoderError::Backend { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Extension for mapping raw backend results into [`EncoderError`]s.
pub(crate) trait BackendResultExt<T> {
    fn call(self, operation: &'static str) -> Result<T>;
}

impl<T> BackendResultExt<T> for std::result::Result<T, NvEncStatus> {
    #[inline]
    fn call(self, operation: &'static str) -> Result<T> {
        self.map_err(|status| EncoderError::backend(operation, status))
    }
}
