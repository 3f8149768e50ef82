use super::{EventObjectTrait, WaitStatus};
use crate::{EncoderError, Result};
use std::{ffi::c_void, time::Duration};
use windows::Win32::{
    Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT},
    System::Threading::{CreateEventA, ResetEvent, SetEvent, WaitForSingleObject},
};

#[repr(transparent)]
pub struct EventObject(HANDLE);

// SAFETY: A Win32 event handle may be waited on and signaled from any thread.
unsafe impl Send for EventObject {}
unsafe impl Sync for EventObject {}

impl Drop for EventObject {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

impl EventObjectTrait for EventObject {
    fn new() -> Result<Self> {
        // Auto-reset, initially non-signaled
        match unsafe { CreateEventA(None, false, false, None) } {
            Ok(event) => Ok(EventObject(event)),
            Err(_) => Err(EncoderError::EventObjectCreationFailed),
        }
    }

    fn wait(&self, timeout: Duration) -> Result<WaitStatus> {
        // u32::MAX is INFINITE
        let timeout_millis = timeout.as_millis().min(u128::from(u32::MAX - 1)) as u32;

        match unsafe { WaitForSingleObject(self.0, timeout_millis) } {
            WAIT_OBJECT_0 => Ok(WaitStatus::Signaled),
            WAIT_TIMEOUT => Ok(WaitStatus::TimedOut),
            _ => Err(EncoderError::EventObjectWaitError),
        }
    }

    fn signal(&self) -> Result<()> {
        unsafe { SetEvent(self.0) }
            .ok()
            .map_err(|e| EncoderError::Device(e.to_string()))
    }

    fn reset(&self) -> Result<()> {
        unsafe { ResetEvent(self.0) }
            .ok()
            .map_err(|e| EncoderError::Device(e.to_string()))
    }

    fn as_ptr(&self) -> *mut c_void {
        self.0 .0 as *mut c_void
    }
}
