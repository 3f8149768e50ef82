//! Completion signal the encoder raises when a frame's bitstream is ready.

#[cfg(not(windows))]
mod non_windows;
#[cfg(windows)]
mod windows;

use crate::Result;
use std::{ffi::c_void, time::Duration};

#[cfg(not(windows))]
pub use self::non_windows::EventObject;
#[cfg(windows)]
pub use self::windows::EventObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Signaled,
    TimedOut,
}

/// An auto-reset event: a successful wait consumes the signal.
pub trait EventObjectTrait: Sized {
    /// Creates an event in the non-signaled state.
    fn new() -> Result<Self>;

    fn wait(&self, timeout: Duration) -> Result<WaitStatus>;

    fn signal(&self) -> Result<()>;

    fn reset(&self) -> Result<()>;

    /// Raw handle passed to the encoder when registering the event.
    fn as_ptr(&self) -> *mut c_void;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Instant};

    #[test]
    fn times_out_when_not_signaled() {
        let event = EventObject::new().unwrap();
        let start = Instant::now();
        assert_eq!(
            event.wait(Duration::from_millis(20)).unwrap(),
            WaitStatus::TimedOut
        );
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn wait_consumes_signal() {
        let event = EventObject::new().unwrap();
        event.signal().unwrap();
        assert_eq!(
            event.wait(Duration::from_millis(10)).unwrap(),
            WaitStatus::Signaled
        );
        assert_eq!(
            event.wait(Duration::from_millis(10)).unwrap(),
            WaitStatus::TimedOut
        );
    }

    #[test]
    fn reset_clears_pending_signal() {
        let event = EventObject::new().unwrap();
        event.signal().unwrap();
        event.reset().unwrap();
        assert_eq!(
            event.wait(Duration::from_millis(10)).unwrap(),
            WaitStatus::TimedOut
        );
    }

    #[test]
    fn signaled_from_another_thread() {
        let event = Arc::new(EventObject::new().unwrap());
        let signaler = {
            let event = Arc::clone(&event);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                event.signal().unwrap();
            })
        };
        assert_eq!(
            event.wait(Duration::from_secs(5)).unwrap(),
            WaitStatus::Signaled
        );
        signaler.join().unwrap();
    }
}
