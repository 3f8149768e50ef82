use super::{EventObjectTrait, WaitStatus};
use crate::{util::lock, Result};
use std::{
    ffi::c_void,
    sync::{Condvar, Mutex, PoisonError},
    time::Duration,
};

pub struct EventObject {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl EventObjectTrait for EventObject {
    fn new() -> Result<Self> {
        Ok(EventObject {
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    fn wait(&self, timeout: Duration) -> Result<WaitStatus> {
        let signaled = lock(&self.signaled);
        let (mut signaled, _) = self
            .condvar
            .wait_timeout_while(signaled, timeout, |signaled| !*signaled)
            .unwrap_or_else(PoisonError::into_inner);

        if *signaled {
            *signaled = false;
            Ok(WaitStatus::Signaled)
        } else {
            Ok(WaitStatus::TimedOut)
        }
    }

    fn signal(&self) -> Result<()> {
        *lock(&self.signaled) = true;
        self.condvar.notify_one();
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        *lock(&self.signaled) = false;
        Ok(())
    }

    fn as_ptr(&self) -> *mut c_void {
        self as *const EventObject as *mut c_void
    }
}
