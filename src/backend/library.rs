//! Process-wide, reference counted handle to the loaded encoder module.

use super::{EncodeBackend, REQUIRED_API_VERSION};
use crate::{error::BackendResultExt, util::lock, EncoderError, Result};
use std::{
    ops::Deref,
    sync::{Arc, Mutex},
};

/// Loads the encoder module and resolves its function table.
pub trait BackendLoader: Send + Sync + 'static {
    type Api: EncodeBackend;

    /// Filename of the .dll or .so
    fn library_name(&self) -> &str;

    fn load(&self) -> Result<Self::Api>;
}

/// The encoder module shared by every session in the process.
///
/// The module is loaded and its version checked when the first lease is taken, and unloaded
/// when the last lease is dropped.
pub struct SharedLibrary<L: BackendLoader> {
    loader: L,
    state: Mutex<LibraryState<L::Api>>,
}

struct LibraryState<A> {
    api: Option<Arc<A>>,
    ref_count: usize,
}

impl<L: BackendLoader> SharedLibrary<L> {
    pub fn new(loader: L) -> Self {
        SharedLibrary {
            loader,
            state: Mutex::new(LibraryState {
                api: None,
                ref_count: 0,
            }),
        }
    }

    pub fn acquire(self: &Arc<Self>) -> Result<LibraryLease<L>> {
        let mut state = lock(&self.state);

        let api = match &state.api {
            Some(api) => Arc::clone(api),
            None => {
                let api = self.loader.load()?;
                let supported = api
                    .max_supported_version()
                    .call("NvEncodeAPIGetMaxSupportedVersion")?;
                if supported < REQUIRED_API_VERSION {
                    return Err(EncoderError::UnsupportedVersion {
                        required: REQUIRED_API_VERSION,
                        supported,
                    });
                }

                log::info!(
                    "Loaded {} (API version {}.{})",
                    self.loader.library_name(),
                    supported >> 4,
                    supported & 0xf
                );
                let api = Arc::new(api);
                state.api = Some(Arc::clone(&api));
                api
            }
        };
        state.ref_count += 1;

        Ok(LibraryLease {
            library: Arc::clone(self),
            api,
        })
    }

    fn release(&self) {
        let mut state = lock(&self.state);
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count == 0 && state.api.take().is_some() {
            log::debug!("Unloaded {}", self.loader.library_name());
        }
    }

    pub fn ref_count(&self) -> usize {
        lock(&self.state).ref_count
    }

    pub fn is_loaded(&self) -> bool {
        lock(&self.state).api.is_some()
    }

    /// The loaded function table, if any lease is alive.
    pub fn api(&self) -> Option<Arc<L::Api>> {
        lock(&self.state).api.clone()
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }
}

/// One reference to the loaded module. Dropping it releases the reference.
pub struct LibraryLease<L: BackendLoader> {
    library: Arc<SharedLibrary<L>>,
    api: Arc<L::Api>,
}

impl<L: BackendLoader> Deref for LibraryLease<L> {
    type Target = L::Api;

    fn deref(&self) -> &L::Api {
        &self.api
    }
}

impl<L: BackendLoader> Drop for LibraryLease<L> {
    fn drop(&mut self) {
        self.library.release();
    }
}
