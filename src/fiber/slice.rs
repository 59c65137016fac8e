//! RAII slice guard.

use crate::config::{self, Hazard};
use crate::error::ProtocolError;
use crate::storage::ContextStorage;

use super::FiberContextHandle;

/// One slice of a fiber on a carrier.
///
/// Creating the guard resumes the fiber; dropping it suspends the fiber, also
/// when the slice unwinds. A suspend failure on drop is reported through
/// [`ContextConfig::protocol_misuse`](crate::config::ContextConfig); call
/// [`finish`](Self::finish) to receive it as a value instead.
#[must_use = "dropping the guard immediately suspends the fiber"]
pub struct SliceGuard<'a> {
    handle: &'a mut FiberContextHandle,
    storage: &'a dyn ContextStorage,
    finished: bool,
}

impl<'a> SliceGuard<'a> {
    pub fn enter(
        handle: &'a mut FiberContextHandle,
        storage: &'a dyn ContextStorage,
    ) -> Result<Self, ProtocolError> {
        handle.resume_on(storage)?;
        Ok(Self {
            handle,
            storage,
            finished: false,
        })
    }

    pub fn handle(&self) -> &FiberContextHandle {
        self.handle
    }

    /// Suspend now and return the outcome.
    pub fn finish(mut self) -> Result<(), ProtocolError> {
        self.finished = true;
        self.handle.suspend_on(self.storage)
    }
}

impl Drop for SliceGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.handle.suspend_on(self.storage) {
            config::report(Hazard::ProtocolMisuse, &err.to_string());
        }
    }
}
