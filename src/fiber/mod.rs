//! Per-fiber context bookkeeping for cooperative M:N schedulers.
//!
//! A [`FiberContextHandle`] travels with one fiber for its whole life. The
//! scheduler calls [`on_resume`](FiberContextHandle::on_resume) right before
//! a slice of the fiber runs on a carrier and
//! [`on_suspend`](FiberContextHandle::on_suspend) right after the slice gives
//! the carrier up. Between the two calls the carrier's current context is the
//! fiber's own; outside them it is whatever the carrier had before.
//!
//! The handle keeps two slots:
//!
//! - `fiber_context` carries the fiber's evolving context from one slice to
//!   the next;
//! - `thread_context` holds the carrier's pre-resume context so it can be put
//!   back when the slice ends.
//!
//! Neither slot alone is enough: fibers are multiplexed side by side, not
//! nested, and may suspend at any point without telling whoever resumed them.
//!
//! # Usage constraint
//!
//! Scopes opened by fiber code (see [`ScopeToken`](crate::storage::ScopeToken))
//! must not straddle a suspension point. A scope still open at suspend time
//! is detected and reported through
//! [`ContextConfig::straddling_scope`](crate::config::ContextConfig), but not
//! repaired: closing it later restores the snapshot captured when it was
//! opened, which may belong to a different slice.

pub mod future;
pub mod slice;
pub mod supervisor;

pub use future::{FiberFuture, FiberFutureExt};
pub use slice::SliceGuard;
pub use supervisor::{ContextSupervisor, FiberSupervisor, SupervisorRegistry};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{self, Hazard};
use crate::context::Context;
use crate::error::ProtocolError;
use crate::storage::{CarrierId, ContextStorage, ThreadLocalStorage};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// FiberId
// ---------------------------------------------------------------------------

/// Process-unique identity of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    pub fn next() -> Self {
        Self(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap an id assigned by the embedding scheduler.
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// FiberContextHandle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct RunningSlice {
    carrier: CarrierId,
    scopes_at_resume: usize,
}

/// Context bookkeeping for one fiber.
#[derive(Debug)]
pub struct FiberContextHandle {
    id: FiberId,
    fiber_context: Context,
    thread_context: Option<Context>,
    running: Option<RunningSlice>,
}

impl FiberContextHandle {
    /// Create a handle capturing the calling thread's current context.
    pub fn create() -> Self {
        Self::create_on(&ThreadLocalStorage)
    }

    /// Create a handle capturing the current context of `storage`.
    pub fn create_on(storage: &dyn ContextStorage) -> Self {
        Self::with_context(storage.current())
    }

    /// Create a handle whose fiber starts out with `ctx`.
    pub fn with_context(ctx: Context) -> Self {
        Self::with_id(FiberId::next(), ctx)
    }

    pub fn with_id(id: FiberId, ctx: Context) -> Self {
        Self {
            id,
            fiber_context: ctx,
            thread_context: None,
            running: None,
        }
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    /// The context the fiber considers its own. While running, the live value
    /// is the carrier's current context; this is the value saved at the last
    /// suspend (or at creation).
    pub fn fiber_context(&self) -> &Context {
        &self.fiber_context
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Carrier the fiber is running on, if any.
    pub fn carrier(&self) -> Option<CarrierId> {
        self.running.map(|slice| slice.carrier)
    }

    /// [`resume_on`](Self::resume_on) the calling OS thread.
    pub fn on_resume(&mut self) -> Result<(), ProtocolError> {
        self.resume_on(&ThreadLocalStorage)
    }

    /// [`suspend_on`](Self::suspend_on) the calling OS thread.
    pub fn on_suspend(&mut self) -> Result<(), ProtocolError> {
        self.suspend_on(&ThreadLocalStorage)
    }

    /// Start a slice on `storage`: remember the carrier's context, then bind
    /// the fiber's.
    pub fn resume_on(&mut self, storage: &dyn ContextStorage) -> Result<(), ProtocolError> {
        let carrier = storage.carrier_id();
        if let Some(slice) = self.running {
            return Err(ProtocolError::AlreadyRunning {
                fiber: self.id,
                carrier,
                running_on: slice.carrier,
            });
        }

        let scopes_at_resume = storage.open_scope_count();
        self.thread_context = Some(storage.replace(self.fiber_context.clone()));
        self.running = Some(RunningSlice {
            carrier,
            scopes_at_resume,
        });
        log::trace!("fiber {} resumed on carrier {}", self.id, carrier);
        Ok(())
    }

    /// End a slice on `storage`: keep whatever context the fiber left bound,
    /// then give the carrier back the context it had before the resume.
    pub fn suspend_on(&mut self, storage: &dyn ContextStorage) -> Result<(), ProtocolError> {
        let carrier = storage.carrier_id();
        let slice = match self.running {
            None => {
                return Err(ProtocolError::NotRunning {
                    fiber: self.id,
                    carrier,
                })
            }
            Some(slice) if slice.carrier != carrier => {
                return Err(ProtocolError::CarrierMismatch {
                    fiber: self.id,
                    carrier,
                    resumed_on: slice.carrier,
                })
            }
            Some(slice) => slice,
        };

        let straddling = storage.open_scope_count().saturating_sub(slice.scopes_at_resume);
        self.fiber_context = match self.thread_context.take() {
            Some(previous) => storage.replace(previous),
            None => storage.current(),
        };
        self.running = None;
        log::trace!("fiber {} suspended on carrier {}", self.id, carrier);

        if straddling > 0 {
            config::report(
                Hazard::StraddlingScope,
                &format!(
                    "fiber {} suspended on carrier {} with {} scope(s) still open; \
                     closing them later restores a stale context",
                    self.id, carrier, straddling
                ),
            );
        }
        Ok(())
    }

    /// Open a slice on `storage` that ends when the guard drops.
    pub fn enter<'a>(
        &'a mut self,
        storage: &'a dyn ContextStorage,
    ) -> Result<SliceGuard<'a>, ProtocolError> {
        SliceGuard::enter(self, storage)
    }

    /// Run `f` as one slice on `storage`.
    pub fn run_slice<R>(
        &mut self,
        storage: &dyn ContextStorage,
        f: impl FnOnce() -> R,
    ) -> Result<R, ProtocolError> {
        let guard = self.enter(storage)?;
        let output = f();
        guard.finish()?;
        Ok(output)
    }
}

impl Drop for FiberContextHandle {
    fn drop(&mut self) {
        if let Some(slice) = self.running {
            config::report(
                Hazard::ProtocolMisuse,
                &format!(
                    "fiber {} dropped while running on carrier {}; its context stays bound there",
                    self.id, slice.carrier
                ),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
