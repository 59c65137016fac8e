//! Thread-local carrier binding: the process-wide default storage.

use std::cell::RefCell;

use crate::context::Context;
use crate::error::BindingError;

use super::{CarrierId, CarrierSlot, ContextStorage, ScopeId, ScopeToken};

thread_local! {
    /// Binding of the calling OS thread.
    static CARRIER: RefCell<CarrierSlot> = RefCell::new(CarrierSlot::new());

    /// Identity of the calling OS thread as a carrier.
    static CARRIER_ID: CarrierId = CarrierId::next();
}

static THREAD_LOCAL: ThreadLocalStorage = ThreadLocalStorage;

/// Binds contexts to the calling OS thread.
///
/// Zero-sized; every value resolves to whichever thread calls it. During
/// thread-local teardown reads fall back to the root context and writes are
/// dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadLocalStorage;

impl ThreadLocalStorage {
    /// [`bind`](ContextStorage::bind) with a `'static` token.
    pub fn bind_static(ctx: Context) -> ScopeToken<'static> {
        ScopeToken::enter(&THREAD_LOCAL, ctx)
    }
}

impl ContextStorage for ThreadLocalStorage {
    fn carrier_id(&self) -> CarrierId {
        CARRIER_ID.with(|id| *id)
    }

    fn current(&self) -> Context {
        CARRIER
            .try_with(|slot| slot.borrow().current().clone())
            .unwrap_or_else(|_| Context::root())
    }

    fn replace(&self, ctx: Context) -> Context {
        CARRIER
            .try_with(|slot| slot.borrow_mut().replace(ctx))
            .unwrap_or_else(|_| Context::root())
    }

    fn open_scope(&self, ctx: Context) -> (ScopeId, Context) {
        CARRIER
            .try_with(|slot| slot.borrow_mut().open_scope(ctx))
            .unwrap_or_else(|_| (ScopeId::next(), Context::root()))
    }

    fn close_scope(&self, scope: ScopeId, previous: Context) -> Result<(), BindingError> {
        let carrier = self.carrier_id();
        let closed = CARRIER.try_with(|slot| slot.borrow_mut().close_scope(carrier, scope, previous));
        match closed {
            Ok((result, displaced)) => {
                drop(displaced);
                result
            }
            Err(_) => Ok(()),
        }
    }

    fn open_scope_count(&self) -> usize {
        CARRIER
            .try_with(|slot| slot.borrow().open_scope_count())
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
