//! Carrier binding: which context is current on each carrier.
//!
//! A carrier is a physical thread (or a simulated one in tests). Each carrier
//! holds exactly one bound [`Context`], the root context until something binds
//! another. Two operations change the binding:
//!
//! - [`ContextStorage::bind`] opens a scope and returns a [`ScopeToken`] whose
//!   release restores the previous binding. Scopes are expected to close in
//!   LIFO order; violations are detected, reported through
//!   [`ContextConfig::scope_mismatch`](crate::config::ContextConfig), and the
//!   token's previous context is restored anyway.
//! - [`ContextStorage::replace`] swaps the binding without opening a scope.
//!   Fiber handles use it, so that a fiber's own scopes can never be closed
//!   by the scheduler hooks.
//!
//! Both are public. `bind` is the scoped form of "make current" and the one
//! application code should use, through [`Context::attach`]. `replace` is
//! the unscoped form: storage implementations and scheduler integrations
//! need it, and fiber code reaches it only through
//! [`Context::make_current`], whose binding lasts until the fiber's next
//! suspend.

pub mod local;
pub mod registry;

pub use local::ThreadLocalStorage;
pub use registry::{ContextRegistry, SimulatedCarrier};

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{self, Hazard};
use crate::context::Context;
use crate::error::BindingError;

static NEXT_CARRIER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Process-unique identity of a carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CarrierId(u64);

impl CarrierId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CARRIER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CarrierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique identity of an open scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    fn next() -> Self {
        Self(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// CarrierSlot
// ---------------------------------------------------------------------------

/// Binding state of one carrier.
#[derive(Debug)]
pub(crate) struct CarrierSlot {
    current: Context,
    open_scopes: Vec<ScopeId>,
}

impl CarrierSlot {
    pub(crate) fn new() -> Self {
        Self {
            current: Context::root(),
            open_scopes: Vec::new(),
        }
    }

    pub(crate) fn current(&self) -> &Context {
        &self.current
    }

    pub(crate) fn replace(&mut self, ctx: Context) -> Context {
        mem::replace(&mut self.current, ctx)
    }

    pub(crate) fn open_scope(&mut self, ctx: Context) -> (ScopeId, Context) {
        let scope = ScopeId::next();
        self.open_scopes.push(scope);
        (scope, self.replace(ctx))
    }

    /// Restore `previous` and retire `scope`. Returns the displaced context so
    /// callers can drop it outside their borrow of the slot.
    pub(crate) fn close_scope(
        &mut self,
        carrier: CarrierId,
        scope: ScopeId,
        previous: Context,
    ) -> (Result<(), BindingError>, Context) {
        let open = self.open_scopes.len();
        let result = match self.open_scopes.iter().rposition(|s| *s == scope) {
            Some(idx) if idx + 1 == open => {
                self.open_scopes.pop();
                Ok(())
            }
            Some(idx) => {
                self.open_scopes.remove(idx);
                Err(BindingError::OutOfOrder {
                    scope,
                    carrier,
                    newer: open - idx - 1,
                })
            }
            None => Err(BindingError::UnknownScope { scope, carrier }),
        };
        (result, self.replace(previous))
    }

    pub(crate) fn open_scope_count(&self) -> usize {
        self.open_scopes.len()
    }
}

// ---------------------------------------------------------------------------
// ContextStorage
// ---------------------------------------------------------------------------

/// Access to the binding of the carrier the caller is running on.
///
/// [`ThreadLocalStorage`] is the process-wide implementation.
/// [`SimulatedCarrier`] lets tests drive several carriers from one thread.
pub trait ContextStorage: Send + Sync {
    /// Identity of the carrier this storage resolves to for the caller.
    fn carrier_id(&self) -> CarrierId;

    /// The bound context. Root if nothing was ever bound.
    fn current(&self) -> Context;

    /// Swap the bound context without opening a scope.
    fn replace(&self, ctx: Context) -> Context;

    /// Bind `ctx` inside a new scope; returns the scope and the previous
    /// context. Prefer [`bind`](Self::bind).
    fn open_scope(&self, ctx: Context) -> (ScopeId, Context);

    /// Retire `scope` and rebind `previous`. The rebind happens even when an
    /// error is returned.
    fn close_scope(&self, scope: ScopeId, previous: Context) -> Result<(), BindingError>;

    /// Number of scopes currently open on the carrier.
    fn open_scope_count(&self) -> usize;

    /// Bind `ctx` until the returned token is released.
    fn bind(&self, ctx: Context) -> ScopeToken<'_>
    where
        Self: Sized,
    {
        ScopeToken::enter(self, ctx)
    }
}

// ---------------------------------------------------------------------------
// ScopeToken
// ---------------------------------------------------------------------------

/// Restores the previous binding when released.
///
/// Release happens on [`close`](Self::close) or on drop, including drops
/// during unwinding. A token cannot be released twice. It is not `Send`: it
/// belongs to the carrier that created it.
#[must_use = "dropping the token immediately restores the previous context"]
pub struct ScopeToken<'a> {
    storage: &'a dyn ContextStorage,
    scope: ScopeId,
    previous: Option<Context>,
    _carrier_bound: PhantomData<*const ()>,
}

impl<'a> ScopeToken<'a> {
    /// Open a scope binding `ctx` on `storage`.
    pub fn enter(storage: &'a dyn ContextStorage, ctx: Context) -> Self {
        let (scope, previous) = storage.open_scope(ctx);
        log::trace!("opened scope {} on carrier {}", scope, storage.carrier_id());
        Self {
            storage,
            scope,
            previous: Some(previous),
            _carrier_bound: PhantomData,
        }
    }

    pub fn scope_id(&self) -> ScopeId {
        self.scope
    }

    /// The context this token will restore.
    pub fn previous(&self) -> Option<&Context> {
        self.previous.as_ref()
    }

    /// Release the scope, returning any ordering violation instead of
    /// reporting it. The previous context is restored either way.
    pub fn close(mut self) -> Result<(), BindingError> {
        self.restore()
    }

    fn restore(&mut self) -> Result<(), BindingError> {
        match self.previous.take() {
            Some(previous) => self.storage.close_scope(self.scope, previous),
            None => Ok(()),
        }
    }
}

impl Drop for ScopeToken<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.restore() {
            config::report(Hazard::ScopeMismatch, &err.to_string());
        }
    }
}

impl fmt::Debug for ScopeToken<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeToken")
            .field("scope", &self.scope)
            .field("previous", &self.previous)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextKey;

    fn ctx(n: u32) -> Context {
        let key: ContextKey<u32> = ContextKey::new("n");
        Context::root().with_value(&key, n)
    }

    #[test]
    fn test_slot_starts_at_root() {
        let slot = CarrierSlot::new();
        assert!(slot.current().is_root());
        assert_eq!(slot.open_scope_count(), 0);
    }

    #[test]
    fn test_slot_lifo_close_restores_each_level() {
        let carrier = CarrierId::next();
        let mut slot = CarrierSlot::new();
        let (c1, c2) = (ctx(1), ctx(2));

        let (s1, p1) = slot.open_scope(c1.clone());
        let (s2, p2) = slot.open_scope(c2.clone());
        assert_eq!(slot.current(), &c2);
        assert_eq!(p2, c1);

        let (result, displaced) = slot.close_scope(carrier, s2, p2);
        assert!(result.is_ok());
        assert_eq!(displaced, c2);
        assert_eq!(slot.current(), &c1);

        let (result, _) = slot.close_scope(carrier, s1, p1);
        assert!(result.is_ok());
        assert!(slot.current().is_root());
        assert_eq!(slot.open_scope_count(), 0);
    }

    #[test]
    fn test_slot_detects_out_of_order_close() {
        let carrier = CarrierId::next();
        let mut slot = CarrierSlot::new();
        let (s1, p1) = slot.open_scope(ctx(1));
        let (_s2, _p2) = slot.open_scope(ctx(2));

        let (result, _) = slot.close_scope(carrier, s1, p1);
        assert_eq!(
            result,
            Err(BindingError::OutOfOrder {
                scope: s1,
                carrier,
                newer: 1
            })
        );
        // Restored anyway, and the retired scope no longer counts.
        assert!(slot.current().is_root());
        assert_eq!(slot.open_scope_count(), 1);
    }

    #[test]
    fn test_slot_rejects_unknown_scope() {
        let carrier = CarrierId::next();
        let mut foreign = CarrierSlot::new();
        let (scope, previous) = foreign.open_scope(ctx(1));

        let mut slot = CarrierSlot::new();
        let (result, _) = slot.close_scope(carrier, scope, previous);
        assert_eq!(result, Err(BindingError::UnknownScope { scope, carrier }));
    }

    #[test]
    fn test_replace_does_not_open_scope() {
        let mut slot = CarrierSlot::new();
        let old = slot.replace(ctx(9));
        assert!(old.is_root());
        assert_eq!(slot.open_scope_count(), 0);
    }
}
