//! Registry of simulated carriers.
//!
//! The registry keys carrier bindings by [`CarrierId`] instead of by OS
//! thread, so one test thread can play the part of several carrier threads.
//! A [`SimulatedCarrier`] is the storage view of a single registry entry.

use std::sync::Arc;

use dashmap::DashMap;

use crate::context::Context;
use crate::error::BindingError;

use super::{CarrierId, CarrierSlot, ContextStorage, ScopeId};

/// Carrier bindings keyed by carrier identity.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    carriers: DashMap<CarrierId, CarrierSlot>,
}

impl ContextRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a fresh carrier bound to the root context.
    pub fn spawn_carrier(self: &Arc<Self>) -> SimulatedCarrier {
        let id = CarrierId::next();
        self.carriers.insert(id, CarrierSlot::new());
        log::debug!("spawned simulated carrier {}", id);
        SimulatedCarrier {
            registry: Arc::clone(self),
            id,
        }
    }

    /// The context bound on carrier `id`, root if unknown.
    pub fn current_of(&self, id: CarrierId) -> Context {
        self.carriers
            .get(&id)
            .map(|slot| slot.current().clone())
            .unwrap_or_else(Context::root)
    }

    /// Forget carrier `id`, as when its thread exits. Returns whether it was
    /// registered.
    pub fn retire(&self, id: CarrierId) -> bool {
        self.carriers.remove(&id).is_some()
    }

    pub fn carrier_count(&self) -> usize {
        self.carriers.len()
    }

    fn with_slot<R>(&self, id: CarrierId, f: impl FnOnce(&mut CarrierSlot) -> R) -> R {
        let mut slot = self.carriers.entry(id).or_insert_with(CarrierSlot::new);
        f(&mut slot)
    }
}

/// Storage view of one carrier in a [`ContextRegistry`].
#[derive(Debug, Clone)]
pub struct SimulatedCarrier {
    registry: Arc<ContextRegistry>,
    id: CarrierId,
}

impl SimulatedCarrier {
    pub fn id(&self) -> CarrierId {
        self.id
    }

    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }
}

impl ContextStorage for SimulatedCarrier {
    fn carrier_id(&self) -> CarrierId {
        self.id
    }

    fn current(&self) -> Context {
        self.registry.current_of(self.id)
    }

    fn replace(&self, ctx: Context) -> Context {
        self.registry.with_slot(self.id, |slot| slot.replace(ctx))
    }

    fn open_scope(&self, ctx: Context) -> (ScopeId, Context) {
        self.registry.with_slot(self.id, |slot| slot.open_scope(ctx))
    }

    fn close_scope(&self, scope: ScopeId, previous: Context) -> Result<(), BindingError> {
        let (result, displaced) = self
            .registry
            .with_slot(self.id, |slot| slot.close_scope(self.id, scope, previous));
        drop(displaced);
        result
    }

    fn open_scope_count(&self) -> usize {
        self.registry
            .carriers
            .get(&self.id)
            .map(|slot| slot.open_scope_count())
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
