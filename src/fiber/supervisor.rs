//! Scheduler-facing supervisor hooks keyed by fiber id.
//!
//! Some schedulers only expose lifecycle callbacks with a fiber id and no
//! place to hang per-fiber state. [`ContextSupervisor`] owns one
//! [`FiberContextHandle`] per live fiber on their behalf.
//!
//! All methods have default no-op implementations, so other supervisors can
//! observe the same lifecycle through a [`SupervisorRegistry`].

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::{self, Hazard};
use crate::context::Context;
use crate::error::ProtocolError;
use crate::storage::ContextStorage;

use super::{FiberContextHandle, FiberId};

// ---------------------------------------------------------------------------
// FiberSupervisor
// ---------------------------------------------------------------------------

/// Lifecycle callbacks an M:N scheduler invokes around its fibers.
///
/// `storage` is the carrier the callback runs on. `on_start` runs on the
/// creating fiber's carrier, the others on the fiber's own carrier.
pub trait FiberSupervisor: Send + Sync {
    fn on_start(&self, _fiber: FiberId, _storage: &dyn ContextStorage) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn on_resume(&self, _fiber: FiberId, _storage: &dyn ContextStorage) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn on_suspend(&self, _fiber: FiberId, _storage: &dyn ContextStorage) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn on_end(&self, _fiber: FiberId, _storage: &dyn ContextStorage) -> Result<(), ProtocolError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ContextSupervisor
// ---------------------------------------------------------------------------

/// Keeps a [`FiberContextHandle`] for every live fiber.
#[derive(Debug, Default)]
pub struct ContextSupervisor {
    fibers: DashMap<FiberId, FiberContextHandle>,
}

impl ContextSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_fibers(&self) -> usize {
        self.fibers.len()
    }

    /// The saved context of `fiber`, if it is live.
    pub fn fiber_context(&self, fiber: FiberId) -> Option<Context> {
        self.fibers
            .get(&fiber)
            .map(|handle| handle.fiber_context().clone())
    }

    pub fn is_running(&self, fiber: FiberId) -> bool {
        self.fibers
            .get(&fiber)
            .is_some_and(|handle| handle.is_running())
    }
}

impl FiberSupervisor for ContextSupervisor {
    fn on_start(&self, fiber: FiberId, storage: &dyn ContextStorage) -> Result<(), ProtocolError> {
        match self.fibers.entry(fiber) {
            Entry::Occupied(_) => Err(ProtocolError::DuplicateFiber { fiber }),
            Entry::Vacant(slot) => {
                slot.insert(FiberContextHandle::with_id(fiber, storage.current()));
                Ok(())
            }
        }
    }

    fn on_resume(&self, fiber: FiberId, storage: &dyn ContextStorage) -> Result<(), ProtocolError> {
        let mut handle = self
            .fibers
            .get_mut(&fiber)
            .ok_or(ProtocolError::UnknownFiber { fiber })?;
        handle.resume_on(storage)
    }

    fn on_suspend(&self, fiber: FiberId, storage: &dyn ContextStorage) -> Result<(), ProtocolError> {
        let mut handle = self
            .fibers
            .get_mut(&fiber)
            .ok_or(ProtocolError::UnknownFiber { fiber })?;
        handle.suspend_on(storage)
    }

    /// Forget `fiber`. A fiber that ends mid-slice is suspended first so the
    /// carrier gets its context back, and the misuse is still returned. If
    /// that suspend fails the fiber stays registered.
    fn on_end(&self, fiber: FiberId, storage: &dyn ContextStorage) -> Result<(), ProtocolError> {
        let ended_on = {
            let mut handle = self
                .fibers
                .get_mut(&fiber)
                .ok_or(ProtocolError::UnknownFiber { fiber })?;
            match handle.carrier() {
                Some(carrier) => {
                    handle.suspend_on(storage)?;
                    Some(carrier)
                }
                None => None,
            }
        };
        self.fibers.remove(&fiber);
        match ended_on {
            Some(carrier) => Err(ProtocolError::EndedWhileRunning { fiber, carrier }),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// SupervisorRegistry
// ---------------------------------------------------------------------------

/// Fans scheduler callbacks out to every registered supervisor.
///
/// Supervisors are invoked in registration order. Errors are reported through
/// [`ContextConfig::protocol_misuse`](crate::config::ContextConfig) and do not
/// stop the remaining supervisors.
#[derive(Default)]
pub struct SupervisorRegistry {
    supervisors: Vec<Arc<dyn FiberSupervisor>>,
}

impl SupervisorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, supervisor: Arc<dyn FiberSupervisor>) {
        self.supervisors.push(supervisor);
    }

    pub fn len(&self) -> usize {
        self.supervisors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.supervisors.is_empty()
    }

    pub fn start(&self, fiber: FiberId, storage: &dyn ContextStorage) {
        self.dispatch("on_start", |s| s.on_start(fiber, storage));
    }

    pub fn resume(&self, fiber: FiberId, storage: &dyn ContextStorage) {
        self.dispatch("on_resume", |s| s.on_resume(fiber, storage));
    }

    pub fn suspend(&self, fiber: FiberId, storage: &dyn ContextStorage) {
        self.dispatch("on_suspend", |s| s.on_suspend(fiber, storage));
    }

    pub fn end(&self, fiber: FiberId, storage: &dyn ContextStorage) {
        self.dispatch("on_end", |s| s.on_end(fiber, storage));
    }

    fn dispatch(
        &self,
        hook: &str,
        call: impl Fn(&dyn FiberSupervisor) -> Result<(), ProtocolError>,
    ) {
        for supervisor in &self.supervisors {
            if let Err(err) = call(supervisor.as_ref()) {
                config::report(Hazard::ProtocolMisuse, &format!("{}: {}", hook, err));
            }
        }
    }
}

impl fmt::Debug for SupervisorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorRegistry")
            .field("supervisors", &self.supervisors.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigOverride, ContextConfig, MismatchBehavior};
    use crate::storage::ContextRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSupervisor {
        resumes: AtomicUsize,
        suspends: AtomicUsize,
    }

    impl FiberSupervisor for CountingSupervisor {
        fn on_resume(&self, _fiber: FiberId, _storage: &dyn ContextStorage) -> Result<(), ProtocolError> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_suspend(&self, _fiber: FiberId, _storage: &dyn ContextStorage) -> Result<(), ProtocolError> {
            self.suspends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_supervisor_lifecycle_interleaves_fibers() {
        let registry = ContextRegistry::new();
        let t = registry.spawn_carrier();
        let supervisor = ContextSupervisor::new();
        let (f1, f2) = (FiberId::next(), FiberId::next());

        supervisor.on_start(f1, &t).unwrap();
        supervisor.on_start(f2, &t).unwrap();
        assert_eq!(supervisor.live_fibers(), 2);

        supervisor.on_resume(f1, &t).unwrap();
        assert!(supervisor.is_running(f1));
        let c1 = t.current().with_attribute("fiber", "one");
        t.replace(c1.clone());
        supervisor.on_suspend(f1, &t).unwrap();
        assert!(t.current().is_root());

        supervisor.on_resume(f2, &t).unwrap();
        assert!(t.current().is_root());
        supervisor.on_suspend(f2, &t).unwrap();

        supervisor.on_resume(f1, &t).unwrap();
        assert_eq!(t.current(), c1);
        supervisor.on_suspend(f1, &t).unwrap();

        supervisor.on_end(f1, &t).unwrap();
        supervisor.on_end(f2, &t).unwrap();
        assert_eq!(supervisor.live_fibers(), 0);
    }

    #[test]
    fn test_start_captures_parent_context() {
        let registry = ContextRegistry::new();
        let t = registry.spawn_carrier();
        let supervisor = ContextSupervisor::new();
        let parent = Context::root().with_attribute("parent", "p");
        t.replace(parent.clone());

        let child = FiberId::next();
        supervisor.on_start(child, &t).unwrap();
        assert_eq!(supervisor.fiber_context(child), Some(parent));
    }

    #[test]
    fn test_unknown_and_duplicate_fibers_are_errors() {
        let registry = ContextRegistry::new();
        let t = registry.spawn_carrier();
        let supervisor = ContextSupervisor::new();
        let fiber = FiberId::from_raw(9_000_001);

        assert_eq!(
            supervisor.on_resume(fiber, &t),
            Err(ProtocolError::UnknownFiber { fiber })
        );
        supervisor.on_start(fiber, &t).unwrap();
        assert_eq!(
            supervisor.on_start(fiber, &t),
            Err(ProtocolError::DuplicateFiber { fiber })
        );
    }

    #[test]
    fn test_end_while_running_restores_carrier() {
        let registry = ContextRegistry::new();
        let t = registry.spawn_carrier();
        let supervisor = ContextSupervisor::new();
        let fiber = FiberId::next();
        let pre = Context::root().with_attribute("carrier", "idle");

        supervisor.on_start(fiber, &t).unwrap();
        t.replace(pre.clone());
        supervisor.on_resume(fiber, &t).unwrap();
        t.replace(t.current().with_attribute("fiber", "busy"));

        let err = supervisor.on_end(fiber, &t).unwrap_err();
        assert!(matches!(err, ProtocolError::EndedWhileRunning { .. }));
        assert_eq!(t.current(), pre);
        assert_eq!(supervisor.live_fibers(), 0);
    }

    #[test]
    fn test_end_on_wrong_carrier_keeps_fiber_recoverable() {
        let registry = ContextRegistry::new();
        let (t1, t2) = (registry.spawn_carrier(), registry.spawn_carrier());
        let supervisor = ContextSupervisor::new();
        let fiber = FiberId::next();

        supervisor.on_start(fiber, &t1).unwrap();
        supervisor.on_resume(fiber, &t1).unwrap();
        t1.replace(t1.current().with_attribute("fiber", "f"));

        assert_eq!(
            supervisor.on_end(fiber, &t2),
            Err(ProtocolError::CarrierMismatch {
                fiber,
                carrier: t2.id(),
                resumed_on: t1.id(),
            })
        );
        assert_eq!(supervisor.live_fibers(), 1);
        assert!(supervisor.is_running(fiber));

        let err = supervisor.on_end(fiber, &t1).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::EndedWhileRunning {
                fiber,
                carrier: t1.id(),
            }
        );
        assert!(t1.current().is_root());
        assert_eq!(supervisor.live_fibers(), 0);
    }

    #[test]
    fn test_registry_fans_out_and_reports_errors() {
        let _warn = ConfigOverride::new(ContextConfig::uniform(MismatchBehavior::Warn));
        let registry = ContextRegistry::new();
        let t = registry.spawn_carrier();
        let context = Arc::new(ContextSupervisor::new());
        let counter = Arc::new(CountingSupervisor::default());

        let mut supervisors = SupervisorRegistry::new();
        supervisors.register(context.clone());
        supervisors.register(counter.clone());
        assert_eq!(supervisors.len(), 2);

        let fiber = FiberId::next();
        supervisors.start(fiber, &t);
        supervisors.resume(fiber, &t);
        t.replace(t.current().with_attribute("k", "v"));
        supervisors.suspend(fiber, &t);
        // Unmatched suspend: ContextSupervisor errors, the counter still runs.
        supervisors.suspend(fiber, &t);
        supervisors.end(fiber, &t);

        assert_eq!(counter.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(counter.suspends.load(Ordering::SeqCst), 2);
        assert!(t.current().is_root());
        assert_eq!(context.live_fibers(), 0);
    }

    #[test]
    #[should_panic(expected = "on_resume")]
    fn test_registry_raises_when_configured() {
        let _raise = ConfigOverride::new(ContextConfig::uniform(MismatchBehavior::Raise));
        let registry = ContextRegistry::new();
        let t = registry.spawn_carrier();
        let mut supervisors = SupervisorRegistry::new();
        supervisors.register(Arc::new(ContextSupervisor::new()));
        supervisors.resume(FiberId::next(), &t);
    }
}
