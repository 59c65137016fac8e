//! # fiber-context
//!
//! Ambient correlation context for code running on M:N schedulers.
//!
//! A [`Context`] is an immutable snapshot of correlation state (active span,
//! baggage, diagnostic attributes, or any typed value). Each carrier thread
//! has exactly one current context, changed either by a scoped
//! [`Context::attach`] or by an unscoped [`Context::make_current`].
//!
//! Fibers multiplexed onto carriers keep their own context through a
//! [`FiberContextHandle`]: `on_resume` swaps the fiber's context onto the
//! carrier and `on_suspend` swaps it back out, so nothing leaks between
//! fibers sharing a carrier and a fiber migrating between carriers takes its
//! context along. [`FiberFuture`] applies the same protocol to every poll of
//! a future, and [`logs`] maps log events together with the context active
//! when they were emitted.

pub mod config;
pub mod context;
pub mod error;
pub mod fiber;
pub mod logs;
pub mod storage;

pub use config::{ConfigOverride, ContextConfig, MismatchBehavior};
pub use context::{Attributes, Context, ContextBuilder, ContextKey};
pub use error::{BindingError, ProtocolError};
pub use fiber::{
    ContextSupervisor, FiberContextHandle, FiberFuture, FiberFutureExt, FiberId, FiberSupervisor,
    SliceGuard, SupervisorRegistry,
};
pub use storage::{
    CarrierId, ContextRegistry, ContextStorage, ScopeId, ScopeToken, SimulatedCarrier,
    ThreadLocalStorage,
};

/// The context bound to the calling OS thread.
pub fn current() -> Context {
    Context::current()
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
