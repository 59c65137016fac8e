//! Error types for the binding primitive and the fiber protocol.

use thiserror::Error;

use crate::fiber::FiberId;
use crate::storage::{CarrierId, ScopeId};

/// A scheduler called the resume/suspend protocol out of order.
///
/// The handle refuses the call and leaves both its own state and the
/// carrier's binding untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("fiber {fiber} resumed on carrier {carrier} while still running on carrier {running_on}")]
    AlreadyRunning {
        fiber: FiberId,
        carrier: CarrierId,
        running_on: CarrierId,
    },

    #[error("fiber {fiber} suspended on carrier {carrier} without a matching resume")]
    NotRunning { fiber: FiberId, carrier: CarrierId },

    #[error("fiber {fiber} suspended on carrier {carrier} but was resumed on carrier {resumed_on}")]
    CarrierMismatch {
        fiber: FiberId,
        carrier: CarrierId,
        resumed_on: CarrierId,
    },

    #[error("fiber {fiber} is not known to the supervisor")]
    UnknownFiber { fiber: FiberId },

    #[error("fiber {fiber} was started twice")]
    DuplicateFiber { fiber: FiberId },

    #[error("fiber {fiber} ended while running on carrier {carrier}; its slice was suspended on its behalf")]
    EndedWhileRunning { fiber: FiberId, carrier: CarrierId },
}

/// A scope token was released out of order.
///
/// The token's previous context is restored regardless; the error only
/// reports that the restore may have reinstated a stale snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("scope {scope} closed out of order on carrier {carrier} ({newer} newer scope(s) still open)")]
    OutOfOrder {
        scope: ScopeId,
        carrier: CarrierId,
        newer: usize,
    },

    #[error("scope {scope} is not open on carrier {carrier}")]
    UnknownScope { scope: ScopeId, carrier: CarrierId },
}
