//! Typed context keys.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// A typed key into a [`Context`](super::Context).
///
/// Every key created with [`ContextKey::new`] is distinct, even when two keys
/// share a name. Keys are usually held in a `Lazy` static:
///
/// ```ignore
/// static REQUEST_ID: Lazy<ContextKey<String>> = Lazy::new(|| ContextKey::new("request_id"));
/// ```
pub struct ContextKey<T> {
    id: u64,
    name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            name,
            _value: PhantomData,
        }
    }

    /// Process-unique id; entries in a context are ordered by it.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Debug name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ContextKey<T> {}

impl<T> PartialEq for ContextKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for ContextKey<T> {}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
