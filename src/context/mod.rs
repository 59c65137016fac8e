//! Immutable ambient context snapshots.
//!
//! A [`Context`] is a small ordered map from typed keys to values. Once built
//! it never changes: [`Context::with_value`] and [`Context::derive`] return a
//! new snapshot that shares every untouched value with its parent.
//!
//! Equality is snapshot identity. Two contexts compare equal only when one is
//! a clone of the other, which is what "the context active on this carrier"
//! means when a fiber asks whether anything changed during its slice.

pub mod ambient;
pub mod key;

pub use ambient::Attributes;
pub use key::ContextKey;

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::storage::{ContextStorage, ScopeToken, ThreadLocalStorage};

static NEXT_SNAPSHOT_ID: AtomicU64 = AtomicU64::new(1);

static ROOT: Lazy<Context> = Lazy::new(|| Context {
    id: 0,
    entries: Arc::from(Vec::new()),
});

#[derive(Clone)]
struct Entry {
    key_id: u64,
    name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Immutable snapshot of ambient correlation state.
#[derive(Clone)]
pub struct Context {
    id: u64,
    entries: Arc<[Entry]>,
}

impl Context {
    /// The empty context. Every carrier starts out bound to it.
    pub fn root() -> Context {
        ROOT.clone()
    }

    /// The context bound to the calling OS thread.
    pub fn current() -> Context {
        ThreadLocalStorage.current()
    }

    /// Bind this context on the calling OS thread until the token is released.
    pub fn attach(self) -> ScopeToken<'static> {
        ThreadLocalStorage::bind_static(self)
    }

    /// Bind this context on the calling OS thread without a scope, returning
    /// the previous one.
    ///
    /// Inside a fiber slice the change is saved at the next suspend and comes
    /// back on every later resume. Outside a fiber nothing restores it.
    pub fn make_current(self) -> Context {
        ThreadLocalStorage.replace(self)
    }

    pub fn is_root(&self) -> bool {
        self.id == 0
    }

    /// Identity of this snapshot. The root snapshot is `0`.
    pub fn snapshot_id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of the keys present, in key order.
    pub fn key_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|entry| entry.name)
    }

    pub fn get<T: 'static>(&self, key: &ContextKey<T>) -> Option<&T> {
        self.position(key.id())
            .ok()
            .and_then(|idx| self.entries[idx].value.downcast_ref::<T>())
    }

    pub fn contains<T: 'static>(&self, key: &ContextKey<T>) -> bool {
        self.position(key.id()).is_ok()
    }

    /// A new context with `key` set to `value`; `self` is left unchanged.
    pub fn with_value<T: Send + Sync + 'static>(&self, key: &ContextKey<T>, value: T) -> Context {
        self.derive(|builder| {
            builder.set(key, value);
        })
    }

    /// A new context with `key` removed; `self` is left unchanged.
    pub fn without<T: 'static>(&self, key: &ContextKey<T>) -> Context {
        self.derive(|builder| {
            builder.remove(key);
        })
    }

    /// Apply several updates at once and return the resulting snapshot.
    pub fn derive(&self, updates: impl FnOnce(&mut ContextBuilder)) -> Context {
        let mut builder = ContextBuilder {
            entries: self.entries.to_vec(),
        };
        updates(&mut builder);
        Context {
            id: NEXT_SNAPSHOT_ID.fetch_add(1, Ordering::Relaxed),
            entries: Arc::from(builder.entries),
        }
    }

    fn position(&self, key_id: u64) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&key_id, |entry| entry.key_id)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::root()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Context {}

impl Hash for Context {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("snapshot", &self.id)
            .field("keys", &self.key_names().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ContextBuilder
// ---------------------------------------------------------------------------

/// Staging area handed to [`Context::derive`].
pub struct ContextBuilder {
    entries: Vec<Entry>,
}

impl ContextBuilder {
    pub fn set<T: Send + Sync + 'static>(&mut self, key: &ContextKey<T>, value: T) -> &mut Self {
        let entry = Entry {
            key_id: key.id(),
            name: key.name(),
            value: Arc::new(value),
        };
        match self.position(key.id()) {
            Ok(idx) => self.entries[idx] = entry,
            Err(idx) => self.entries.insert(idx, entry),
        }
        self
    }

    pub fn remove<T: 'static>(&mut self, key: &ContextKey<T>) -> &mut Self {
        if let Ok(idx) = self.position(key.id()) {
            self.entries.remove(idx);
        }
        self
    }

    fn position(&self, key_id: u64) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&key_id, |entry| entry.key_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
