//! Well-known ambient values: the active span, baggage and diagnostic
//! attributes (the mapped diagnostic context read by log mapping).

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use opentelemetry::trace::SpanContext;
use serde::{Deserialize, Serialize};

use super::{Context, ContextKey};

static SPAN_CONTEXT: Lazy<ContextKey<SpanContext>> = Lazy::new(|| ContextKey::new("span_context"));
static BAGGAGE: Lazy<ContextKey<Attributes>> = Lazy::new(|| ContextKey::new("baggage"));
static DIAGNOSTICS: Lazy<ContextKey<Attributes>> = Lazy::new(|| ContextKey::new("diagnostics"));

static EMPTY_ATTRIBUTES: Attributes = Attributes::new();

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Ordered string map used for baggage and diagnostic attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, String>);

impl Attributes {
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// A copy of `self` with `key` set to `value`.
    pub fn with(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut map = self.0.clone();
        map.insert(key.into(), value.into());
        Self(map)
    }

    /// A copy of `self` without `key`.
    pub fn without(&self, key: &str) -> Self {
        let mut map = self.0.clone();
        map.remove(key);
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ---------------------------------------------------------------------------
// Context accessors
// ---------------------------------------------------------------------------

impl Context {
    /// A new context whose active span is `span`.
    pub fn with_span_context(&self, span: SpanContext) -> Context {
        self.with_value(&*SPAN_CONTEXT, span)
    }

    pub fn span_context(&self) -> Option<&SpanContext> {
        self.get(&*SPAN_CONTEXT)
    }

    /// Whether a valid span is active in this context.
    pub fn has_active_span(&self) -> bool {
        self.span_context().is_some_and(SpanContext::is_valid)
    }

    pub fn with_baggage_item(&self, key: impl Into<String>, value: impl Into<String>) -> Context {
        let baggage = self.baggage().with(key, value);
        self.with_value(&*BAGGAGE, baggage)
    }

    pub fn baggage(&self) -> &Attributes {
        self.get(&*BAGGAGE).unwrap_or(&EMPTY_ATTRIBUTES)
    }

    /// A new context with diagnostic attribute `key` set to `value`.
    pub fn with_attribute(&self, key: impl Into<String>, value: impl Into<String>) -> Context {
        let attributes = self.attributes().with(key, value);
        self.with_value(&*DIAGNOSTICS, attributes)
    }

    pub fn without_attribute(&self, key: &str) -> Context {
        let attributes = self.attributes().without(key);
        self.with_value(&*DIAGNOSTICS, attributes)
    }

    /// Diagnostic attributes; empty when none were set.
    pub fn attributes(&self) -> &Attributes {
        self.get(&*DIAGNOSTICS).unwrap_or(&EMPTY_ATTRIBUTES)
    }
}
