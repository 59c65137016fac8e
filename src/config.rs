//! Misuse reporting configuration.
//!
//! Protocol misuse and restoration hazards never hand one fiber's context to
//! another undetected, but they always point at a bug in the embedding
//! scheduler or in fiber code. How loudly they are reported is configured
//! process-wide, with a per-thread override for tests and tooling.

use std::cell::RefCell;
use std::env;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Environment variable read by [`ContextConfig::from_env`].
pub const MISMATCH_ENV_VAR: &str = "FIBER_CONTEXT_MISMATCH";

// ---------------------------------------------------------------------------
// MismatchBehavior
// ---------------------------------------------------------------------------

/// What to do when a hazard is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MismatchBehavior {
    /// Log a warning and continue.
    Warn,
    /// Panic. Downgraded to a warning while the thread is already unwinding.
    Raise,
    /// Ignore the hazard.
    Silent,
}

impl MismatchBehavior {
    /// `Raise` in debug builds, `Warn` in release builds.
    pub fn build_default() -> Self {
        if cfg!(debug_assertions) {
            Self::Raise
        } else {
            Self::Warn
        }
    }

    /// Parse a behaviour name (`warn`, `raise`/`panic`, `silent`/`off`).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "warn" => Some(Self::Warn),
            "raise" | "panic" => Some(Self::Raise),
            "silent" | "off" => Some(Self::Silent),
            _ => None,
        }
    }
}

impl Default for MismatchBehavior {
    fn default() -> Self {
        Self::build_default()
    }
}

// ---------------------------------------------------------------------------
// ContextConfig
// ---------------------------------------------------------------------------

/// Reporting behaviour for each hazard class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// A scope token released out of LIFO order, or on a carrier that does
    /// not know it.
    pub scope_mismatch: MismatchBehavior,
    /// Resume/suspend called out of protocol by a scheduler adapter.
    pub protocol_misuse: MismatchBehavior,
    /// A fiber suspended while a scope it opened is still open.
    pub straddling_scope: MismatchBehavior,
}

impl ContextConfig {
    /// Use the same behaviour for every hazard class.
    pub fn uniform(behavior: MismatchBehavior) -> Self {
        Self {
            scope_mismatch: behavior,
            protocol_misuse: behavior,
            straddling_scope: behavior,
        }
    }

    /// Build the configuration from `FIBER_CONTEXT_MISMATCH`, falling back to
    /// the build default when the variable is unset or unparseable.
    pub fn from_env() -> Self {
        match env::var(MISMATCH_ENV_VAR) {
            Ok(value) => match MismatchBehavior::parse(&value) {
                Some(behavior) => Self::uniform(behavior),
                None => {
                    log::warn!(
                        "[fiber-context] ignoring {}={:?}: expected warn, raise or silent",
                        MISMATCH_ENV_VAR,
                        value
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Process and thread state
// ---------------------------------------------------------------------------

static GLOBAL_CONFIG: Lazy<RwLock<ContextConfig>> =
    Lazy::new(|| RwLock::new(ContextConfig::from_env()));

thread_local! {
    /// Per-thread configuration override (falls back to GLOBAL_CONFIG).
    static THREAD_CONFIG: RefCell<Option<ContextConfig>> = const { RefCell::new(None) };
}

/// Replace the process-wide configuration.
pub fn set_global_config(config: ContextConfig) {
    *GLOBAL_CONFIG.write() = config;
}

/// The configuration in effect on the calling thread.
pub fn config() -> ContextConfig {
    THREAD_CONFIG
        .try_with(|cell| *cell.borrow())
        .ok()
        .flatten()
        .unwrap_or_else(|| *GLOBAL_CONFIG.read())
}

/// RAII guard installing a configuration for the calling thread only.
///
/// Dropping it restores whatever override was active before.
pub struct ConfigOverride {
    previous: Option<ContextConfig>,
}

impl ConfigOverride {
    pub fn new(config: ContextConfig) -> Self {
        let previous = THREAD_CONFIG.with(|cell| cell.borrow_mut().replace(config));
        Self { previous }
    }
}

impl Drop for ConfigOverride {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = THREAD_CONFIG.try_with(|cell| *cell.borrow_mut() = previous);
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// Hazard classes routed through [`ContextConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Hazard {
    ScopeMismatch,
    ProtocolMisuse,
    StraddlingScope,
}

pub(crate) fn report(hazard: Hazard, message: &str) {
    let cfg = config();
    let behavior = match hazard {
        Hazard::ScopeMismatch => cfg.scope_mismatch,
        Hazard::ProtocolMisuse => cfg.protocol_misuse,
        Hazard::StraddlingScope => cfg.straddling_scope,
    };
    match behavior {
        MismatchBehavior::Raise if !std::thread::panicking() => {
            panic!("[fiber-context] {}", message)
        }
        MismatchBehavior::Raise | MismatchBehavior::Warn => {
            log::warn!("[fiber-context] {}", message)
        }
        MismatchBehavior::Silent => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_behavior_names() {
        assert_eq!(MismatchBehavior::parse("warn"), Some(MismatchBehavior::Warn));
        assert_eq!(MismatchBehavior::parse(" RAISE "), Some(MismatchBehavior::Raise));
        assert_eq!(MismatchBehavior::parse("panic"), Some(MismatchBehavior::Raise));
        assert_eq!(MismatchBehavior::parse("off"), Some(MismatchBehavior::Silent));
        assert_eq!(MismatchBehavior::parse("loud"), None);
    }

    #[test]
    fn test_build_default_raises_in_debug() {
        if cfg!(debug_assertions) {
            assert_eq!(MismatchBehavior::default(), MismatchBehavior::Raise);
        } else {
            assert_eq!(MismatchBehavior::default(), MismatchBehavior::Warn);
        }
    }

    #[test]
    fn test_override_is_scoped_to_guard() {
        let outer = config();
        {
            let _silent = ConfigOverride::new(ContextConfig::uniform(MismatchBehavior::Silent));
            assert_eq!(config().scope_mismatch, MismatchBehavior::Silent);
            {
                let _warn = ConfigOverride::new(ContextConfig::uniform(MismatchBehavior::Warn));
                assert_eq!(config().protocol_misuse, MismatchBehavior::Warn);
            }
            assert_eq!(config().protocol_misuse, MismatchBehavior::Silent);
        }
        assert_eq!(config(), outer);
    }

    #[test]
    fn test_override_does_not_cross_threads() {
        let _silent = ConfigOverride::new(ContextConfig::uniform(MismatchBehavior::Silent));
        let other = std::thread::spawn(config).join().unwrap();
        assert_eq!(other, *GLOBAL_CONFIG.read());
    }

    #[test]
    fn test_config_deserializes_partial_json() {
        let cfg: ContextConfig =
            serde_json::from_str(r#"{"scope_mismatch": "silent", "protocol_misuse": "warn"}"#)
                .unwrap();
        assert_eq!(cfg.scope_mismatch, MismatchBehavior::Silent);
        assert_eq!(cfg.protocol_misuse, MismatchBehavior::Warn);
        assert_eq!(cfg.straddling_scope, MismatchBehavior::build_default());
    }

    #[test]
    fn test_silent_report_is_quiet() {
        let _silent = ConfigOverride::new(ContextConfig::uniform(MismatchBehavior::Silent));
        report(Hazard::ScopeMismatch, "ignored");
    }

    #[test]
    #[should_panic(expected = "[fiber-context] boom")]
    fn test_raise_report_panics() {
        let _raise = ConfigOverride::new(ContextConfig::uniform(MismatchBehavior::Raise));
        report(Hazard::ProtocolMisuse, "boom");
    }
}
