//! Cooperative cancellation: an `AtomicBool` flag checked at loop boundaries,
//! generalized into a cloneable token shared by every long-running operation
//! (download, sign, diff, patch, heal, install perform, launch) plus a
//! process-wide registry keyed by operation id so an RPC `*.Cancel` call can
//! reach the right token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::{CoreError, Result};

/// A cheaply-cloneable flag. `check()` is called at every per-file,
/// per-block and per-RPC boundary; once fired it returns `CoreError::Cancelled`
/// forever after, a sentinel distinguishable from ordinary I/O failure.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    fired: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` if fired, `Ok(())` otherwise; call sites use
    /// `cancel.check()?` at each such boundary.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Process-wide registry mapping an operation id to its token, guarded by a
/// single mutex.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, operation_id: impl Into<String>) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().unwrap().insert(operation_id.into(), token.clone());
        token
    }

    pub fn cancel(&self, operation_id: &str) -> bool {
        if let Some(token) = self.tokens.lock().unwrap().get(operation_id) {
            token.fire();
            true
        } else {
            false
        }
    }

    pub fn retire(&self, operation_id: &str) {
        self.tokens.lock().unwrap().remove(operation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fired_token_reports_cancelled() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.fire();
        assert!(matches!(token.check(), Err(CoreError::Cancelled)));
    }

    #[test]
    fn registry_cancel_reaches_registered_token() {
        let registry = CancelRegistry::new();
        let token = registry.register("op-1");
        assert!(!token.is_cancelled());
        assert!(registry.cancel("op-1"));
        assert!(token.is_cancelled());
        assert!(!registry.cancel("no-such-op"));
    }

    #[test]
    fn retire_removes_token_from_registry() {
        let registry = CancelRegistry::new();
        registry.register("op-2");
        registry.retire("op-2");
        assert!(!registry.cancel("op-2"));
    }
}
