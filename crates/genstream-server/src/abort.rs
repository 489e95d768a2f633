//! Session id to cancellation handle map.
//!
//! Handles are owned by the registry, not by any client connection, so a job
//! can be cancelled from a channel other than the one that started it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct AbortRegistry {
    handles: Mutex<HashMap<String, CancellationToken>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register the handle for a session, replacing any previous one.
    pub fn register(&self, session_id: &str, handle: CancellationToken) {
        self.handles().insert(session_id.to_string(), handle);
    }

    pub fn lookup(&self, session_id: &str) -> Option<CancellationToken> {
        self.handles().get(session_id).cloned()
    }

    pub fn unregister(&self, session_id: &str) -> Option<CancellationToken> {
        self.handles().remove(session_id)
    }

    /// Signal the session's handle. Returns false if none is registered.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.lookup(session_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_lookup_cancel() {
        let registry = AbortRegistry::new();
        let token = CancellationToken::new();
        registry.register("S1", token.clone());

        let found = registry.lookup("S1").unwrap();
        assert!(!found.is_cancelled());
        assert!(registry.cancel("S1"));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_unknown_and_unregistered() {
        let registry = AbortRegistry::new();
        assert!(registry.lookup("S1").is_none());
        assert!(!registry.cancel("S1"));

        registry.register("S1", CancellationToken::new());
        assert!(registry.unregister("S1").is_some());
        assert!(registry.is_empty());
        assert!(!registry.cancel("S1"));
    }
}
