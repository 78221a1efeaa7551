use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};

/// The (user, scope) a set of server configs belongs to. A scope is usually
/// a project or workspace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub user_id: String,
    pub scope: String,
}

impl ScopeKey {
    pub fn new(user_id: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            scope: scope.into(),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.scope)
    }
}

/// Which cached sessions were built from which scope's configs.
#[derive(Debug, Default)]
pub struct CacheKeyRegistry {
    scopes: Mutex<BTreeMap<ScopeKey, BTreeSet<String>>>,
}

impl CacheKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn scopes(&self) -> MutexGuard<'_, BTreeMap<ScopeKey, BTreeSet<String>>> {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, key: &ScopeKey, session_id: &str) {
        self.scopes()
            .entry(key.clone())
            .or_default()
            .insert(session_id.to_string());
    }

    pub fn sessions(&self, key: &ScopeKey) -> Vec<String> {
        self.scopes()
            .get(key)
            .map(|sessions| sessions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove and return every session of `key`.
    pub fn take(&self, key: &ScopeKey) -> Vec<String> {
        self.scopes()
            .remove(key)
            .map(|sessions| sessions.into_iter().collect())
            .unwrap_or_default()
    }

    /// Drop `session_id` from every scope it was registered under.
    pub fn forget_session(&self, session_id: &str) {
        self.scopes().retain(|_, sessions| {
            sessions.remove(session_id);
            !sessions.is_empty()
        });
    }
}
