//! Prepared statement handles and the per-connection prepared cache.
//!
//! The cache only answers "was this exact query text already prepared on the
//! current physical connection". It exists to avoid duplicate-prepare errors,
//! not to bound memory, so there is no eviction beyond the full clear on
//! disconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// A caller-held handle to a named server-side statement.
///
/// The identification is generated once per handle and stays stable across
/// reconnects; whether the server currently knows it is tracked by
/// [`PreparedCache`].
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    identification: String,
    query: String,
}

static NEXT_STATEMENT_ID: AtomicU32 = AtomicU32::new(0);

impl PreparedStatement {
    pub fn new(query: impl Into<String>) -> Self {
        let id = NEXT_STATEMENT_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            identification: format!("dblane_{}", id),
            query: query.into(),
        }
    }

    pub fn identification(&self) -> &str {
        &self.identification
    }

    pub fn query(&self) -> &str {
        &self.query
    }
}

/// Query texts prepared on the current physical connection.
#[derive(Debug, Default)]
pub struct PreparedCache {
    // query text -> server-side statement name
    prepared: HashMap<String, String>,
}

impl PreparedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server-side name for `query`, if it was already prepared.
    pub fn lookup(&self, query: &str) -> Option<&str> {
        self.prepared.get(query).map(String::as_str)
    }

    pub fn contains(&self, query: &str) -> bool {
        self.prepared.contains_key(query)
    }

    /// Record a completed prepare.
    pub fn insert(&mut self, query: String, name: String) {
        self.prepared.insert(query, name);
    }

    pub fn len(&self) -> usize {
        self.prepared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prepared.is_empty()
    }

    /// Forget everything. Called on any transition to `Disconnected`; the
    /// server-side statements die with the connection.
    pub fn clear(&mut self) {
        self.prepared.clear();
    }
}
