//! Rendered-statement cache.
//!
//! Statements are cached per descriptor so repeated operations against the
//! same namespace and column layout skip re-rendering. Capacity is bounded
//! by the connection-pool size, with least-recently-used eviction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::db::dialect::Dialect;
use crate::db::query::{PreparedSql, QueryDescriptor};

/// LRU cache of rendered statements, keyed by descriptor.
///
/// Rendering happens at most once per descriptor: the single lock covers
/// lookup and render, so concurrent first uses cannot register the same
/// statement twice. Eviction only drops the map entry; holders of a
/// previously returned `Arc` are unaffected.
pub struct StatementCache {
    dialect: Dialect,
    capacity: usize,
    /// std Mutex, never held across an await point.
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    entries: HashMap<QueryDescriptor, CacheEntry>,
    tick: u64,
}

struct CacheEntry {
    prepared: Arc<PreparedSql>,
    last_used: u64,
}

impl StatementCache {
    /// Create a cache holding at most `capacity` statements.
    pub fn new(dialect: Dialect, capacity: u32) -> Self {
        Self {
            dialect,
            capacity: capacity.max(1) as usize,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                tick: 0,
            }),
        }
    }

    /// Look up the statement for a descriptor, rendering it on first use.
    pub fn get(&self, descriptor: &QueryDescriptor) -> Arc<PreparedSql> {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(entry) = inner.entries.get_mut(descriptor) {
            entry.last_used = tick;
            return Arc::clone(&entry.prepared);
        }

        if inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            {
                inner.entries.remove(&oldest);
                debug!(namespace = %oldest.namespace(), "evicted cached statement");
            }
        }

        let prepared = Arc::new(self.dialect.render(descriptor));
        debug!(sql = %prepared.sql, "rendered statement");
        inner.entries.insert(
            descriptor.clone(),
            CacheEntry {
                prepared: Arc::clone(&prepared),
                last_used: tick,
            },
        );
        prepared
    }

    /// Number of cached statements.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
