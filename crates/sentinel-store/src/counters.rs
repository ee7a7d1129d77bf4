//! Named integer counters.
//!
//! Increments are merge operands, never read-modify-write, so any number of
//! tasks can bump the same key without losing updates.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::engine::{KeyValueEngine, prefix_upper_bound};
use crate::error::Result;
use crate::memory::MemoryEngine;
use crate::merge::{CounterMerge, parse_counter};
use crate::rocks::RocksEngine;

/// Merge-based counter store.
///
/// Thread-safe: share it across stages via `Arc<CounterStore>`.
pub struct CounterStore {
    engine: Arc<dyn KeyValueEngine>,
}

impl CounterStore {
    /// Open or create a durable counter store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let engine = RocksEngine::open(path, Arc::new(CounterMerge))?;
        Ok(Self::with_engine(Arc::new(engine)))
    }

    /// Counter store that lives only in memory.
    pub fn in_memory() -> Self {
        Self::with_engine(Arc::new(MemoryEngine::new(Arc::new(CounterMerge))))
    }

    /// Wrap an engine that was opened with [`CounterMerge`].
    pub fn with_engine(engine: Arc<dyn KeyValueEngine>) -> Self {
        Self { engine }
    }

    /// Add one to `key`.
    pub fn incr(&self, key: &str) -> Result<()> {
        self.incr_by(key, 1)
    }

    /// Add `n` to `key`.
    pub fn incr_by(&self, key: &str, n: i64) -> Result<()> {
        self.engine
            .merge(key.as_bytes(), n.to_string().as_bytes(), false)
    }

    /// Current value of `key`.
    ///
    /// A key that was never incremented is created with `0`.
    pub fn get(&self, key: &str) -> Result<i64> {
        match self.engine.get(key.as_bytes())? {
            Some(value) => Ok(parse_counter(&value)),
            None => {
                self.engine.set(key.as_bytes(), b"0", true)?;
                Ok(0)
            }
        }
    }

    /// Every counter whose key starts with `prefix` (all counters when `None`
    /// or empty), ordered by key.
    pub fn fetch_all(&self, prefix: Option<&[u8]>) -> Result<BTreeMap<String, i64>> {
        let lower = prefix.unwrap_or_default();
        let upper = prefix_upper_bound(lower);

        let mut counters = BTreeMap::new();
        for item in self.engine.iterate(lower, upper.as_deref())? {
            let (key, value) = item?;
            counters.insert(
                String::from_utf8_lossy(&key).into_owned(),
                parse_counter(&value),
            );
        }
        Ok(counters)
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.engine.flush()
    }

    /// Approximate number of counters.
    pub fn approximate_count(&self) -> Result<u64> {
        self.engine.approximate_count()
    }
}
