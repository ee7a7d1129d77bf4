//! Append-only result history.
//!
//! Each key holds newline-delimited JSON blobs in append order. Entries are
//! never rewritten or removed.

use std::path::Path;
use std::sync::Arc;

use crate::engine::{Batch, KeyValueEngine};
use crate::error::Result;
use crate::memory::MemoryEngine;
use crate::merge::AppendMerge;
use crate::rocks::RocksEngine;

/// Merge-append result log.
pub struct ResultLog {
    engine: Arc<dyn KeyValueEngine>,
}

impl ResultLog {
    /// Open or create a durable result log at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let engine = RocksEngine::open(path, Arc::new(AppendMerge))?;
        Ok(Self::with_engine(Arc::new(engine)))
    }

    /// Result log that lives only in memory.
    pub fn in_memory() -> Self {
        Self::with_engine(Arc::new(MemoryEngine::new(Arc::new(AppendMerge))))
    }

    /// Wrap an engine that was opened with [`AppendMerge`].
    pub fn with_engine(engine: Arc<dyn KeyValueEngine>) -> Self {
        Self { engine }
    }

    /// Append `blob` as one line under `key`. Durable on return.
    pub fn append(&self, key: &str, blob: &[u8]) -> Result<()> {
        let mut line = Vec::with_capacity(blob.len() + 1);
        line.extend_from_slice(blob);
        line.push(b'\n');

        let mut batch = Batch::new();
        batch.merge(key, line);
        self.engine.write(batch, true)
    }

    /// Full history for `key`, empty when nothing was appended.
    pub fn read(&self, key: &str) -> Result<Vec<u8>> {
        Ok(self.engine.get(key.as_bytes())?.unwrap_or_default())
    }

    /// History for `key` split into lines.
    pub fn entries(&self, key: &str) -> Result<Vec<String>> {
        let raw = self.read(key)?;
        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .map(str::to_owned)
            .collect())
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.engine.flush()
    }
}
