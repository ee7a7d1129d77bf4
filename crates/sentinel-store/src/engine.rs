//! The ordered key-value engine contract shared by both stores.
//!
//! Engines are opened with a [`MergeOperator`](crate::MergeOperator) and
//! serialize their own writes, so callers never lock around them.
//!
//! - [`RocksEngine`](crate::RocksEngine) - durable, RocksDB-backed
//! - [`MemoryEngine`](crate::MemoryEngine) - ephemeral, for tests and dry runs

use crate::error::Result;

/// A key/value pair yielded by [`KeyValueEngine::iterate`].
pub type KvPair = (Box<[u8]>, Box<[u8]>);

/// Lazy, finite, key-ordered iterator over a range of the engine.
pub type KvIter<'a> = Box<dyn Iterator<Item = Result<KvPair>> + 'a>;

/// Ordered, durable key-value store with a registered merge operator.
pub trait KeyValueEngine: Send + Sync {
    /// Point lookup. Pending merge operands are folded before returning.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Apply every operation in `batch` atomically.
    ///
    /// With `sync` set the write is flushed to stable storage before returning.
    fn write(&self, batch: Batch, sync: bool) -> Result<()>;

    /// Iterate keys in `[lower, upper)` in lexicographic order.
    ///
    /// `upper = None` means unbounded. Each call starts a fresh iterator.
    fn iterate<'a>(&'a self, lower: &[u8], upper: Option<&[u8]>) -> Result<KvIter<'a>>;

    /// Flush memtables to disk.
    fn flush(&self) -> Result<()>;

    /// Approximate number of keys.
    fn approximate_count(&self) -> Result<u64>;

    /// Overwrite a single key.
    fn set(&self, key: &[u8], value: &[u8], sync: bool) -> Result<()> {
        let mut batch = Batch::new();
        batch.set(key, value);
        self.write(batch, sync)
    }

    /// Merge a single operand into a key.
    fn merge(&self, key: &[u8], operand: &[u8], sync: bool) -> Result<()> {
        let mut batch = Batch::new();
        batch.merge(key, operand);
        self.write(batch, sync)
    }
}

/// One operation inside a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Replace the key's value.
    Set { key: Vec<u8>, value: Vec<u8> },
    /// Combine an operand into the key's value via the merge operator.
    Merge { key: Vec<u8>, operand: Vec<u8> },
}

/// An ordered set of writes applied all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a set.
    pub fn set(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> &mut Self {
        self.ops.push(BatchOp::Set {
            key: key.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
        });
        self
    }

    /// Queue a merge.
    pub fn merge(&mut self, key: impl AsRef<[u8]>, operand: impl AsRef<[u8]>) -> &mut Self {
        self.ops.push(BatchOp::Merge {
            key: key.as_ref().to_vec(),
            operand: operand.as_ref().to_vec(),
        });
        self
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch has no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consume the batch, yielding operations in insertion order.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Smallest key strictly greater than every key starting with `prefix`.
///
/// Returns `None` when no such bound exists (empty prefix, or all `0xFF`),
/// meaning the range is unbounded above.
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < u8::MAX {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}
