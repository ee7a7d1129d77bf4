//! In-memory implementation of [`KeyValueEngine`].
//!
//! Nothing is persisted. Merges are applied eagerly under the write lock, so
//! reads never see pending operands.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::engine::{Batch, BatchOp, KeyValueEngine, KvIter, KvPair};
use crate::error::Result;
use crate::merge::MergeOperator;

/// Ephemeral engine backed by a `BTreeMap`.
pub struct MemoryEngine {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    operator: Arc<dyn MergeOperator>,
}

impl MemoryEngine {
    /// Create an empty engine with `operator` registered.
    pub fn new(operator: Arc<dyn MergeOperator>) -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            operator,
        }
    }
}

impl KeyValueEngine for MemoryEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn write(&self, batch: Batch, _sync: bool) -> Result<()> {
        let mut data = self.data.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Set { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Merge { key, operand } => {
                    let merged = self.operator.merge(data.get(&key).map(Vec::as_slice), &operand);
                    data.insert(key, merged);
                }
            }
        }
        Ok(())
    }

    fn iterate<'a>(&'a self, lower: &[u8], upper: Option<&[u8]>) -> Result<KvIter<'a>> {
        if let Some(upper) = upper
            && upper <= lower
        {
            return Ok(Box::new(std::iter::empty()));
        }

        let upper_bound = match upper {
            Some(upper) => Bound::Excluded(upper),
            None => Bound::Unbounded,
        };

        // Snapshot the range so the lock isn't held while the caller iterates.
        let snapshot: Vec<KvPair> = self
            .data
            .read()
            .range::<[u8], _>((Bound::Included(lower), upper_bound))
            .map(|(k, v)| (k.clone().into_boxed_slice(), v.clone().into_boxed_slice()))
            .collect();

        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn approximate_count(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::CounterMerge;

    #[test]
    fn test_merge_applies_eagerly() {
        let engine = MemoryEngine::new(Arc::new(CounterMerge));
        engine.merge(b"k", b"1", false).unwrap();
        engine.merge(b"k", b"1", false).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"2".to_vec()));
        assert_eq!(engine.approximate_count().unwrap(), 1);
    }

    #[test]
    fn test_iterate_inverted_bounds_is_empty() {
        let engine = MemoryEngine::new(Arc::new(CounterMerge));
        engine.set(b"b", b"1", false).unwrap();
        assert_eq!(engine.iterate(b"c", Some(b"a".as_slice())).unwrap().count(), 0);
        assert_eq!(engine.iterate(b"b", Some(b"b".as_slice())).unwrap().count(), 0);
        assert_eq!(engine.iterate(b"a", Some(b"c".as_slice())).unwrap().count(), 1);
    }
}
