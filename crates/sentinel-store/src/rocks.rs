//! RocksDB implementation of [`KeyValueEngine`].
//!
//! # Merge operator
//!
//! The operator is registered with `set_merge_operator_associative`, so
//! RocksDB calls the same fold for full merges (base value + operands) and
//! partial merges (operands only, during compaction). Operand order within a
//! fold is oldest to newest; because both operators are associative, a
//! partial merge followed by a full merge gives the same bytes as one full
//! merge.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    DBWithThreadMode, IteratorMode, MergeOperands, MultiThreaded, Options, ReadOptions,
    WriteBatch, WriteOptions,
};
use tracing::info;

use crate::engine::{Batch, BatchOp, KeyValueEngine, KvIter};
use crate::error::Result;
use crate::merge::MergeOperator;

/// RocksDB-backed engine.
///
/// Thread-safe: can be shared across tasks via `Arc<RocksEngine>`.
pub struct RocksEngine {
    db: DBWithThreadMode<MultiThreaded>,
}

impl RocksEngine {
    /// Open or create an engine at `path` with `operator` registered.
    pub fn open<P: AsRef<Path>>(path: P, operator: Arc<dyn MergeOperator>) -> Result<Self> {
        let path = path.as_ref();
        info!(
            "Opening store at {} (merge operator {})",
            path.display(),
            operator.name()
        );

        let mut opts = Options::default();
        opts.create_if_missing(true);

        // Small values, many merges: keep memtables modest.
        opts.set_write_buffer_size(32 * 1024 * 1024); // 32MB write buffer
        opts.set_max_write_buffer_number(3);

        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        // Parallelism
        opts.increase_parallelism(num_cpus::get().min(4) as i32);
        opts.set_max_background_jobs(4);

        let name = operator.name();
        opts.set_merge_operator_associative(
            name,
            move |_key: &[u8], existing: Option<&[u8]>, operands: &MergeOperands| {
                Some(operator.fold(existing, &mut operands.iter()))
            },
        );

        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path)?;

        Ok(Self { db })
    }

    fn write_options(sync: bool) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(sync);
        write_opts
    }

    /// Compact the whole key range, forcing merge operands through compaction.
    #[cfg(test)]
    pub(crate) fn compact(&self) {
        self.db.compact_range::<&[u8], &[u8]>(None, None);
    }
}

impl KeyValueEngine for RocksEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn write(&self, batch: Batch, sync: bool) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut rocks_batch = WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Set { key, value } => rocks_batch.put(key, value),
                BatchOp::Merge { key, operand } => rocks_batch.merge(key, operand),
            }
        }

        self.db.write_opt(rocks_batch, &Self::write_options(sync))?;
        Ok(())
    }

    fn iterate<'a>(&'a self, lower: &[u8], upper: Option<&[u8]>) -> Result<KvIter<'a>> {
        let mut read_opts = ReadOptions::default();
        if !lower.is_empty() {
            read_opts.set_iterate_lower_bound(lower.to_vec());
        }
        if let Some(upper) = upper {
            read_opts.set_iterate_upper_bound(upper.to_vec());
        }

        let iter = self
            .db
            .iterator_opt(IteratorMode::Start, read_opts)
            .map(|item| item.map_err(Into::into));
        Ok(Box::new(iter))
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn approximate_count(&self) -> Result<u64> {
        let count = self
            .db
            .property_int_value("rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        Ok(count)
    }
}
