//! Persistent state for the Sentinel relay pipeline.
//!
//! Two independent stores sit on top of an ordered key-value engine with a
//! registered merge operator:
//!
//! - [`CounterStore`] - named integer counters, incremented by merging `"1"`
//! - [`ResultLog`] - per-key newline-delimited history, extended by merge-append
//!
//! Both are normally opened on [`RocksEngine`]; [`MemoryEngine`] backs tests.
//!
//! # Example
//!
//! ```ignore
//! use sentinel_store::CounterStore;
//!
//! let counters = CounterStore::open("./sentinel-stats")?;
//! counters.incr("monitor|certstream|cert_cnt")?;
//! assert_eq!(counters.get("monitor|certstream|cert_cnt")?, 1);
//! ```

mod counters;
mod engine;
mod error;
mod memory;
mod merge;
mod results;
mod rocks;

pub use counters::CounterStore;
pub use engine::{Batch, BatchOp, KeyValueEngine, KvIter, KvPair, prefix_upper_bound};
pub use error::{Error, Result};
pub use memory::MemoryEngine;
pub use merge::{AppendMerge, CounterMerge, MergeOperator, parse_counter};
pub use results::ResultLog;
pub use rocks::RocksEngine;
