//! Sentinel relay - reschedules scan work between certificate, DNS and probe tools.
//!
//! The relay sits between external scanning tools that talk over NSQ. Each
//! stage consumes one tool's output, derives the next round of work, stamps
//! it with a later `scan_after`, and publishes it back. Along the way it
//! keeps persistent counters and a per-subject result log.
//!
//! # Architecture
//!
//! ```text
//! certstream ──► certstream stage ──► zdns
//! zdns_results ──► zdns_<tier> ──► zgrab, zdns_<tier>
//! zgrab_results ──► zgrab_<tier> ──► zgrab_<tier>
//! ```
//!
//! - **transport**: [`Broker`] abstraction over NSQ, plus an in-memory broker
//! - **stage**: per-tool [`StageRules`] and the [`RelayStage`] consume loop
//! - **pipeline**: [`PipelineGraph`] wires stages from a [`PipelineConfig`]
//!
//! Counters land in a [`CounterStore`](sentinel_store::CounterStore) and raw
//! results in a [`ResultLog`](sentinel_store::ResultLog), both shared by every
//! stage.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod stage;
pub mod transport;

pub use config::{PipelineConfig, Tier};
pub use error::{Error, Result};
pub use pipeline::{PipelineGraph, RunningPipeline};
pub use stage::{RelayStage, StageConfig, StageRules};
pub use transport::{Broker, Delivery, MemoryBroker, NsqBroker, NsqConfig, Subscription};
