//! Core types and shared utilities for the Sentinel relay pipeline.
//!
//! This crate provides:
//! - The [`ScanRecord`] model that flows between relay stages
//! - Subject and fingerprint normalization
//! - Decoding and encoding of the scan tools' JSON messages
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
pub mod metrics;
pub mod record;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Namespace prefix for every pipeline counter key.
pub const COUNTER_NAMESPACE: &str = "monitor";

/// Build a counter key of the form `<namespace>|<stage>|<metric>`.
pub fn counter_key(stage: &str, metric: &str) -> String {
    format!("{COUNTER_NAMESPACE}|{stage}|{metric}")
}

pub use error::{Error, Result};
pub use record::{
    CertificateUpdate, LeafCert, PROBE_SUCCESS, ProbeModule, ProbeRequest, ProbeResult,
    RESOLVE_SUCCESS, RecordKind, RecordMetadata, ResolveData, ResolveRequest, ResolveResult,
    ScanRecord, WireFormat, compact_json, normalize_domain, normalize_fingerprint,
    unique_domains, unix_now,
};
