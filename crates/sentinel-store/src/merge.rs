//! Associative merge operators.
//!
//! A merge operator combines a key's existing value with a new operand. The
//! engine may apply it eagerly at write time, lazily when a read finds a
//! stack of pending operands, or partially during compaction when only some
//! operands are visible. Both operators here are associative, so every one of
//! those orders produces the same result.

use tracing::error;

/// Pure value-combining function registered with an engine at open time.
pub trait MergeOperator: Send + Sync + 'static {
    /// Name recorded by the engine; must stay stable for an existing store.
    fn name(&self) -> &'static str;

    /// Combine `existing` (if any) with one `operand`.
    fn merge(&self, existing: Option<&[u8]>, operand: &[u8]) -> Vec<u8>;

    /// Fold a run of operands, oldest first, onto `existing`.
    fn fold(&self, existing: Option<&[u8]>, operands: &mut dyn Iterator<Item = &[u8]>) -> Vec<u8> {
        let mut acc: Option<Vec<u8>> = existing.map(<[u8]>::to_vec);
        for operand in operands {
            acc = Some(self.merge(acc.as_deref(), operand));
        }
        acc.unwrap_or_default()
    }
}

/// Decimal integer counters: `merge(existing, operand) = existing + operand`.
///
/// Malformed values count as zero and are logged; a corrupt operand never
/// fails the merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterMerge;

impl CounterMerge {
    /// Operator name registered with RocksDB.
    pub const NAME: &'static str = "SentinelCounterStore";
}

/// Parse a stored counter value, treating anything malformed as zero.
pub fn parse_counter(value: &[u8]) -> i64 {
    match std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
    {
        Some(v) => v,
        None => {
            error!(
                value = %String::from_utf8_lossy(value),
                "malformed counter value, treating as 0"
            );
            0
        }
    }
}

impl MergeOperator for CounterMerge {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn merge(&self, existing: Option<&[u8]>, operand: &[u8]) -> Vec<u8> {
        let base = existing.map(parse_counter).unwrap_or(0);
        base.saturating_add(parse_counter(operand))
            .to_string()
            .into_bytes()
    }

    fn fold(&self, existing: Option<&[u8]>, operands: &mut dyn Iterator<Item = &[u8]>) -> Vec<u8> {
        let base = existing.map(parse_counter).unwrap_or(0);
        operands
            .map(parse_counter)
            .fold(base, i64::saturating_add)
            .to_string()
            .into_bytes()
    }
}

/// Byte concatenation: `merge(existing, operand) = existing ++ operand`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendMerge;

impl AppendMerge {
    /// Operator name registered with RocksDB.
    pub const NAME: &'static str = "SentinelResultLog";
}

impl MergeOperator for AppendMerge {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn merge(&self, existing: Option<&[u8]>, operand: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(existing.map_or(0, <[u8]>::len) + operand.len());
        if let Some(existing) = existing {
            out.extend_from_slice(existing);
        }
        out.extend_from_slice(operand);
        out
    }

    fn fold(&self, existing: Option<&[u8]>, operands: &mut dyn Iterator<Item = &[u8]>) -> Vec<u8> {
        let mut out = existing.map(<[u8]>::to_vec).unwrap_or_default();
        for operand in operands {
            out.extend_from_slice(operand);
        }
        out
    }
}
