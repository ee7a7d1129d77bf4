//! Scan records and the JSON message formats exchanged with the scan tools.
//!
//! A [`ScanRecord`] is the unit that flows between relay stages. Records are
//! ephemeral: a stage derives them from one inbound message, stamps a new
//! `scan_after`, encodes them with a [`WireFormat`] and publishes them.
//!
//! # Message formats
//!
//! ```text
//! certificate event  {"data": {"update_type", "leaf_cert": {"all_domains", "fingerprint"}}}
//! resolve request    {"domain", "metadata": {"cert_sha1", "scan_after", "cert_type"}}
//! resolve result     {"name", "status", "data": {"ipv4_addresses", "ipv6_addresses"}, "metadata"}
//! probe request      {"sni", "ip", "metadata"}
//! probe result       {"ip", "domain", "data": {<module>: {"status"}}, "metadata"}
//! ```
//!
//! The scan tools pass `metadata` through untouched, which is how a record's
//! schedule survives a round trip through DNS resolution or probing.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// Status reported by the DNS tool for a successful lookup.
pub const RESOLVE_SUCCESS: &str = "NOERROR";

/// Status reported by each probe module on success.
pub const PROBE_SUCCESS: &str = "success";

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Re-encode a JSON message on a single line.
///
/// Result logs hold one entry per line, so raw tool output is compacted
/// before it is stored.
pub fn compact_json(body: &[u8]) -> Result<Vec<u8>> {
    let value: serde_json::Value = serde_json::from_slice(body)?;
    Ok(serde_json::to_vec(&value)?)
}

// ═══════════════════════════════════════════════════════════════════════════
// Normalization
// ═══════════════════════════════════════════════════════════════════════════

/// Normalize a certificate domain into a subject key.
///
/// Strips a single leading `*.` wildcard label and case-folds the rest.
/// Returns `None` for names that are empty afterwards or still contain a
/// wildcard (e.g. `foo.*.example.com`), since those can't be resolved.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let stripped = trimmed.strip_prefix("*.").unwrap_or(trimmed);
    let subject = stripped.to_lowercase();

    if subject.is_empty() || subject.contains('*') {
        return None;
    }
    Some(subject)
}

/// Normalize a certificate fingerprint: drop `:` separators, lower-case.
pub fn normalize_fingerprint(raw: &str) -> String {
    raw.trim().replace(':', "").to_lowercase()
}

/// Normalize and deduplicate a certificate's domain list.
///
/// `*.example.com` and `example.com` collapse into one subject. The result is
/// sorted, which keeps fan-out order deterministic.
pub fn unique_domains<'a, I>(domains: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a String>,
{
    domains
        .into_iter()
        .filter_map(|d| normalize_domain(d))
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// Scan records
// ═══════════════════════════════════════════════════════════════════════════

/// Where a record originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Derived from a certificate-transparency log entry.
    Certificate,
    /// Derived from a DNS resolution result.
    Resolution,
    /// Derived from a network probe result.
    Probe,
}

impl RecordKind {
    /// Short label used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Certificate => "certificate",
            Self::Resolution => "resolution",
            Self::Probe => "probe",
        }
    }
}

/// The unit flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    /// Normalized domain name or IP address the record is about.
    pub subject: String,

    /// Normalized fingerprint of the certificate that introduced the subject.
    pub fingerprint: String,

    /// Origin of the record.
    pub kind: RecordKind,

    /// Unix timestamp before which the next stage should not scan.
    pub scan_after: i64,

    /// Addresses the subject resolved to (resolution records only).
    pub resolved_addresses: Vec<String>,

    /// Server name to present when probing an address subject.
    pub server_name: Option<String>,

    /// Certificate log entry type carried forward from certificate intake.
    pub cert_type: Option<String>,
}

impl ScanRecord {
    /// Create a record with no addresses or server name.
    pub fn new(
        subject: impl Into<String>,
        fingerprint: impl Into<String>,
        kind: RecordKind,
        scan_after: i64,
    ) -> Self {
        Self {
            subject: subject.into(),
            fingerprint: fingerprint.into(),
            kind,
            scan_after,
            resolved_addresses: Vec::new(),
            server_name: None,
            cert_type: None,
        }
    }

    /// Attach the server name used for probing.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Attach resolved addresses.
    pub fn with_addresses(mut self, addresses: Vec<String>) -> Self {
        self.resolved_addresses = addresses;
        self
    }

    /// Attach the certificate log entry type.
    pub fn with_cert_type(mut self, cert_type: Option<String>) -> Self {
        self.cert_type = cert_type.filter(|t| !t.is_empty());
        self
    }

    /// Push `scan_after` back by `delay_secs`.
    pub fn reschedule(&mut self, delay_secs: i64) {
        self.scan_after = self.scan_after.saturating_add(delay_secs);
    }

    /// Metadata block carried alongside the record on the wire.
    pub fn metadata(&self) -> RecordMetadata {
        RecordMetadata {
            cert_sha1: self.fingerprint.clone(),
            scan_after: self.scan_after,
            cert_type: self.cert_type.clone(),
        }
    }

    /// Encode the record as a single-line JSON message.
    pub fn encode(&self, format: WireFormat) -> Result<String> {
        let json = match format {
            WireFormat::ResolveRequest => serde_json::to_string(&ResolveRequest {
                domain: self.subject.clone(),
                metadata: self.metadata(),
            })?,
            WireFormat::ProbeRequest => {
                let Some(sni) = self.server_name.clone() else {
                    return Err(Error::InvalidField {
                        field: "sni",
                        reason: format!("probe record for {} has no server name", self.subject),
                    });
                };
                serde_json::to_string(&ProbeRequest {
                    sni,
                    ip: self.subject.clone(),
                    metadata: self.metadata(),
                })?
            }
        };
        Ok(json)
    }
}

/// Which downstream tool a record is encoded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Input for the DNS resolution tool.
    ResolveRequest,
    /// Input for the network probe tool.
    ProbeRequest,
}

// ═══════════════════════════════════════════════════════════════════════════
// Wire types
// ═══════════════════════════════════════════════════════════════════════════

/// Metadata block passed through the scan tools unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Normalized certificate fingerprint.
    #[serde(default)]
    pub cert_sha1: String,

    /// Schedule of the record, written as a decimal string.
    #[serde(default, with = "scan_after_format")]
    pub scan_after: i64,

    /// Certificate log entry type, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_type: Option<String>,
}

/// DNS resolution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub domain: String,
    pub metadata: RecordMetadata,
}

/// Network probe request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub sni: String,
    pub ip: String,
    pub metadata: RecordMetadata,
}

/// Certificate-transparency log update.
#[derive(Debug, Clone, Deserialize)]
pub struct CertificateUpdate {
    /// Log entry type, e.g. `PrecertLogEntry` or `X509LogEntry`.
    #[serde(default)]
    pub update_type: String,

    /// The leaf certificate.
    pub leaf_cert: LeafCert,
}

/// Leaf certificate fields the pipeline relies on.
#[derive(Debug, Clone, Deserialize)]
pub struct LeafCert {
    #[serde(default, deserialize_with = "null_as_default")]
    pub all_domains: Vec<String>,

    #[serde(default)]
    pub fingerprint: String,
}

/// Either a full certstream frame or its bare `data` object.
#[derive(Deserialize)]
#[serde(untagged)]
enum CertstreamFrame {
    Framed { data: CertificateUpdate },
    Bare(CertificateUpdate),
}

impl CertificateUpdate {
    /// Decode a certificate event from JSON.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        match serde_json::from_slice::<CertstreamFrame>(body)? {
            CertstreamFrame::Framed { data } | CertstreamFrame::Bare(data) => Ok(data),
        }
    }

    /// Normalized certificate fingerprint.
    pub fn fingerprint(&self) -> String {
        normalize_fingerprint(&self.leaf_cert.fingerprint)
    }

    /// Normalized, deduplicated, resolvable domains.
    pub fn subjects(&self) -> BTreeSet<String> {
        unique_domains(&self.leaf_cert.all_domains)
    }
}

/// Result emitted by the DNS resolution tool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResolveResult {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub status: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub data: ResolveData,

    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: RecordMetadata,
}

/// Answer section of a DNS resolution result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResolveData {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub ipv4_addresses: Vec<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub ipv6_addresses: Vec<String>,
}

impl ResolveResult {
    /// Decode a resolution result from JSON.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// The resolved name, preferring the answer section.
    pub fn resolved_name(&self) -> Option<&str> {
        self.data
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or(self.name.as_deref().filter(|n| !n.is_empty()))
    }

    /// Whether the tool reported a successful lookup.
    pub fn is_success(&self) -> bool {
        self.status == RESOLVE_SUCCESS
    }
}

/// Result emitted by the network probe tool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeResult {
    pub ip: String,

    #[serde(default)]
    pub domain: String,

    /// Per-module results keyed by module name (e.g. `tls`).
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: BTreeMap<String, ProbeModule>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: RecordMetadata,
}

/// The part of a probe module result the pipeline inspects.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeModule {
    #[serde(default)]
    pub status: Option<String>,
}

impl ProbeResult {
    /// Decode a probe result from JSON.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// True only when at least one module ran and every module succeeded.
    pub fn is_success(&self) -> bool {
        !self.data.is_empty()
            && self
                .data
                .values()
                .all(|m| m.status.as_deref() == Some(PROBE_SUCCESS))
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// `scan_after` is a decimal string on the wire; numbers are accepted too.
/// Anything unparseable reads as `0`.
mod scan_after_format {
    use serde::de::IgnoredAny;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Str(String),
        Other(IgnoredAny),
    }

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        let value = match Option::<Raw>::deserialize(deserializer)? {
            Some(Raw::Int(v)) => v,
            Some(Raw::Float(v)) => v as i64,
            Some(Raw::Str(s)) => s.trim().parse::<i64>().unwrap_or_else(|_| {
                tracing::debug!(value = %s, "unparseable scan_after, treating as 0");
                0
            }),
            Some(Raw::Other(_)) | None => 0,
        };
        Ok(value)
    }
}
