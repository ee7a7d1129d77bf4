//! DNS resolution tier: resolution results to probe requests and a
//! re-resolution request for the next tier.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use sentinel_core::{
    Error, RecordKind, ResolveResult, ScanRecord, WireFormat, compact_json, counter_key,
    normalize_domain, normalize_fingerprint,
};
use tracing::debug;

use super::{Derivation, StageRules};
use crate::config::Tier;

/// Rules for one DNS resolution tier.
#[derive(Debug, Clone)]
pub struct ResolveRules {
    pub tier: Tier,
    /// Topic of the next tier's resolver.
    pub reresolve_topic: String,
    /// Topic of the probe tool.
    pub probe_topic: String,
    pub ipv4: bool,
    pub ipv6: bool,
}

impl ResolveRules {
    fn stage(&self) -> String {
        format!("zdns_{}", self.tier)
    }

    /// Enabled, well-formed addresses in answer order, without repeats.
    fn probe_addresses(&self, result: &ResolveResult) -> Vec<String> {
        let v4 = result
            .data
            .ipv4_addresses
            .iter()
            .filter(|_| self.ipv4)
            .filter(|a| a.parse::<Ipv4Addr>().is_ok());
        let v6 = result
            .data
            .ipv6_addresses
            .iter()
            .filter(|_| self.ipv6)
            .filter(|a| a.parse::<Ipv6Addr>().is_ok());

        let mut seen = HashSet::new();
        v4.chain(v6)
            .filter(|a| seen.insert(*a))
            .cloned()
            .collect()
    }
}

impl StageRules for ResolveRules {
    fn derive(&self, body: &[u8], _now: i64) -> sentinel_core::Result<Derivation> {
        let result = ResolveResult::from_slice(body)?;
        let name = result
            .resolved_name()
            .and_then(normalize_domain)
            .ok_or_else(|| Error::InvalidField {
                field: "name",
                reason: "resolution result has no usable name".to_string(),
            })?;

        let stage = self.stage();
        let mut derivation = Derivation::default();
        derivation.incr(counter_key(&stage, "results"));
        if !result.is_success() {
            debug!(name = %name, status = %result.status, "resolution failed");
            derivation.incr(counter_key(&stage, "errors"));
        }
        derivation.append(format!("zdns|{name}"), compact_json(body)?);

        let metadata = &result.metadata;
        let fingerprint = normalize_fingerprint(&metadata.cert_sha1);
        let addresses = self.probe_addresses(&result);

        for address in &addresses {
            let record = ScanRecord::new(
                address,
                &fingerprint,
                RecordKind::Resolution,
                metadata.scan_after,
            )
            .with_server_name(&name)
            .with_cert_type(metadata.cert_type.clone());
            derivation.publish(&self.probe_topic, record, WireFormat::ProbeRequest);
        }

        let reresolve = ScanRecord::new(
            &name,
            &fingerprint,
            RecordKind::Resolution,
            metadata.scan_after,
        )
        .with_addresses(addresses)
        .with_cert_type(metadata.cert_type.clone());
        derivation.publish(&self.reresolve_topic, reresolve, WireFormat::ResolveRequest);

        Ok(derivation)
    }

    fn decode_error_key(&self) -> String {
        counter_key(&self.stage(), "decode_err")
    }
}
