//! Network probe tier: probe results to a re-probe request for the next tier.

use std::net::IpAddr;

use sentinel_core::{
    Error, ProbeResult, RecordKind, ScanRecord, WireFormat, compact_json, counter_key,
    normalize_domain, normalize_fingerprint,
};
use tracing::debug;

use super::{Derivation, StageRules};
use crate::config::Tier;

/// Rules for one network probe tier.
#[derive(Debug, Clone)]
pub struct ProbeRules {
    pub tier: Tier,
    /// Topic of the next tier's probe tool.
    pub reprobe_topic: String,
}

impl ProbeRules {
    fn stage(&self) -> String {
        format!("zgrab_{}", self.tier)
    }
}

impl StageRules for ProbeRules {
    fn derive(&self, body: &[u8], _now: i64) -> sentinel_core::Result<Derivation> {
        let result = ProbeResult::from_slice(body)?;

        let ip: IpAddr = result.ip.trim().parse().map_err(|_| Error::InvalidField {
            field: "ip",
            reason: format!("{:?} is not an IP address", result.ip),
        })?;
        let ip = ip.to_string();

        let stage = self.stage();
        let mut derivation = Derivation::default();
        derivation.incr(counter_key(&stage, "results"));
        if !result.is_success() {
            derivation.incr(counter_key(&stage, "errors"));
        }
        derivation.append(format!("zgrab|{ip}"), compact_json(body)?);

        // Without a server name there is nothing to re-probe.
        let Some(domain) = normalize_domain(&result.domain) else {
            debug!(ip = %ip, domain = %result.domain, "probe result has no usable name");
            derivation.incr(self.decode_error_key());
            return Ok(derivation);
        };

        let metadata = &result.metadata;
        let record = ScanRecord::new(
            ip,
            normalize_fingerprint(&metadata.cert_sha1),
            RecordKind::Probe,
            metadata.scan_after,
        )
        .with_server_name(domain)
        .with_cert_type(metadata.cert_type.clone());
        derivation.publish(&self.reprobe_topic, record, WireFormat::ProbeRequest);

        Ok(derivation)
    }

    fn decode_error_key(&self) -> String {
        counter_key(&self.stage(), "decode_err")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Observation;

    fn rules() -> ProbeRules {
        ProbeRules {
            tier: Tier::EightHour,
            reprobe_topic: "zgrab_8hr".to_string(),
        }
    }

    #[test]
    fn test_reprobe_carries_metadata() {
        let body = br#"{"ip":"192.0.2.1","domain":"a.com","data":{"tls":{"status":"success"}},"metadata":{"cert_sha1":"aabb","scan_after":"2000","cert_type":"PrecertLogEntry"}}"#;
        let derivation = rules().derive(body, 0).unwrap();

        assert_eq!(derivation.outputs.len(), 1);
        let output = &derivation.outputs[0];
        assert_eq!(output.topic, "zgrab_8hr");
        assert_eq!(output.format, WireFormat::ProbeRequest);
        assert_eq!(output.record.subject, "192.0.2.1");
        assert_eq!(output.record.server_name.as_deref(), Some("a.com"));
        assert_eq!(output.record.kind.as_str(), "probe");
        assert_eq!(output.record.scan_after, 2000);
        assert_eq!(output.record.cert_type.as_deref(), Some("PrecertLogEntry"));

        assert_eq!(
            derivation.observations,
            vec![
                Observation::Incr("monitor|zgrab_8hr|results".to_string()),
                Observation::Append {
                    key: "zgrab|192.0.2.1".to_string(),
                    blob: compact_json(body).unwrap(),
                },
            ]
        );
    }

    #[test]
    fn test_probe_failures_are_counted() {
        let failed = br#"{"ip":"2001:db8::1","domain":"a.com","data":{"tls":{"status":"connection-timeout"}}}"#;
        let derivation = rules().derive(failed, 0).unwrap();
        assert!(
            derivation
                .observations
                .contains(&Observation::Incr("monitor|zgrab_8hr|errors".to_string()))
        );
        assert_eq!(derivation.outputs.len(), 1);

        let no_modules = br#"{"ip":"192.0.2.1","domain":"a.com","data":{}}"#;
        let derivation = rules().derive(no_modules, 0).unwrap();
        assert!(
            derivation
                .observations
                .contains(&Observation::Incr("monitor|zgrab_8hr|errors".to_string()))
        );
    }

    #[test]
    fn test_rejects_bad_address() {
        assert!(rules().derive(br#"{"ip":"nope","domain":"a.com"}"#, 0).is_err());
        assert!(rules().derive(br#"{"domain":"a.com"}"#, 0).is_err());
        assert_eq!(rules().decode_error_key(), "monitor|zgrab_8hr|decode_err");
    }

    #[test]
    fn test_nameless_result_is_counted_and_logged() {
        let body = br#"{"ip":"192.0.2.9","domain":"","data":{"tls":{"status":"success"}}}"#;
        let derivation = rules().derive(body, 0).unwrap();

        assert!(derivation.outputs.is_empty());
        assert_eq!(
            derivation.observations,
            vec![
                Observation::Incr("monitor|zgrab_8hr|results".to_string()),
                Observation::Append {
                    key: "zgrab|192.0.2.9".to_string(),
                    blob: compact_json(body).unwrap(),
                },
                Observation::Incr("monitor|zgrab_8hr|decode_err".to_string()),
            ]
        );
    }

    #[test]
    fn test_pretty_printed_result_is_logged_on_one_line() {
        let body = b"{\n  \"ip\": \"192.0.2.1\",\n  \"domain\": \"a.com\",\n  \"data\": {}\n}";
        let derivation = rules().derive(body, 0).unwrap();

        let log = sentinel_store::ResultLog::in_memory();
        for observation in &derivation.observations {
            if let Observation::Append { key, blob } = observation {
                log.append(key, blob).unwrap();
            }
        }
        assert_eq!(log.entries("zgrab|192.0.2.1").unwrap().len(), 1);
    }
}
