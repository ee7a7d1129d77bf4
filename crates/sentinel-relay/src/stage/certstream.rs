//! Certificate intake: certificate-log events to DNS resolution requests.

use sentinel_core::{CertificateUpdate, RecordKind, ScanRecord, WireFormat, counter_key};
use serde::Serialize;
use tracing::debug;

use super::{Derivation, StageRules};

const STAGE: &str = "certstream";

/// Result log entry linking a domain to the certificate it was seen in.
#[derive(Serialize)]
struct CertSighting<'a> {
    cert_sha1: &'a str,
}

/// Relays every unique domain of an accepted certificate to the resolvers.
#[derive(Debug, Clone)]
pub struct CertstreamRules {
    /// Topics each domain is published to.
    pub output_topics: Vec<String>,
    /// Accepted `update_type`s; empty accepts all.
    pub accept_update_types: Vec<String>,
}

impl CertstreamRules {
    fn accepts(&self, update_type: &str) -> bool {
        self.accept_update_types.is_empty()
            || self.accept_update_types.iter().any(|t| t == update_type)
    }
}

impl StageRules for CertstreamRules {
    fn derive(&self, body: &[u8], now: i64) -> sentinel_core::Result<Derivation> {
        let update = CertificateUpdate::from_slice(body)?;

        let mut derivation = Derivation::default();
        derivation.incr(counter_key(STAGE, "cert_cnt"));

        if !self.accepts(&update.update_type) {
            debug!(update_type = %update.update_type, "skipping certificate");
            return Ok(derivation);
        }

        let fingerprint = update.fingerprint();
        let sighting = serde_json::to_vec(&CertSighting {
            cert_sha1: &fingerprint,
        })?;
        let cert_type = Some(update.update_type.clone());

        for domain in update.subjects() {
            for topic in &self.output_topics {
                let record = ScanRecord::new(&domain, &fingerprint, RecordKind::Certificate, now)
                    .with_cert_type(cert_type.clone());
                derivation.publish(topic, record, WireFormat::ResolveRequest);
            }
            derivation.incr(counter_key(STAGE, "domain_cnt"));
            derivation.append(format!("certstream|sha1|{domain}"), sighting.clone());
        }

        Ok(derivation)
    }

    fn decode_error_key(&self) -> String {
        counter_key(STAGE, "cert_err_cnt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{Observation, Output};

    fn rules() -> CertstreamRules {
        CertstreamRules {
            output_topics: vec!["zdns".to_string()],
            accept_update_types: vec!["PrecertLogEntry".to_string()],
        }
    }

    const EVENT: &str = r#"{
        "message_type": "certificate_update",
        "data": {
            "update_type": "PrecertLogEntry",
            "leaf_cert": {
                "all_domains": ["*.A.com", "a.com", "b.com", "foo.*.c.com"],
                "fingerprint": "AA:BB"
            }
        }
    }"#;

    #[test]
    fn test_unique_domains_fan_out() {
        let derivation = rules().derive(EVENT.as_bytes(), 1000).unwrap();

        let subjects: Vec<&str> = derivation
            .outputs
            .iter()
            .map(|o| o.record.subject.as_str())
            .collect();
        assert_eq!(subjects, vec!["a.com", "b.com"]);

        for Output {
            topic,
            record,
            format,
        } in &derivation.outputs
        {
            assert_eq!(topic, "zdns");
            assert_eq!(*format, WireFormat::ResolveRequest);
            assert_eq!(record.fingerprint, "aabb");
            assert_eq!(record.scan_after, 1000);
            assert_eq!(record.cert_type.as_deref(), Some("PrecertLogEntry"));
        }

        assert_eq!(
            derivation.observations,
            vec![
                Observation::Incr("monitor|certstream|cert_cnt".to_string()),
                Observation::Incr("monitor|certstream|domain_cnt".to_string()),
                Observation::Append {
                    key: "certstream|sha1|a.com".to_string(),
                    blob: br#"{"cert_sha1":"aabb"}"#.to_vec(),
                },
                Observation::Incr("monitor|certstream|domain_cnt".to_string()),
                Observation::Append {
                    key: "certstream|sha1|b.com".to_string(),
                    blob: br#"{"cert_sha1":"aabb"}"#.to_vec(),
                },
            ]
        );
    }

    #[test]
    fn test_skips_unaccepted_update_types() {
        let body = EVENT.replace("PrecertLogEntry", "X509LogEntry");
        let derivation = rules().derive(body.as_bytes(), 1000).unwrap();
        assert!(derivation.outputs.is_empty());
        assert_eq!(
            derivation.observations,
            vec![Observation::Incr("monitor|certstream|cert_cnt".to_string())]
        );

        let accept_all = CertstreamRules {
            accept_update_types: Vec::new(),
            ..rules()
        };
        assert_eq!(accept_all.derive(body.as_bytes(), 1000).unwrap().outputs.len(), 2);
    }

    #[test]
    fn test_publishes_to_every_topic() {
        let rules = CertstreamRules {
            output_topics: vec!["zdns".to_string(), "zdns_mirror".to_string()],
            ..rules()
        };
        let derivation = rules.derive(EVENT.as_bytes(), 0).unwrap();
        assert_eq!(derivation.outputs.len(), 4);
        assert_eq!(
            derivation
                .observations
                .iter()
                .filter(|o| matches!(o, Observation::Incr(k) if k.ends_with("domain_cnt")))
                .count(),
            2
        );
    }

    #[test]
    fn test_decode_failure() {
        assert!(rules().derive(b"{}", 0).is_err());
        assert_eq!(rules().decode_error_key(), "monitor|certstream|cert_err_cnt");
    }
}
