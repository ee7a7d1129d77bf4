//! End-to-end pipeline runs over the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sentinel_core::{ProbeRequest, ResolveRequest, unix_now};
use sentinel_relay::{Broker, MemoryBroker, PipelineConfig, PipelineGraph, RunningPipeline};
use sentinel_store::{CounterStore, ResultLog};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const CERT_EVENT: &str = r#"{
    "message_type": "certificate_update",
    "data": {
        "update_type": "PrecertLogEntry",
        "leaf_cert": {
            "all_domains": ["*.a.com", "a.com", "b.com"],
            "fingerprint": "AA:BB"
        }
    }
}"#;

struct Harness {
    broker: Arc<MemoryBroker>,
    counters: Arc<CounterStore>,
    results: Arc<ResultLog>,
    shutdown: CancellationToken,
    running: RunningPipeline,
    _dir: TempDir,
}

impl Harness {
    async fn start(config: PipelineConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let counters = Arc::new(CounterStore::open(dir.path().join("stats")).unwrap());
        let results = Arc::new(ResultLog::open(dir.path().join("results")).unwrap());
        let broker = Arc::new(MemoryBroker::new());

        let graph = PipelineGraph::from_config(
            &config,
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::clone(&counters),
            Arc::clone(&results),
        )
        .unwrap();
        let shutdown = CancellationToken::new();
        let running = graph.start(shutdown.clone()).await.unwrap();

        Self {
            broker,
            counters,
            results,
            shutdown,
            running,
            _dir: dir,
        }
    }

    /// Publish `body` on `topic` and wait until the stage has finished it.
    async fn feed(&self, topic: &str, body: &str) {
        let before = self.broker.finished(topic, "orchestrator");
        self.broker
            .publish(topic, Bytes::from(body.to_string()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while self.broker.finished(topic, "orchestrator") <= before {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stage did not finish the message");
    }

    async fn stop(self) {
        self.shutdown.cancel();
        assert!(self.running.join().await.is_empty());
    }
}

fn resolve_requests(broker: &MemoryBroker, topic: &str) -> Vec<ResolveRequest> {
    broker
        .published(topic)
        .iter()
        .map(|body| serde_json::from_slice(body).unwrap())
        .collect()
}

fn probe_requests(broker: &MemoryBroker, topic: &str) -> Vec<ProbeRequest> {
    broker
        .published(topic)
        .iter()
        .map(|body| serde_json::from_slice(body).unwrap())
        .collect()
}

#[tokio::test]
async fn test_certificate_event_reaches_resolver_once_per_domain() {
    let harness = Harness::start(PipelineConfig::all_enabled()).await;

    let before = unix_now();
    harness.feed("certstream", CERT_EVENT).await;
    let after = unix_now();

    let requests = resolve_requests(&harness.broker, "zdns");
    let domains: Vec<&str> = requests.iter().map(|r| r.domain.as_str()).collect();
    assert_eq!(domains, vec!["a.com", "b.com"]);

    for request in &requests {
        assert_eq!(request.metadata.cert_sha1, "aabb");
        assert!(request.metadata.scan_after >= before + 14400);
        assert!(request.metadata.scan_after <= after + 14400);
    }

    assert_eq!(harness.counters.get("monitor|certstream|cert_cnt").unwrap(), 1);
    assert_eq!(harness.counters.get("monitor|certstream|domain_cnt").unwrap(), 2);
    assert_eq!(
        harness.results.entries("certstream|sha1|a.com").unwrap(),
        vec![r#"{"cert_sha1":"aabb"}"#]
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_results_flow_through_tiers() {
    let config = PipelineConfig::from_yaml_str(
        r#"
zdns: { enable: true, tiers: [4hr, 24hr] }
zgrab: { enable: true, tiers: [4hr, 8hr] }
"#,
    )
    .unwrap();
    let harness = Harness::start(config).await;

    harness
        .feed(
            "zdns_4hr_results",
            r#"{"name":"a.com","status":"NOERROR","data":{"ipv4_addresses":["192.0.2.1"]},"metadata":{"cert_sha1":"aabb","scan_after":"1000"}}"#,
        )
        .await;

    let reresolve = resolve_requests(&harness.broker, "zdns_24hr");
    assert_eq!(reresolve.len(), 1);
    assert_eq!(reresolve[0].domain, "a.com");
    assert_eq!(reresolve[0].metadata.scan_after, 1000 + 86400);

    let probes = probe_requests(&harness.broker, "zgrab");
    assert_eq!(probes.len(), 1);
    assert_eq!(probes[0].ip, "192.0.2.1");
    assert_eq!(probes[0].sni, "a.com");
    assert_eq!(probes[0].metadata.scan_after, 1000 + 86400);

    harness
        .feed(
            "zgrab_results",
            r#"{"ip":"192.0.2.1","domain":"a.com","data":{"tls":{"status":"success"}},"metadata":{"cert_sha1":"aabb","scan_after":"500"}}"#,
        )
        .await;

    let reprobe = probe_requests(&harness.broker, "zgrab_4hr");
    assert_eq!(reprobe.len(), 1);
    assert_eq!(reprobe[0].metadata.scan_after, 500 + 14400);

    assert_eq!(harness.counters.get("monitor|zdns_24hr|results").unwrap(), 1);
    assert_eq!(harness.counters.get("monitor|zgrab_4hr|results").unwrap(), 1);
    assert_eq!(harness.counters.get("monitor|zgrab_4hr|errors").unwrap(), 0);
    assert_eq!(harness.results.entries("zgrab|192.0.2.1").unwrap().len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_replayed_and_malformed_messages_are_harmless() {
    let harness = Harness::start(PipelineConfig::all_enabled()).await;

    harness.feed("certstream", CERT_EVENT).await;
    harness.feed("certstream", CERT_EVENT).await;
    harness.feed("certstream", "{ not json").await;
    harness.feed("zdns_results", r#"{"status":"NOERROR"}"#).await;

    assert_eq!(harness.broker.published("zdns").len(), 4);
    assert_eq!(harness.counters.get("monitor|certstream|cert_cnt").unwrap(), 2);
    assert_eq!(harness.counters.get("monitor|certstream|cert_err_cnt").unwrap(), 1);
    assert_eq!(harness.counters.get("monitor|zdns_4hr|decode_err").unwrap(), 1);
    assert_eq!(harness.results.entries("certstream|sha1|b.com").unwrap().len(), 2);

    let all = harness.counters.fetch_all(Some(b"monitor|certstream|".as_slice())).unwrap();
    assert_eq!(all.len(), 3);

    harness.stop().await;
}

#[tokio::test]
async fn test_pretty_printed_results_log_one_entry_each() {
    let harness = Harness::start(PipelineConfig::all_enabled()).await;

    let pretty = r#"{
        "name": "a.com",
        "status": "NOERROR",
        "data": { "ipv4_addresses": ["192.0.2.1"] },
        "metadata": { "cert_sha1": "aabb", "scan_after": "1000" }
    }"#;
    harness.feed("zdns_results", pretty).await;
    harness.feed("zdns_results", pretty).await;

    let entries = harness.results.entries("zdns|a.com").unwrap();
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        let logged: serde_json::Value = serde_json::from_str(entry).unwrap();
        assert_eq!(logged["status"], "NOERROR");
    }

    harness.stop().await;
}
