//! Relay stages.
//!
//! A [`RelayStage`] owns one input subscription and loops over it:
//!
//! 1. decode the message and derive output records ([`StageRules`])
//! 2. push each record's `scan_after` back by the stage delay
//! 3. publish each record to its output topic
//! 4. record observations in the counter store and result log
//! 5. finish the message
//!
//! Steps 1-4 never fail the loop: undecodable messages are counted and
//! dropped, and publish or store failures are logged.

mod certstream;
mod zdns;
mod zgrab;

pub use certstream::CertstreamRules;
pub use zdns::ResolveRules;
pub use zgrab::ProbeRules;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use metrics::{counter, gauge, histogram};
use sentinel_core::{ScanRecord, WireFormat, unix_now};
use sentinel_store::{CounterStore, ResultLog};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::transport::Broker;

/// A record to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub topic: String,
    pub record: ScanRecord,
    pub format: WireFormat,
}

/// A side effect on the stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Increment a counter.
    Incr(String),
    /// Append a line to a result log key.
    Append { key: String, blob: Vec<u8> },
}

/// Everything derived from one inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Derivation {
    pub outputs: Vec<Output>,
    pub observations: Vec<Observation>,
}

impl Derivation {
    pub fn publish(&mut self, topic: impl Into<String>, record: ScanRecord, format: WireFormat) {
        self.outputs.push(Output {
            topic: topic.into(),
            record,
            format,
        });
    }

    pub fn incr(&mut self, key: impl Into<String>) {
        self.observations.push(Observation::Incr(key.into()));
    }

    pub fn append(&mut self, key: impl Into<String>, blob: impl Into<Vec<u8>>) {
        self.observations.push(Observation::Append {
            key: key.into(),
            blob: blob.into(),
        });
    }
}

/// Per-stage decode and derivation logic.
///
/// Derived records carry the schedule of the record they came from (or `now`
/// for records with no predecessor); the stage adds its delay afterwards.
pub trait StageRules: Send + Sync + 'static {
    /// Decode `body` and derive outputs and observations.
    fn derive(&self, body: &[u8], now: i64) -> sentinel_core::Result<Derivation>;

    /// Counter incremented when a message fails to decode.
    fn decode_error_key(&self) -> String;
}

/// Static wiring of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageConfig {
    /// Stage name used in logs and metric labels (e.g. `zdns_4hr`).
    pub name: String,
    pub input_topic: String,
    pub channel: String,
    /// Added to every derived record's `scan_after`.
    pub delay_secs: i64,
}

/// Outcome of processing one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub decoded: bool,
    pub published: usize,
    pub publish_errors: usize,
    pub observation_errors: usize,
}

/// One consuming stage of the pipeline.
pub struct RelayStage {
    config: StageConfig,
    rules: Box<dyn StageRules>,
    broker: Arc<dyn Broker>,
    counters: Arc<CounterStore>,
    results: Arc<ResultLog>,
}

impl RelayStage {
    pub fn new(
        config: StageConfig,
        rules: Box<dyn StageRules>,
        broker: Arc<dyn Broker>,
        counters: Arc<CounterStore>,
        results: Arc<ResultLog>,
    ) -> Self {
        Self {
            config,
            rules,
            broker,
            counters,
            results,
        }
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Process one message body as of the current time.
    pub async fn process(&self, body: &[u8]) -> ProcessReport {
        self.process_at(body, unix_now()).await
    }

    /// Process one message body as of `now`.
    pub async fn process_at(&self, body: &[u8], now: i64) -> ProcessReport {
        let stage = self.config.name.clone();
        counter!("relay_messages_total", "stage" => stage.clone()).increment(1);

        let mut report = ProcessReport::default();

        let derivation = match self.rules.derive(body, now) {
            Ok(derivation) => derivation,
            Err(e) => {
                warn!(
                    stage = %stage,
                    error = %e,
                    body = %String::from_utf8_lossy(body),
                    "dropping undecodable message"
                );
                counter!("relay_decode_errors_total", "stage" => stage.clone()).increment(1);
                let key = self.rules.decode_error_key();
                if let Err(e) = self.counters.incr(&key) {
                    warn!(stage = %stage, key = %key, error = %e, "counter update failed");
                    report.observation_errors += 1;
                }
                return report;
            }
        };
        report.decoded = true;

        for Output {
            topic,
            mut record,
            format,
        } in derivation.outputs
        {
            record.reschedule(self.config.delay_secs);
            match self.publish(&topic, &record, format).await {
                Ok(()) => report.published += 1,
                Err(e) => {
                    warn!(
                        stage = %stage,
                        topic = %topic,
                        subject = %record.subject,
                        error = %e,
                        "publish failed"
                    );
                    report.publish_errors += 1;
                }
            }
        }
        counter!("relay_records_published_total", "stage" => stage.clone())
            .increment(report.published as u64);
        if report.publish_errors > 0 {
            counter!("relay_publish_errors_total", "stage" => stage.clone())
                .increment(report.publish_errors as u64);
        }

        for observation in derivation.observations {
            if let Err(e) = self.observe(&observation) {
                warn!(stage = %stage, observation = ?observation, error = %e, "store update failed");
                report.observation_errors += 1;
            }
        }
        if report.observation_errors > 0 {
            counter!("relay_observation_errors_total", "stage" => stage)
                .increment(report.observation_errors as u64);
        }

        report
    }

    async fn publish(&self, topic: &str, record: &ScanRecord, format: WireFormat) -> Result<()> {
        let json = record.encode(format)?;
        debug!(
            stage = %self.config.name,
            topic = %topic,
            subject = %record.subject,
            kind = record.kind.as_str(),
            scan_after = record.scan_after,
            "publishing record"
        );
        self.broker.publish(topic, Bytes::from(json)).await
    }

    fn observe(&self, observation: &Observation) -> Result<()> {
        match observation {
            Observation::Incr(key) => self.counters.incr(key)?,
            Observation::Append { key, blob } => self.results.append(key, blob)?,
        }
        Ok(())
    }

    /// Subscribe and spawn the consume loop.
    ///
    /// Subscription failures are returned before anything is spawned. The
    /// loop exits when `shutdown` is cancelled or the subscription ends; a
    /// message already being processed is completed first.
    pub async fn start(self, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let mut subscription = self
            .broker
            .subscribe(&self.config.input_topic, &self.config.channel)
            .await?;

        info!(
            stage = %self.config.name,
            topic = %self.config.input_topic,
            channel = %self.config.channel,
            delay_secs = self.config.delay_secs,
            "stage started"
        );

        Ok(tokio::spawn(async move {
            gauge!("relay_stages_running").increment(1.0);

            loop {
                let delivery = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    delivery = subscription.next() => match delivery {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };

                if delivery.attempts > 1 {
                    debug!(stage = %self.config.name, attempts = delivery.attempts, "redelivered message");
                }

                let started = Instant::now();
                let report = self.process(&delivery.body).await;
                histogram!("relay_message_duration_seconds", "stage" => self.config.name.clone())
                    .record(started.elapsed().as_secs_f64());
                debug!(stage = %self.config.name, report = ?report, "message processed");

                if let Err(e) = subscription.finish(&delivery).await {
                    warn!(stage = %self.config.name, error = %e, "failed to finish message");
                }
            }

            if let Err(e) = subscription.close().await {
                warn!(stage = %self.config.name, error = %e, "failed to close subscription");
            }
            gauge!("relay_stages_running").decrement(1.0);
            info!(stage = %self.config.name, "stage stopped");
        }))
    }
}
