//! Stage topology.
//!
//! For the ordered tiers `t[0..]` of each tool:
//!
//! | stage | input | outputs |
//! |-------|-------|---------|
//! | certstream | `certstream` | configured topics (`zdns`) |
//! | `zdns_<t[i]>` | `zdns_results`, then `zdns_<t[i-1]>_results` | `zdns_<t[i]>`, `zgrab` |
//! | `zgrab_<t[i]>` | `zgrab_results`, then `zgrab_<t[i-1]>_results` | `zgrab_<t[i]>` |
//!
//! Every stage consumes on the `orchestrator` channel.

use std::sync::Arc;

use sentinel_store::{CounterStore, ResultLog};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{PipelineConfig, Tier};
use crate::error::Result;
use crate::stage::{
    CertstreamRules, ProbeRules, RelayStage, ResolveRules, StageConfig, StageRules,
};
use crate::transport::Broker;

/// Broker channel every stage consumes on.
pub const CHANNEL: &str = "orchestrator";

/// Input topic of the certificate intake stage.
pub const CERTSTREAM_TOPIC: &str = "certstream";

/// Topic the probe tool reads requests from.
pub const PROBE_TOPIC: &str = "zgrab";

/// Input topic of the `index`-th tier of `tool`.
fn tier_input(tool: &str, tiers: &[Tier], index: usize) -> String {
    match index.checked_sub(1).map(|prev| tiers[prev]) {
        Some(prev) => format!("{tool}_{prev}_results"),
        None => format!("{tool}_results"),
    }
}

fn stage_config(name: String, input_topic: String, delay_secs: i64) -> StageConfig {
    StageConfig {
        name,
        input_topic,
        channel: CHANNEL.to_string(),
        delay_secs,
    }
}

/// The configured stages, not yet consuming.
pub struct PipelineGraph {
    stages: Vec<RelayStage>,
}

impl PipelineGraph {
    /// Wire every enabled stage.
    pub fn from_config(
        config: &PipelineConfig,
        broker: Arc<dyn Broker>,
        counters: Arc<CounterStore>,
        results: Arc<ResultLog>,
    ) -> Result<Self> {
        config.validate()?;

        let mut wiring: Vec<(StageConfig, Box<dyn StageRules>)> = Vec::new();

        if config.certstream.enable {
            let first_tier = config.zdns.tiers.first().copied().unwrap_or(Tier::FourHour);
            wiring.push((
                stage_config(
                    "certstream".to_string(),
                    CERTSTREAM_TOPIC.to_string(),
                    first_tier.delay_secs(),
                ),
                Box::new(CertstreamRules {
                    output_topics: config.certstream.topics.clone(),
                    accept_update_types: config.certstream.accept_update_types.clone(),
                }),
            ));
        }

        if config.zdns.enable {
            let tiers = &config.zdns.tiers;
            for (i, &tier) in tiers.iter().enumerate() {
                wiring.push((
                    stage_config(
                        format!("zdns_{tier}"),
                        tier_input("zdns", tiers, i),
                        tier.delay_secs(),
                    ),
                    Box::new(ResolveRules {
                        tier,
                        reresolve_topic: format!("zdns_{tier}"),
                        probe_topic: PROBE_TOPIC.to_string(),
                        ipv4: config.zdns.ipv4,
                        ipv6: config.zdns.ipv6,
                    }),
                ));
            }
        }

        if config.zgrab.enable {
            let tiers = &config.zgrab.tiers;
            for (i, &tier) in tiers.iter().enumerate() {
                wiring.push((
                    stage_config(
                        format!("zgrab_{tier}"),
                        tier_input("zgrab", tiers, i),
                        tier.delay_secs(),
                    ),
                    Box::new(ProbeRules {
                        tier,
                        reprobe_topic: format!("zgrab_{tier}"),
                    }),
                ));
            }
        }

        let stages = wiring
            .into_iter()
            .map(|(stage, rules)| {
                RelayStage::new(
                    stage,
                    rules,
                    Arc::clone(&broker),
                    Arc::clone(&counters),
                    Arc::clone(&results),
                )
            })
            .collect();

        Ok(Self { stages })
    }

    /// Wiring of every stage, in start order.
    pub fn stages(&self) -> impl Iterator<Item = &StageConfig> {
        self.stages.iter().map(RelayStage::config)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Start every stage.
    ///
    /// Stages stop when `shutdown` is cancelled. If any stage fails to
    /// subscribe, the stages started before it are stopped and joined and
    /// the error is returned.
    pub async fn start(self, shutdown: CancellationToken) -> Result<RunningPipeline> {
        let token = shutdown.child_token();
        let mut handles = Vec::with_capacity(self.stages.len());

        for stage in self.stages {
            let name = stage.config().name.clone();
            match stage.start(token.clone()).await {
                Ok(handle) => handles.push((name, handle)),
                Err(e) => {
                    error!(stage = %name, error = %e, "stage failed to start");
                    let running = RunningPipeline { handles, token };
                    running.stop();
                    running.join().await;
                    return Err(e);
                }
            }
        }

        info!(stages = handles.len(), "pipeline started");
        Ok(RunningPipeline { handles, token })
    }
}

/// Handles of the running stages.
pub struct RunningPipeline {
    handles: Vec<(String, JoinHandle<()>)>,
    token: CancellationToken,
}

impl RunningPipeline {
    /// Ask every stage to stop after its current message.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every stage to exit. Returns the names of stages that panicked.
    pub async fn join(self) -> Vec<String> {
        let mut failed = Vec::new();
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(stage = %name, error = %e, "stage task failed");
                failed.push(name);
            }
        }
        failed
    }
}
