//! TOML configuration parsing.
//!
//! Defines the schema for a simulation run: model, machine placement and
//! links, scheduler parameters, and the request feeder.

use crate::clock::secs_to_us;
use crate::feeder::{
    FeederError, LengthDistribution, OfflineFeeder, OnlineFeeder, RequestFeeder,
};
use flowsim_scheduler::{
    ClusterError, ClusterModel, Endpoint, HardwareType, IdOrder, KvParameters, LayerRange,
    LinkSpec, MachineId, MachineSpec, Placement, SchedulerConfig, SchedulingMethod,
    SchedulingMode, ShardAssignment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Validation(String),
    #[error("Invalid cluster: {0}")]
    Cluster(#[from] ClusterError),
    #[error("Invalid feeder: {0}")]
    Feeder(#[from] FeederError),
}

/// Top-level simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub simulation: SimulationSection,
    pub model: ModelSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    pub placement: PlacementSection,
    #[serde(default)]
    pub feeder: Option<FeederSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSection {
    #[serde(default = "default_sim_name")]
    pub name: String,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Time after placement completes that is excluded from analysis.
    #[serde(default)]
    pub warm_up_s: f64,
    /// Length of the analysis window.
    #[serde(default = "default_duration")]
    pub duration_s: f64,
    /// Interval between watch snapshots; none when absent.
    #[serde(default)]
    pub watch_interval_s: Option<f64>,
    /// Verify scheduler invariants after every event.
    #[serde(default = "default_true")]
    pub check_invariants: bool,
}

fn default_sim_name() -> String {
    "simulation".to_string()
}

fn default_seed() -> u64 {
    42
}

fn default_duration() -> f64 {
    60.0
}

fn default_true() -> bool {
    true
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            name: default_sim_name(),
            seed: default_seed(),
            warm_up_s: 0.0,
            duration_s: default_duration(),
            watch_interval_s: None,
            check_invariants: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    pub num_layers: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default)]
    pub method: SchedulingMethod,
    #[serde(default)]
    pub mode: SchedulingMode,
    #[serde(default = "default_kv_hwm")]
    pub kv_hwm: f64,
    #[serde(default = "default_output_ratio")]
    pub expected_output_length_ratio: f64,
    /// Offline mode replans at this interval.
    #[serde(default = "default_rebatch_interval")]
    pub rebatch_interval_s: f64,
    #[serde(default)]
    pub id_order: IdOrder,
}

fn default_kv_hwm() -> f64 {
    0.85
}

fn default_output_ratio() -> f64 {
    1.0
}

fn default_rebatch_interval() -> f64 {
    10.0
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            method: SchedulingMethod::default(),
            mode: SchedulingMode::default(),
            kv_hwm: default_kv_hwm(),
            expected_output_length_ratio: default_output_ratio(),
            rebatch_interval_s: default_rebatch_interval(),
            id_order: IdOrder::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementSection {
    /// Simulated time at which model loading finishes; the run starts here.
    #[serde(default)]
    pub finish_loading_time_s: f64,
    #[serde(default = "default_coordinator_latency")]
    pub default_coordinator_latency_s: f64,
    pub machines: Vec<MachineEntry>,
    #[serde(default)]
    pub links: Vec<LinkEntry>,
}

fn default_coordinator_latency() -> f64 {
    0.001
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineEntry {
    pub id: u32,
    #[serde(default = "default_hardware")]
    pub hardware: String,
    /// Tokens/sec for the hosted shard.
    pub throughput: f64,
    /// KV cache capacity in tokens.
    pub kv_capacity: u64,
    /// Hosted layers as `[start, end)`.
    pub layers: [u32; 2],
    #[serde(default)]
    pub replica_group: u32,
}

fn default_hardware() -> String {
    "A100".to_string()
}

/// Link endpoint: a machine id or `"coordinator"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointRef {
    Machine(u32),
    Named(String),
}

impl EndpointRef {
    fn resolve(&self) -> Result<Endpoint, ConfigError> {
        match self {
            EndpointRef::Machine(id) => Ok(Endpoint::Machine(MachineId(*id))),
            EndpointRef::Named(name) if name == "coordinator" => Ok(Endpoint::Coordinator),
            EndpointRef::Named(name) => Err(ConfigError::Validation(format!(
                "unknown link endpoint '{}'",
                name
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkEntry {
    pub from: EndpointRef,
    pub to: EndpointRef,
    pub latency_s: f64,
    /// Tokens/sec; unbounded when absent.
    #[serde(default)]
    pub bandwidth: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeederKind {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeederSection {
    pub kind: FeederKind,
    /// Online: arrivals per second.
    #[serde(default = "default_rate")]
    pub rate: f64,
    /// Offline: requests submitted at start.
    #[serde(default = "default_initial_count")]
    pub initial_count: usize,
    /// Offline: stop topping up above this mean KV occupancy.
    #[serde(default = "default_feed_hwm")]
    pub feed_hwm: f64,
    #[serde(default = "default_input_mean")]
    pub input_len_mean: f64,
    #[serde(default)]
    pub input_len_std: f64,
    #[serde(default = "default_output_mean")]
    pub output_len_mean: f64,
    #[serde(default)]
    pub output_len_std: f64,
    /// Admission deadline relative to arrival.
    #[serde(default)]
    pub deadline_s: Option<f64>,
}

fn default_rate() -> f64 {
    1.0
}

fn default_initial_count() -> usize {
    20
}

fn default_feed_hwm() -> f64 {
    0.8
}

fn default_input_mean() -> f64 {
    128.0
}

fn default_output_mean() -> f64 {
    32.0
}

impl SimConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate parameter ranges. Topology is validated by [`Self::build_cluster`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sim = &self.simulation;
        if !(sim.duration_s > 0.0 && sim.duration_s.is_finite()) {
            return Err(ConfigError::Validation(
                "duration_s must be > 0".to_string(),
            ));
        }
        if !(sim.warm_up_s >= 0.0 && sim.warm_up_s.is_finite()) {
            return Err(ConfigError::Validation(
                "warm_up_s must be >= 0".to_string(),
            ));
        }
        if let Some(interval) = sim.watch_interval_s {
            if !(interval > 0.0) || secs_to_us(interval) == 0 {
                return Err(ConfigError::Validation(
                    "watch_interval_s must be > 0".to_string(),
                ));
            }
        }
        if self.model.num_layers == 0 {
            return Err(ConfigError::Validation(
                "num_layers must be > 0".to_string(),
            ));
        }
        let sched = &self.scheduler;
        if !(sched.kv_hwm > 0.0 && sched.kv_hwm <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "kv_hwm must be in (0, 1], got {}",
                sched.kv_hwm
            )));
        }
        if !(sched.expected_output_length_ratio > 0.0
            && sched.expected_output_length_ratio.is_finite())
        {
            return Err(ConfigError::Validation(
                "expected_output_length_ratio must be > 0".to_string(),
            ));
        }
        if !(sched.rebatch_interval_s > 0.0) || secs_to_us(sched.rebatch_interval_s) == 0 {
            return Err(ConfigError::Validation(
                "rebatch_interval_s must be > 0".to_string(),
            ));
        }
        if self.placement.machines.is_empty() {
            return Err(ConfigError::Validation(
                "placement must list at least one machine".to_string(),
            ));
        }
        if let Some(feeder) = &self.feeder {
            if let Some(deadline) = feeder.deadline_s {
                if !(deadline >= 0.0) {
                    return Err(ConfigError::Validation(
                        "deadline_s must be >= 0".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Build and validate the cluster topology.
    pub fn build_cluster(&self) -> Result<ClusterModel, ConfigError> {
        let mut specs = Vec::with_capacity(self.placement.machines.len());
        let mut placement = Placement {
            finish_loading_time_s: self.placement.finish_loading_time_s,
            ..Default::default()
        };
        for entry in &self.placement.machines {
            let id = MachineId(entry.id);
            specs.push(MachineSpec {
                id,
                hardware: HardwareType::from(entry.hardware.clone()),
                throughput: entry.throughput,
                kv_capacity: entry.kv_capacity,
            });
            placement.assignments.insert(
                id,
                ShardAssignment {
                    layers: LayerRange::new(entry.layers[0], entry.layers[1]),
                    replica_group: entry.replica_group,
                },
            );
        }
        let links = self
            .placement
            .links
            .iter()
            .map(|l| {
                Ok(LinkSpec {
                    from: l.from.resolve()?,
                    to: l.to.resolve()?,
                    latency_s: l.latency_s,
                    bandwidth: l.bandwidth,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(ClusterModel::build(
            self.model.num_layers,
            specs,
            &placement,
            links,
            self.placement.default_coordinator_latency_s,
        )?)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            method: self.scheduler.method,
            mode: self.scheduler.mode,
            kv: KvParameters {
                expected_kv_hwm: self.scheduler.kv_hwm,
                expected_output_length_ratio: self.scheduler.expected_output_length_ratio,
            },
            id_order: self.scheduler.id_order,
            seed: self.simulation.seed,
        }
    }

    /// Build the feeder described by the `[feeder]` section.
    pub fn build_feeder(&self) -> Result<Box<dyn RequestFeeder>, ConfigError> {
        let section = self.feeder.as_ref().ok_or_else(|| {
            ConfigError::Validation("no [feeder] section configured".to_string())
        })?;
        let input = LengthDistribution {
            mean: section.input_len_mean,
            std: section.input_len_std,
            min: 1,
        };
        let output = LengthDistribution {
            mean: section.output_len_mean,
            std: section.output_len_std,
            min: 1,
        };
        let seed = self.simulation.seed;
        let feeder: Box<dyn RequestFeeder> = match section.kind {
            FeederKind::Online => Box::new(OnlineFeeder::new(
                section.rate,
                input,
                output,
                section.deadline_s,
                seed,
            )?),
            FeederKind::Offline => Box::new(OfflineFeeder::new(
                section.initial_count,
                section.feed_hwm,
                input,
                output,
                section.deadline_s,
                seed,
            )?),
        };
        Ok(feeder)
    }

    /// Start of the run: when placement finishes loading.
    pub fn start_us(&self) -> u64 {
        secs_to_us(self.placement.finish_loading_time_s)
    }

    /// Start of the analysis window.
    pub fn analysis_start_us(&self) -> u64 {
        self.start_us() + secs_to_us(self.simulation.warm_up_s)
    }

    /// End of the analysis window and of the run.
    pub fn stop_us(&self) -> u64 {
        self.analysis_start_us() + secs_to_us(self.simulation.duration_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"
[simulation]
name = "two-stage"
seed = 7
warm_up_s = 5
duration_s = 30
watch_interval_s = 1

[model]
num_layers = 8

[scheduler]
method = "max_flow"
mode = "offline"
kv_hwm = 0.9
id_order = "descending"

[placement]
finish_loading_time_s = 2.5

[[placement.machines]]
id = 0
hardware = "A100"
throughput = 120
kv_capacity = 4000
layers = [0, 4]

[[placement.machines]]
id = 1
hardware = "L4"
throughput = 60
kv_capacity = 2000
layers = [4, 8]

[[placement.links]]
from = 0
to = 1
latency_s = 0.002
bandwidth = 5000

[[placement.links]]
from = "coordinator"
to = 0
latency_s = 0.003

[feeder]
kind = "online"
rate = 4
input_len_mean = 64
output_len_mean = 8
"#;

    #[test]
    fn test_parse_config() {
        let config = SimConfig::from_str(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.simulation.name, "two-stage");
        assert_eq!(config.scheduler.mode, SchedulingMode::Offline);
        assert_eq!(config.scheduler.id_order, IdOrder::Descending);
        assert_eq!(config.placement.machines.len(), 2);
        assert_eq!(config.start_us(), 2_500_000);
        assert_eq!(config.analysis_start_us(), 7_500_000);
        assert_eq!(config.stop_us(), 37_500_000);
    }

    #[test]
    fn test_build_cluster_and_feeder() {
        let config = SimConfig::from_str(SAMPLE_CONFIG).unwrap();
        let cluster = config.build_cluster().unwrap();
        assert_eq!(cluster.num_machines(), 2);
        assert_eq!(
            cluster
                .link(Endpoint::Coordinator, Endpoint::Machine(MachineId(0)))
                .unwrap()
                .latency_us,
            3_000
        );
        assert_eq!(config.build_feeder().unwrap().name(), "online");
        assert_eq!(config.scheduler_config().seed, 7);
    }

    #[test]
    fn test_defaults() {
        let toml = r#"
[model]
num_layers = 1

[[placement.machines]]
id = 0
throughput = 10
kv_capacity = 100
layers = [0, 1]
"#;
        let config = SimConfig::from_str(toml).unwrap();
        assert_eq!(config.simulation.seed, 42);
        assert_eq!(config.scheduler.method, SchedulingMethod::MaxFlow);
        assert_eq!(config.scheduler.kv_hwm, 0.85);
        assert!(config.simulation.check_invariants);
        assert!(config.build_feeder().is_err());
    }

    #[test]
    fn test_validation_bad_hwm() {
        let toml = r#"
[model]
num_layers = 1
[scheduler]
kv_hwm = 1.5
[[placement.machines]]
id = 0
throughput = 10
kv_capacity = 100
layers = [0, 1]
"#;
        assert!(matches!(
            SimConfig::from_str(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_zero_layers() {
        let toml = r#"
[model]
num_layers = 0
[[placement.machines]]
id = 0
throughput = 10
kv_capacity = 100
layers = [0, 1]
"#;
        assert!(SimConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_incomplete_pipeline_is_cluster_error() {
        let toml = r#"
[model]
num_layers = 4
[[placement.machines]]
id = 0
throughput = 10
kv_capacity = 100
layers = [0, 2]
"#;
        let config = SimConfig::from_str(toml).unwrap();
        assert!(matches!(
            config.build_cluster(),
            Err(ConfigError::Cluster(ClusterError::NoCompletePipeline(4)))
        ));
    }

    #[test]
    fn test_unknown_endpoint_name() {
        let toml = r#"
[model]
num_layers = 1
[[placement.machines]]
id = 0
throughput = 10
kv_capacity = 100
layers = [0, 1]
[[placement.links]]
from = "gateway"
to = 0
latency_s = 0.001
"#;
        let config = SimConfig::from_str(toml).unwrap();
        assert!(config.build_cluster().is_err());
    }

    #[test]
    fn test_unknown_method_rejected() {
        let toml = r#"
[model]
num_layers = 1
[scheduler]
method = "round_robin"
[[placement.machines]]
id = 0
throughput = 10
kv_capacity = 100
layers = [0, 1]
"#;
        assert!(matches!(
            SimConfig::from_str(toml),
            Err(ConfigError::Parse(_))
        ));
    }
}
