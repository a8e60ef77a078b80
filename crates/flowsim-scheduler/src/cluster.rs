//! Static cluster topology.
//!
//! A [`ClusterModel`] is built once from machine specs, a layer placement
//! produced by an external layout synthesizer, and the network links between
//! machines and the coordinator. It is read-only for the rest of a run: the
//! only per-machine mutable state (KV occupancy) lives in
//! [`KvCacheTracker`](crate::kv_cache::KvCacheTracker).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    #[error("Model must have at least one layer")]
    NoLayers,
    #[error("Duplicate machine id {0}")]
    DuplicateMachine(MachineId),
    #[error("Machine {0} has non-positive throughput {1}")]
    InvalidThroughput(MachineId, f64),
    #[error("Machine {0} has zero KV capacity")]
    InvalidKvCapacity(MachineId),
    #[error("Placement references unknown machine {0}")]
    UnknownMachine(MachineId),
    #[error("Machine {0} has no shard assigned")]
    Unplaced(MachineId),
    #[error("Machine {machine} has invalid layer range [{start}, {end}) for a {num_layers}-layer model")]
    InvalidLayerRange {
        machine: MachineId,
        start: u32,
        end: u32,
        num_layers: u32,
    },
    #[error("Link {from} -> {to} has non-positive latency {latency_s}s")]
    InvalidLatency {
        from: Endpoint,
        to: Endpoint,
        latency_s: f64,
    },
    #[error("Link {from} -> {to} has non-positive bandwidth {bandwidth}")]
    InvalidBandwidth {
        from: Endpoint,
        to: Endpoint,
        bandwidth: f64,
    },
    #[error("Placement does not contain a complete pipeline covering layers 0..{0}")]
    NoCompletePipeline(u32),
}

/// Identifier of a machine in the cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MachineId(pub u32);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// GPU hardware type. `Custom` keeps the enumeration open for new devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HardwareType {
    A100,
    H100,
    L4,
    T4,
    V100,
    Custom(String),
}

impl HardwareType {
    pub fn as_str(&self) -> &str {
        match self {
            HardwareType::A100 => "A100",
            HardwareType::H100 => "H100",
            HardwareType::L4 => "L4",
            HardwareType::T4 => "T4",
            HardwareType::V100 => "V100",
            HardwareType::Custom(name) => name,
        }
    }
}

impl From<String> for HardwareType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "A100" | "a100" => HardwareType::A100,
            "H100" | "h100" => HardwareType::H100,
            "L4" | "l4" => HardwareType::L4,
            "T4" | "t4" => HardwareType::T4,
            "V100" | "v100" => HardwareType::V100,
            _ => HardwareType::Custom(s),
        }
    }
}

impl From<HardwareType> for String {
    fn from(h: HardwareType) -> Self {
        h.as_str().to_string()
    }
}

impl fmt::Display for HardwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end of a network link.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// The request coordinator (flow source and sink).
    Coordinator,
    Machine(MachineId),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Coordinator => f.write_str("coordinator"),
            Endpoint::Machine(id) => write!(f, "{}", id),
        }
    }
}

/// Half-open range of model layers `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRange {
    pub start: u32,
    pub end: u32,
}

impl LayerRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, layer: u32) -> bool {
        self.start <= layer && layer < self.end
    }
}

/// A contiguous slice of the model hosted by one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub layers: LayerRange,
    pub machine: MachineId,
    /// Machines sharing a replica group serve the same tensor/pipeline group.
    pub replica_group: u32,
}

/// A directed network link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub latency_us: u64,
    /// Bandwidth in tokens/sec. `None` means the link never throttles.
    pub bandwidth: Option<f64>,
}

impl Link {
    /// Time to move `tokens` activations across this link, in microseconds.
    pub fn transfer_time_us(&self, tokens: u32) -> u64 {
        let serialization_us = match self.bandwidth {
            Some(bw) if bw > 0.0 => (tokens as f64 / bw * 1e6).ceil() as u64,
            _ => 0,
        };
        self.latency_us + serialization_us
    }

    /// Flow capacity of the link in tokens/sec.
    pub fn capacity(&self) -> f64 {
        self.bandwidth.unwrap_or(f64::INFINITY)
    }
}

/// A machine as described by the cluster file, before placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub id: MachineId,
    pub hardware: HardwareType,
    /// Compute throughput for the hosted shard, in tokens/sec.
    pub throughput: f64,
    /// KV cache capacity in tokens.
    pub kv_capacity: u64,
}

/// Layer assignment for one machine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub layers: LayerRange,
    #[serde(default)]
    pub replica_group: u32,
}

/// Static machine→shard placement produced by the layout synthesizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    /// Simulated time at which all shards finish loading, in seconds.
    pub finish_loading_time_s: f64,
    pub assignments: BTreeMap<MachineId, ShardAssignment>,
}

/// A link as described by the cluster file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub from: Endpoint,
    pub to: Endpoint,
    pub latency_s: f64,
    #[serde(default)]
    pub bandwidth: Option<f64>,
}

/// A placed machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub hardware: HardwareType,
    pub throughput: f64,
    pub kv_capacity: u64,
    pub shard: Shard,
}

/// Read-only cluster topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterModel {
    num_layers: u32,
    machines: BTreeMap<MachineId, Machine>,
    links: BTreeMap<(Endpoint, Endpoint), Link>,
    default_coordinator_latency_us: u64,
    finish_loading_time_us: u64,
}

impl ClusterModel {
    /// Build and validate a cluster from its static description.
    pub fn build(
        num_layers: u32,
        specs: Vec<MachineSpec>,
        placement: &Placement,
        links: Vec<LinkSpec>,
        default_coordinator_latency_s: f64,
    ) -> Result<Self, ClusterError> {
        if num_layers == 0 {
            return Err(ClusterError::NoLayers);
        }

        for id in placement.assignments.keys() {
            if !specs.iter().any(|s| s.id == *id) {
                return Err(ClusterError::UnknownMachine(*id));
            }
        }

        let mut machines = BTreeMap::new();
        for spec in specs {
            if machines.contains_key(&spec.id) {
                return Err(ClusterError::DuplicateMachine(spec.id));
            }
            if !(spec.throughput > 0.0 && spec.throughput.is_finite()) {
                return Err(ClusterError::InvalidThroughput(spec.id, spec.throughput));
            }
            if spec.kv_capacity == 0 {
                return Err(ClusterError::InvalidKvCapacity(spec.id));
            }
            let assignment = placement
                .assignments
                .get(&spec.id)
                .ok_or(ClusterError::Unplaced(spec.id))?;
            let layers = assignment.layers;
            if layers.is_empty() || layers.end > num_layers {
                return Err(ClusterError::InvalidLayerRange {
                    machine: spec.id,
                    start: layers.start,
                    end: layers.end,
                    num_layers,
                });
            }
            machines.insert(
                spec.id,
                Machine {
                    id: spec.id,
                    hardware: spec.hardware,
                    throughput: spec.throughput,
                    kv_capacity: spec.kv_capacity,
                    shard: Shard {
                        layers,
                        machine: spec.id,
                        replica_group: assignment.replica_group,
                    },
                },
            );
        }

        let default_coordinator_latency_us = latency_to_us(
            Endpoint::Coordinator,
            Endpoint::Coordinator,
            default_coordinator_latency_s,
        )?;

        let mut link_map = BTreeMap::new();
        for spec in links {
            for endpoint in [spec.from, spec.to] {
                if let Endpoint::Machine(id) = endpoint {
                    if !machines.contains_key(&id) {
                        return Err(ClusterError::UnknownMachine(id));
                    }
                }
            }
            let latency_us = latency_to_us(spec.from, spec.to, spec.latency_s)?;
            if let Some(bw) = spec.bandwidth {
                if !(bw > 0.0) {
                    return Err(ClusterError::InvalidBandwidth {
                        from: spec.from,
                        to: spec.to,
                        bandwidth: bw,
                    });
                }
            }
            link_map.insert(
                (spec.from, spec.to),
                Link {
                    latency_us,
                    bandwidth: spec.bandwidth,
                },
            );
        }

        let model = Self {
            num_layers,
            machines,
            links: link_map,
            default_coordinator_latency_us,
            finish_loading_time_us: (placement.finish_loading_time_s.max(0.0) * 1e6).round()
                as u64,
        };

        if !model.has_complete_pipeline() {
            return Err(ClusterError::NoCompletePipeline(num_layers));
        }
        Ok(model)
    }

    pub fn num_layers(&self) -> u32 {
        self.num_layers
    }

    /// Simulated time at which the placement becomes servable.
    pub fn finish_loading_time_us(&self) -> u64 {
        self.finish_loading_time_us
    }

    pub fn machine(&self, id: MachineId) -> Option<&Machine> {
        self.machines.get(&id)
    }

    /// All machines, ordered by id.
    pub fn machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values()
    }

    pub fn machine_ids(&self) -> impl Iterator<Item = MachineId> + '_ {
        self.machines.keys().copied()
    }

    pub fn num_machines(&self) -> usize {
        self.machines.len()
    }

    pub fn shard(&self, id: MachineId) -> Option<&Shard> {
        self.machines.get(&id).map(|m| &m.shard)
    }

    /// Link between two endpoints.
    ///
    /// Coordinator links fall back to the default coordinator latency when not
    /// configured explicitly; machine-to-machine links must be configured.
    pub fn link(&self, from: Endpoint, to: Endpoint) -> Option<Link> {
        if let Some(link) = self.links.get(&(from, to)) {
            return Some(*link);
        }
        let touches_coordinator = from == Endpoint::Coordinator || to == Endpoint::Coordinator;
        if touches_coordinator && from != to {
            Some(Link {
                latency_us: self.default_coordinator_latency_us,
                bandwidth: None,
            })
        } else {
            None
        }
    }

    /// Machines hosting `layer`, ordered by id.
    pub fn machines_hosting(&self, layer: u32) -> Vec<MachineId> {
        self.machines
            .values()
            .filter(|m| m.shard.layers.contains(layer))
            .map(|m| m.id)
            .collect()
    }

    /// Machines that can continue a pipeline after `id` finishes its shard.
    pub fn next_hops(&self, id: MachineId) -> Vec<MachineId> {
        let Some(machine) = self.machines.get(&id) else {
            return Vec::new();
        };
        let end = machine.shard.layers.end;
        if end >= self.num_layers {
            return Vec::new();
        }
        self.machines_hosting(end)
            .into_iter()
            .filter(|next| {
                self.link(Endpoint::Machine(id), Endpoint::Machine(*next))
                    .is_some()
            })
            .collect()
    }

    /// Whether `id` holds the last layer of the model.
    pub fn is_exit(&self, id: MachineId) -> bool {
        self.machines
            .get(&id)
            .is_some_and(|m| m.shard.layers.end == self.num_layers)
    }

    /// Number of layers `id` computes when a request enters it at `entry_layer`.
    pub fn layers_computed(&self, id: MachineId, entry_layer: u32) -> u32 {
        self.machines
            .get(&id)
            .map(|m| m.shard.layers.end.saturating_sub(entry_layer.max(m.shard.layers.start)))
            .unwrap_or(0)
    }

    fn has_complete_pipeline(&self) -> bool {
        let mut seen = BTreeSet::new();
        let mut frontier: VecDeque<MachineId> = self.machines_hosting(0).into();
        while let Some(id) = frontier.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if self.is_exit(id) {
                return true;
            }
            frontier.extend(self.next_hops(id));
        }
        false
    }
}

fn latency_to_us(from: Endpoint, to: Endpoint, latency_s: f64) -> Result<u64, ClusterError> {
    let latency_us = (latency_s * 1e6).round();
    if !(latency_s > 0.0) || latency_us < 1.0 || !latency_us.is_finite() {
        return Err(ClusterError::InvalidLatency {
            from,
            to,
            latency_s,
        });
    }
    Ok(latency_us as u64)
}

/// Fluent builder for small clusters, mainly for tests and benchmarks.
#[derive(Debug, Clone)]
pub struct ClusterBuilder {
    num_layers: u32,
    specs: Vec<MachineSpec>,
    placement: Placement,
    links: Vec<LinkSpec>,
    default_coordinator_latency_s: f64,
}

impl ClusterBuilder {
    pub fn new(num_layers: u32) -> Self {
        Self {
            num_layers,
            specs: Vec::new(),
            placement: Placement::default(),
            links: Vec::new(),
            default_coordinator_latency_s: 0.001,
        }
    }

    pub fn machine(
        mut self,
        id: u32,
        hardware: HardwareType,
        throughput: f64,
        kv_capacity: u64,
        layers: (u32, u32),
    ) -> Self {
        let id = MachineId(id);
        self.specs.push(MachineSpec {
            id,
            hardware,
            throughput,
            kv_capacity,
        });
        self.placement.assignments.insert(
            id,
            ShardAssignment {
                layers: LayerRange::new(layers.0, layers.1),
                replica_group: 0,
            },
        );
        self
    }

    /// Add a machine-to-machine link.
    pub fn link(mut self, from: u32, to: u32, latency_s: f64, bandwidth: Option<f64>) -> Self {
        self.links.push(LinkSpec {
            from: Endpoint::Machine(MachineId(from)),
            to: Endpoint::Machine(MachineId(to)),
            latency_s,
            bandwidth,
        });
        self
    }

    pub fn endpoint_link(mut self, spec: LinkSpec) -> Self {
        self.links.push(spec);
        self
    }

    pub fn coordinator_latency(mut self, latency_s: f64) -> Self {
        self.default_coordinator_latency_s = latency_s;
        self
    }

    pub fn finish_loading_time(mut self, seconds: f64) -> Self {
        self.placement.finish_loading_time_s = seconds;
        self
    }

    pub fn build(self) -> Result<ClusterModel, ClusterError> {
        ClusterModel::build(
            self.num_layers,
            self.specs,
            &self.placement,
            self.links,
            self.default_coordinator_latency_s,
        )
    }
}
