//! Global scheduler: couples the flow network with KV admission control.
//!
//! Every admission commits one unit of flow along the chosen route and
//! reserves the request's KV footprint on every machine of it; every release
//! undoes both. After each change the touched machines' compute capacities
//! are re-derived from their KV clipping state and `flow_value` is refreshed.

use crate::cluster::{ClusterError, ClusterModel, MachineId};
use crate::flow_graph::{FlowGraph, FlowPath, IdOrder, FLOW_EPSILON};
use crate::kv_cache::{KvCacheTracker, KvParameters};
use crate::max_flow::MaxFlowPolicy;
use crate::random::RandomPolicy;
use crate::shortest_queue::ShortestQueue;
use crate::traits::{
    RequestId, RouteRequest, RoutingContext, RoutingDecision, SchedulingPolicy, REQUEST_DEMAND,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("Scheduler invariant violated: {0}")]
    InvariantViolation(String),
    #[error("Unknown machine {0}")]
    UnknownMachine(MachineId),
    #[error("Unknown scheduling method '{0}'")]
    UnknownMethod(String),
    #[error("Unknown scheduling mode '{0}'")]
    UnknownMode(String),
    #[error("High-water-mark must be in (0, 1], got {0}")]
    InvalidHighWaterMark(f64),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Whether routing runs against a precomputed plan or the live residual graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    #[default]
    Online,
    Offline,
}

impl SchedulingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulingMode::Online => "online",
            SchedulingMode::Offline => "offline",
        }
    }
}

impl fmt::Display for SchedulingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulingMode {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(SchedulingMode::Online),
            "offline" => Ok(SchedulingMode::Offline),
            other => Err(SchedulerError::UnknownMode(other.to_string())),
        }
    }
}

/// The closed set of scheduling methods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMethod {
    #[default]
    MaxFlow,
    ShortestQueue,
    Random,
}

impl SchedulingMethod {
    pub const ALL: [SchedulingMethod; 3] = [
        SchedulingMethod::MaxFlow,
        SchedulingMethod::ShortestQueue,
        SchedulingMethod::Random,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulingMethod::MaxFlow => "max_flow",
            SchedulingMethod::ShortestQueue => "shortest_queue",
            SchedulingMethod::Random => "random",
        }
    }
}

impl fmt::Display for SchedulingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulingMethod {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SchedulingMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| SchedulerError::UnknownMethod(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub method: SchedulingMethod,
    pub mode: SchedulingMode,
    pub kv: KvParameters,
    pub id_order: IdOrder,
    /// Seed for policies that randomize.
    pub seed: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            method: SchedulingMethod::MaxFlow,
            mode: SchedulingMode::Online,
            kv: KvParameters::default(),
            id_order: IdOrder::Ascending,
            seed: 42,
        }
    }
}

/// One variant per scheduling method, all sharing [`SchedulingPolicy`].
#[derive(Debug, Clone)]
pub enum Policy {
    MaxFlow(MaxFlowPolicy),
    ShortestQueue(ShortestQueue),
    Random(RandomPolicy),
}

impl Policy {
    pub fn new(config: &SchedulerConfig) -> Self {
        match config.method {
            SchedulingMethod::MaxFlow => {
                Policy::MaxFlow(MaxFlowPolicy::new(config.mode, config.id_order))
            }
            SchedulingMethod::ShortestQueue => Policy::ShortestQueue(ShortestQueue::new()),
            SchedulingMethod::Random => Policy::Random(RandomPolicy::new(config.seed)),
        }
    }

    fn inner(&mut self) -> &mut dyn SchedulingPolicy {
        match self {
            Policy::MaxFlow(p) => p,
            Policy::ShortestQueue(p) => p,
            Policy::Random(p) => p,
        }
    }
}

impl SchedulingPolicy for Policy {
    fn select(&mut self, request: &RouteRequest, ctx: &RoutingContext<'_>) -> Option<FlowPath> {
        self.inner().select(request, ctx)
    }

    fn on_admit(&mut self, path: &FlowPath) {
        self.inner().on_admit(path)
    }

    fn on_release(&mut self, path: &FlowPath) {
        self.inner().on_release(path)
    }

    fn on_rebatch(&mut self, graph: &FlowGraph, admitted: &BTreeMap<RequestId, FlowPath>) {
        self.inner().on_rebatch(graph, admitted)
    }

    fn name(&self) -> &str {
        match self {
            Policy::MaxFlow(p) => p.name(),
            Policy::ShortestQueue(p) => p.name(),
            Policy::Random(p) => p.name(),
        }
    }
}

pub struct GlobalScheduler {
    cluster: ClusterModel,
    graph: FlowGraph,
    kv: KvCacheTracker,
    policy: Policy,
    config: SchedulerConfig,
    admitted: BTreeMap<RequestId, FlowPath>,
}

impl GlobalScheduler {
    pub fn new(cluster: ClusterModel, config: SchedulerConfig) -> Self {
        let graph = FlowGraph::from_cluster(&cluster);
        let kv = KvCacheTracker::new(&cluster, config.kv);
        let mut policy = Policy::new(&config);
        let admitted = BTreeMap::new();
        policy.on_rebatch(&graph, &admitted);
        info!(
            method = %config.method,
            mode = %config.mode,
            machines = cluster.num_machines(),
            flow_value = graph.flow_value(),
            "Scheduler initialized"
        );
        Self {
            cluster,
            graph,
            kv,
            policy,
            config,
            admitted,
        }
    }

    pub fn cluster(&self) -> &ClusterModel {
        &self.cluster
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn kv(&self) -> &KvCacheTracker {
        &self.kv
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    pub fn flow_value(&self) -> f64 {
        self.graph.flow_value()
    }

    /// Effective compute capacity of `machine` after KV clipping.
    pub fn machine_capacity(&self, machine: MachineId) -> f64 {
        self.graph.machine_capacity(machine)
    }

    pub fn kv_occupancy(&self) -> BTreeMap<MachineId, f64> {
        self.kv.occupancies()
    }

    pub fn mean_kv_occupancy(&self) -> f64 {
        self.kv.mean_occupancy()
    }

    pub fn admitted_count(&self) -> usize {
        self.admitted.len()
    }

    pub fn route_of(&self, request: RequestId) -> Option<&FlowPath> {
        self.admitted.get(&request)
    }

    /// Try to admit `request`.
    ///
    /// On success the route's flow and KV reservations are committed
    /// together. `Queue` means no feasible route exists right now.
    pub fn route(&mut self, request: &RouteRequest) -> Result<RoutingDecision, SchedulerError> {
        if self.admitted.contains_key(&request.id) {
            return Err(SchedulerError::InvariantViolation(format!(
                "request {} is already admitted",
                request.id
            )));
        }
        let footprint = self.kv.footprint(request.token_count);
        let ctx = RoutingContext {
            cluster: &self.cluster,
            graph: &self.graph,
            kv: &self.kv,
            footprint,
            demand: REQUEST_DEMAND,
        };
        let Some(path) = self.policy.select(request, &ctx) else {
            debug!(request = %request.id, footprint, "No feasible route, queueing");
            return Ok(RoutingDecision::Queue);
        };

        let kv = &self.kv;
        if !self
            .graph
            .path_is_feasible(&path, REQUEST_DEMAND, &|m| kv.fits(m, footprint))
        {
            return Err(SchedulerError::InvariantViolation(format!(
                "policy {} selected an infeasible route for {}",
                self.policy.name(),
                request.id
            )));
        }

        self.kv.reserve(request.id, &path.machines, footprint)?;
        self.graph.commit(&path, REQUEST_DEMAND)?;
        self.policy.on_admit(&path);
        self.refresh_capacity(&path.machines)?;
        self.graph.recompute_max_flow();
        debug!(
            request = %request.id,
            route = ?path.machines,
            footprint,
            flow_value = self.graph.flow_value(),
            "Admitted"
        );
        self.admitted.insert(request.id, path.clone());
        Ok(RoutingDecision::Admit(path))
    }

    /// Release the flow and KV reservation held by a finished request.
    pub fn release(&mut self, request: RequestId) -> Result<FlowPath, SchedulerError> {
        let path = self.admitted.remove(&request).ok_or_else(|| {
            SchedulerError::InvariantViolation(format!(
                "request {} released without being admitted",
                request
            ))
        })?;
        self.graph.release(&path, REQUEST_DEMAND)?;
        self.kv.release(request)?;
        self.policy.on_release(&path);
        self.refresh_capacity(&path.machines)?;
        self.graph.recompute_max_flow();
        debug!(request = %request, flow_value = self.graph.flow_value(), "Released");
        Ok(path)
    }

    /// Rebuild precomputed routing structures from the current capacities.
    pub fn rebatch(&mut self) -> Result<(), SchedulerError> {
        let machines: Vec<MachineId> = self.cluster.machine_ids().collect();
        self.refresh_capacity(&machines)?;
        self.graph.recompute_max_flow();
        self.policy.on_rebatch(&self.graph, &self.admitted);
        info!(
            flow_value = self.graph.flow_value(),
            in_flight = self.admitted.len(),
            "Rebatched"
        );
        Ok(())
    }

    /// Override one machine's high-water-mark and re-derive its capacity.
    pub fn set_high_water_mark(
        &mut self,
        machine: MachineId,
        high_water_mark: f64,
    ) -> Result<(), SchedulerError> {
        self.kv.set_high_water_mark(machine, high_water_mark)?;
        self.refresh_capacity(&[machine])?;
        self.graph.recompute_max_flow();
        Ok(())
    }

    fn refresh_capacity(&mut self, machines: &[MachineId]) -> Result<(), SchedulerError> {
        for &machine in machines {
            let raw = self.graph.raw_capacity(machine);
            let effective = self.kv.effective_capacity(machine, raw);
            self.graph.set_compute_capacity(machine, effective)?;
        }
        Ok(())
    }

    /// Cross-check graph flow and KV reservations against admitted routes.
    pub fn check_invariants(&self) -> Result<(), SchedulerError> {
        self.graph.check_invariants()?;
        self.kv.check_invariants()?;

        if self.kv.reservation_count() != self.admitted.len() {
            return Err(SchedulerError::InvariantViolation(format!(
                "{} KV reservations for {} admitted requests",
                self.kv.reservation_count(),
                self.admitted.len()
            )));
        }

        let mut expected = vec![0.0; self.graph.edges().len()];
        for (id, path) in &self.admitted {
            if !self.kv.is_reserved(*id) {
                return Err(SchedulerError::InvariantViolation(format!(
                    "admitted request {} holds no KV reservation",
                    id
                )));
            }
            for &e in &path.edges {
                expected[e] += REQUEST_DEMAND;
            }
        }
        for (edge, want) in self.graph.edges().iter().zip(expected) {
            if (edge.flow - want).abs() > FLOW_EPSILON * (1.0 + want) {
                return Err(SchedulerError::InvariantViolation(format!(
                    "edge {:?} carries {} but admitted routes account for {}",
                    edge.kind, edge.flow, want
                )));
            }
        }
        Ok(())
    }
}
