//! Cluster capacity as a flow network.
//!
//! The network is layered:
//!
//! ```text
//! Source ──ingress──▶ Compute(m) ──compute──▶ Stage(m) ──link──▶ Compute(m') … Stage(k) ──egress──▶ Sink
//! ```
//!
//! - `Source → Compute(m)` for every machine hosting layer 0 (coordinator link);
//! - `Compute(m) → Stage(m)` carries the machine's effective throughput;
//! - `Stage(m) → Compute(m')` when `m'` hosts the layer right after `m`'s shard
//!   and a network link exists;
//! - `Stage(m) → Sink` when `m` holds the last layer.
//!
//! Edge `flow` is the flow committed by admitted requests. `flow_value` is the
//! maximum feasible flow given the current capacities, obtained by augmenting
//! the committed flow along shortest residual paths (Edmonds–Karp). Because
//! pipeline stages strictly advance through the layers, the graph is a DAG.

use crate::cluster::{ClusterModel, Endpoint, MachineId};
use crate::scheduler::SchedulerError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Tolerance for floating-point flow comparisons.
pub const FLOW_EPSILON: f64 = 1e-9;

pub const SOURCE: usize = 0;
pub const SINK: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Source,
    Compute(MachineId),
    Stage(MachineId),
    Sink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeKind {
    Ingress(MachineId),
    Compute(MachineId),
    Link { from: MachineId, to: MachineId },
    Egress(MachineId),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
    pub kind: EdgeKind,
    pub capacity: f64,
    pub flow: f64,
    pub latency_us: u64,
}

impl Edge {
    pub fn residual(&self) -> f64 {
        (self.capacity - self.flow).max(0.0)
    }
}

/// Direction of the final machine-id tie-break between otherwise equal paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdOrder {
    #[default]
    Ascending,
    Descending,
}

/// A source-to-sink path through the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowPath {
    /// Edge indices from source to sink.
    pub edges: Vec<usize>,
    /// Machines visited, in pipeline order.
    pub machines: Vec<MachineId>,
}

/// Ranking key used to choose between valid paths.
#[derive(Debug, Clone, PartialEq)]
pub struct PathRank {
    /// Smallest compute-edge residual along the path.
    pub headroom: f64,
    pub latency_us: u64,
    pub machines: Vec<MachineId>,
}

impl PathRank {
    /// More headroom wins, then lower latency, then the machine-id sequence.
    pub fn outranks(&self, other: &PathRank, order: IdOrder) -> bool {
        if (self.headroom - other.headroom).abs() > FLOW_EPSILON {
            return self.headroom > other.headroom;
        }
        if self.latency_us != other.latency_us {
            return self.latency_us < other.latency_us;
        }
        match order {
            IdOrder::Ascending => self.machines < other.machines,
            IdOrder::Descending => self.machines > other.machines,
        }
    }
}

#[derive(Debug, Clone)]
struct Label {
    latency_us: u64,
    edges: Vec<usize>,
    machines: Vec<MachineId>,
}

impl Label {
    fn better_than(&self, other: &Label, order: IdOrder) -> bool {
        if self.latency_us != other.latency_us {
            return self.latency_us < other.latency_us;
        }
        match order {
            IdOrder::Ascending => self.machines < other.machines,
            IdOrder::Descending => self.machines > other.machines,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowGraph {
    nodes: Vec<NodeKind>,
    edges: Vec<Edge>,
    out_edges: Vec<Vec<usize>>,
    in_edges: Vec<Vec<usize>>,
    compute_edges: BTreeMap<MachineId, usize>,
    raw_capacity: BTreeMap<MachineId, f64>,
    topo_order: Vec<usize>,
    flow_value: f64,
}

impl FlowGraph {
    /// Build the network for a placed cluster with no committed flow.
    pub fn from_cluster(cluster: &ClusterModel) -> Self {
        let mut graph = Self {
            nodes: vec![NodeKind::Source, NodeKind::Sink],
            edges: Vec::new(),
            out_edges: vec![Vec::new(), Vec::new()],
            in_edges: vec![Vec::new(), Vec::new()],
            compute_edges: BTreeMap::new(),
            raw_capacity: BTreeMap::new(),
            topo_order: Vec::new(),
            flow_value: 0.0,
        };

        let mut node_of: BTreeMap<MachineId, (usize, usize)> = BTreeMap::new();
        for machine in cluster.machines() {
            let compute = graph.add_node(NodeKind::Compute(machine.id));
            let stage = graph.add_node(NodeKind::Stage(machine.id));
            node_of.insert(machine.id, (compute, stage));
        }

        for machine in cluster.machines() {
            let (compute, stage) = node_of[&machine.id];
            if machine.shard.layers.start == 0 {
                if let Some(link) = cluster.link(Endpoint::Coordinator, Endpoint::Machine(machine.id))
                {
                    graph.add_edge(
                        SOURCE,
                        compute,
                        EdgeKind::Ingress(machine.id),
                        link.capacity(),
                        link.latency_us,
                    );
                }
            }
            let idx = graph.add_edge(
                compute,
                stage,
                EdgeKind::Compute(machine.id),
                machine.throughput,
                0,
            );
            graph.compute_edges.insert(machine.id, idx);
            graph.raw_capacity.insert(machine.id, machine.throughput);

            for next in cluster.next_hops(machine.id) {
                if let Some(link) =
                    cluster.link(Endpoint::Machine(machine.id), Endpoint::Machine(next))
                {
                    graph.add_edge(
                        stage,
                        node_of[&next].0,
                        EdgeKind::Link {
                            from: machine.id,
                            to: next,
                        },
                        link.capacity(),
                        link.latency_us,
                    );
                }
            }
            if cluster.is_exit(machine.id) {
                graph.add_edge(stage, SINK, EdgeKind::Egress(machine.id), f64::INFINITY, 0);
            }
        }

        let mut ordered: Vec<_> = cluster.machines().collect();
        ordered.sort_by_key(|m| (m.shard.layers.end, m.id));
        graph.topo_order.push(SOURCE);
        for machine in ordered {
            let (compute, stage) = node_of[&machine.id];
            graph.topo_order.push(compute);
            graph.topo_order.push(stage);
        }
        graph.topo_order.push(SINK);

        graph.recompute_max_flow();
        graph
    }

    fn add_node(&mut self, kind: NodeKind) -> usize {
        self.nodes.push(kind);
        self.out_edges.push(Vec::new());
        self.in_edges.push(Vec::new());
        self.nodes.len() - 1
    }

    fn add_edge(
        &mut self,
        from: usize,
        to: usize,
        kind: EdgeKind,
        capacity: f64,
        latency_us: u64,
    ) -> usize {
        self.edges.push(Edge {
            from,
            to,
            kind,
            capacity,
            flow: 0.0,
            latency_us,
        });
        let idx = self.edges.len() - 1;
        self.out_edges[from].push(idx);
        self.in_edges[to].push(idx);
        idx
    }

    pub fn nodes(&self) -> &[NodeKind] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, idx: usize) -> Option<&Edge> {
        self.edges.get(idx)
    }

    /// Current maximum feasible aggregate throughput.
    pub fn flow_value(&self) -> f64 {
        self.flow_value
    }

    /// Flow committed by admitted requests.
    pub fn committed_flow(&self) -> f64 {
        self.out_edges[SOURCE]
            .iter()
            .map(|&e| self.edges[e].flow)
            .sum()
    }

    pub fn compute_edge(&self, machine: MachineId) -> Option<&Edge> {
        self.compute_edges.get(&machine).map(|&e| &self.edges[e])
    }

    /// Effective (possibly KV-clipped) capacity of a machine's compute edge.
    pub fn machine_capacity(&self, machine: MachineId) -> f64 {
        self.compute_edge(machine).map(|e| e.capacity).unwrap_or(0.0)
    }

    pub fn machine_flow(&self, machine: MachineId) -> f64 {
        self.compute_edge(machine).map(|e| e.flow).unwrap_or(0.0)
    }

    pub fn machine_headroom(&self, machine: MachineId) -> f64 {
        self.compute_edge(machine).map(|e| e.residual()).unwrap_or(0.0)
    }

    pub fn raw_capacity(&self, machine: MachineId) -> f64 {
        self.raw_capacity.get(&machine).copied().unwrap_or(0.0)
    }

    /// Machine entered through edge `idx`, if it leads into a compute node.
    pub fn edge_target_machine(&self, idx: usize) -> Option<MachineId> {
        match self.nodes[self.edges[idx].to] {
            NodeKind::Compute(m) => Some(m),
            _ => None,
        }
    }

    /// Set a machine's compute capacity.
    ///
    /// Capacity never drops below the flow already committed on the edge, so
    /// clipping closes admission without invalidating in-flight requests.
    pub fn set_compute_capacity(
        &mut self,
        machine: MachineId,
        capacity: f64,
    ) -> Result<(), SchedulerError> {
        let idx = *self
            .compute_edges
            .get(&machine)
            .ok_or(SchedulerError::UnknownMachine(machine))?;
        let raw = self.raw_capacity[&machine];
        let edge = &mut self.edges[idx];
        edge.capacity = capacity.min(raw).max(edge.flow);
        Ok(())
    }

    pub fn path_latency_us(&self, path: &FlowPath) -> u64 {
        path.edges.iter().map(|&e| self.edges[e].latency_us).sum()
    }

    /// Smallest compute-edge residual on the path.
    pub fn path_headroom(&self, path: &FlowPath) -> f64 {
        path.machines
            .iter()
            .map(|&m| self.machine_headroom(m))
            .fold(f64::INFINITY, f64::min)
    }

    pub fn rank(&self, path: &FlowPath) -> PathRank {
        PathRank {
            headroom: self.path_headroom(path),
            latency_us: self.path_latency_us(path),
            machines: path.machines.clone(),
        }
    }

    /// Whether `path` can carry `demand` more flow right now.
    pub fn path_is_feasible(
        &self,
        path: &FlowPath,
        demand: f64,
        admissible: &dyn Fn(MachineId) -> bool,
    ) -> bool {
        path.edges
            .iter()
            .all(|&e| self.edges.get(e).is_some_and(|edge| edge.residual() + FLOW_EPSILON >= demand))
            && path.machines.iter().all(|&m| admissible(m))
    }

    fn validate_path(&self, path: &FlowPath) -> Result<(), SchedulerError> {
        let mut at = SOURCE;
        for &e in &path.edges {
            let edge = self.edges.get(e).ok_or_else(|| {
                SchedulerError::InvariantViolation(format!("path references unknown edge {}", e))
            })?;
            if edge.from != at {
                return Err(SchedulerError::InvariantViolation(format!(
                    "path is not contiguous at edge {}",
                    e
                )));
            }
            at = edge.to;
        }
        if at != SINK {
            return Err(SchedulerError::InvariantViolation(
                "path does not end at the sink".to_string(),
            ));
        }
        Ok(())
    }

    /// Commit `demand` units of flow along `path`.
    pub fn commit(&mut self, path: &FlowPath, demand: f64) -> Result<(), SchedulerError> {
        self.validate_path(path)?;
        for &e in &path.edges {
            let edge = &self.edges[e];
            if edge.residual() + FLOW_EPSILON < demand {
                return Err(SchedulerError::InvariantViolation(format!(
                    "committing {} on edge {:?} with residual {}",
                    demand,
                    edge.kind,
                    edge.residual()
                )));
            }
        }
        for &e in &path.edges {
            let edge = &mut self.edges[e];
            edge.flow = (edge.flow + demand).min(edge.capacity);
        }
        Ok(())
    }

    /// Return `demand` units of flow previously committed along `path`.
    pub fn release(&mut self, path: &FlowPath, demand: f64) -> Result<(), SchedulerError> {
        self.validate_path(path)?;
        for &e in &path.edges {
            let edge = &self.edges[e];
            if edge.flow + FLOW_EPSILON < demand {
                return Err(SchedulerError::InvariantViolation(format!(
                    "releasing {} from edge {:?} carrying only {}",
                    demand, edge.kind, edge.flow
                )));
            }
        }
        for &e in &path.edges {
            let edge = &mut self.edges[e];
            edge.flow -= demand;
            if edge.flow < FLOW_EPSILON {
                edge.flow = 0.0;
            }
        }
        Ok(())
    }

    /// Recompute `flow_value` by augmenting the committed flow.
    pub fn recompute_max_flow(&mut self) -> f64 {
        let mut flows: Vec<f64> = self.edges.iter().map(|e| e.flow).collect();
        let extra = self.augment(&mut flows);
        self.flow_value = self.committed_flow() + extra;
        self.flow_value
    }

    /// Edmonds–Karp over the residual graph; returns the flow added.
    fn augment(&self, flows: &mut [f64]) -> f64 {
        let mut added = 0.0;
        loop {
            let mut parent: Vec<Option<(usize, bool)>> = vec![None; self.nodes.len()];
            let mut visited = vec![false; self.nodes.len()];
            let mut queue = VecDeque::new();
            visited[SOURCE] = true;
            queue.push_back(SOURCE);

            while let Some(u) = queue.pop_front() {
                if u == SINK {
                    break;
                }
                for &e in &self.out_edges[u] {
                    let v = self.edges[e].to;
                    if !visited[v] && self.edges[e].capacity - flows[e] > FLOW_EPSILON {
                        visited[v] = true;
                        parent[v] = Some((e, true));
                        queue.push_back(v);
                    }
                }
                for &e in &self.in_edges[u] {
                    let v = self.edges[e].from;
                    if !visited[v] && flows[e] > FLOW_EPSILON {
                        visited[v] = true;
                        parent[v] = Some((e, false));
                        queue.push_back(v);
                    }
                }
            }

            if !visited[SINK] {
                break;
            }

            let mut bottleneck = f64::INFINITY;
            let mut v = SINK;
            while let Some((e, forward)) = parent[v] {
                let residual = if forward {
                    self.edges[e].capacity - flows[e]
                } else {
                    flows[e]
                };
                bottleneck = bottleneck.min(residual);
                v = if forward {
                    self.edges[e].from
                } else {
                    self.edges[e].to
                };
            }
            // Every source-sink path crosses a finite compute edge.
            if !bottleneck.is_finite() {
                break;
            }

            let mut v = SINK;
            while let Some((e, forward)) = parent[v] {
                if forward {
                    flows[e] += bottleneck;
                    v = self.edges[e].from;
                } else {
                    flows[e] -= bottleneck;
                    v = self.edges[e].to;
                }
            }
            added += bottleneck;
        }
        added
    }

    /// Maximum flow on the current capacities, decomposed into paths.
    ///
    /// Ignores committed flow: this is the plan a fresh batch would follow.
    pub fn max_flow_decomposition(&self) -> Vec<(FlowPath, f64)> {
        let mut flows = vec![0.0; self.edges.len()];
        self.augment(&mut flows);

        let mut paths = Vec::new();
        for _ in 0..=self.edges.len() {
            let mut edges = Vec::new();
            let mut machines = Vec::new();
            let mut at = SOURCE;
            while at != SINK {
                let Some(&e) = self.out_edges[at]
                    .iter()
                    .find(|&&e| flows[e] > FLOW_EPSILON)
                else {
                    break;
                };
                if let EdgeKind::Compute(m) = self.edges[e].kind {
                    machines.push(m);
                }
                edges.push(e);
                at = self.edges[e].to;
            }
            if at != SINK || edges.is_empty() {
                break;
            }
            let amount = edges
                .iter()
                .map(|&e| flows[e])
                .fold(f64::INFINITY, f64::min);
            for &e in &edges {
                flows[e] -= amount;
                if flows[e] < FLOW_EPSILON {
                    flows[e] = 0.0;
                }
            }
            paths.push((FlowPath { edges, machines }, amount));
        }
        paths
    }

    /// Best augmenting path for `demand` under the tie-break rules.
    ///
    /// Candidate headroom levels are tried from highest to lowest; at each
    /// level the minimum-latency path using only machines with at least that
    /// much headroom is found with a DAG relaxation. The first level with a
    /// path yields the max-headroom path, and among those the lowest latency
    /// and then the preferred machine-id sequence.
    pub fn find_path(
        &self,
        demand: f64,
        admissible: &dyn Fn(MachineId) -> bool,
        order: IdOrder,
    ) -> Option<FlowPath> {
        let mut levels: Vec<f64> = self
            .compute_edges
            .iter()
            .filter(|(m, _)| admissible(**m))
            .map(|(_, &e)| self.edges[e].residual())
            .filter(|r| *r + FLOW_EPSILON >= demand)
            .collect();
        levels.sort_by(|a, b| b.total_cmp(a));
        levels.dedup_by(|a, b| (*a - *b).abs() <= FLOW_EPSILON);

        levels
            .into_iter()
            .find_map(|level| self.min_latency_path(demand, level, admissible, order))
    }

    fn min_latency_path(
        &self,
        demand: f64,
        min_headroom: f64,
        admissible: &dyn Fn(MachineId) -> bool,
        order: IdOrder,
    ) -> Option<FlowPath> {
        let mut best: Vec<Option<Label>> = vec![None; self.nodes.len()];
        best[SOURCE] = Some(Label {
            latency_us: 0,
            edges: Vec::new(),
            machines: Vec::new(),
        });

        for &u in &self.topo_order {
            let Some(label) = best[u].clone() else {
                continue;
            };
            for &e in &self.out_edges[u] {
                let edge = &self.edges[e];
                let residual = edge.residual();
                if residual + FLOW_EPSILON < demand {
                    continue;
                }
                let mut candidate = Label {
                    latency_us: label.latency_us + edge.latency_us,
                    edges: label.edges.clone(),
                    machines: label.machines.clone(),
                };
                if let EdgeKind::Compute(m) = edge.kind {
                    if !admissible(m) || residual + FLOW_EPSILON < min_headroom {
                        continue;
                    }
                    candidate.machines.push(m);
                }
                candidate.edges.push(e);
                let replace = match &best[edge.to] {
                    None => true,
                    Some(current) => candidate.better_than(current, order),
                };
                if replace {
                    best[edge.to] = Some(candidate);
                }
            }
        }

        best[SINK].take().map(|label| FlowPath {
            edges: label.edges,
            machines: label.machines,
        })
    }

    /// Depth-first search for any feasible path, visiting successors in the
    /// order chosen by `order`. Used by the greedy policies.
    pub fn depth_first_path(
        &self,
        demand: f64,
        admissible: &dyn Fn(MachineId) -> bool,
        order: &mut dyn FnMut(&mut Vec<usize>),
    ) -> Option<FlowPath> {
        let mut dead = vec![false; self.nodes.len()];
        let mut stack = Vec::new();
        if self.dfs(SOURCE, demand, admissible, order, &mut dead, &mut stack) {
            let machines = stack
                .iter()
                .filter_map(|&e| match self.edges[e].kind {
                    EdgeKind::Compute(m) => Some(m),
                    _ => None,
                })
                .collect();
            Some(FlowPath {
                edges: stack,
                machines,
            })
        } else {
            None
        }
    }

    fn dfs(
        &self,
        u: usize,
        demand: f64,
        admissible: &dyn Fn(MachineId) -> bool,
        order: &mut dyn FnMut(&mut Vec<usize>),
        dead: &mut [bool],
        stack: &mut Vec<usize>,
    ) -> bool {
        if u == SINK {
            return true;
        }
        let mut candidates: Vec<usize> = self.out_edges[u]
            .iter()
            .copied()
            .filter(|&e| {
                let edge = &self.edges[e];
                if dead[edge.to] || edge.residual() + FLOW_EPSILON < demand {
                    return false;
                }
                match edge.kind {
                    EdgeKind::Compute(m) => admissible(m),
                    _ => true,
                }
            })
            .collect();
        order(&mut candidates);
        for e in candidates {
            stack.push(e);
            if self.dfs(self.edges[e].to, demand, admissible, order, dead, stack) {
                return true;
            }
            stack.pop();
        }
        dead[u] = true;
        false
    }

    /// Check capacity bounds and flow conservation.
    pub fn check_invariants(&self) -> Result<(), SchedulerError> {
        for edge in &self.edges {
            if edge.flow < -FLOW_EPSILON {
                return Err(SchedulerError::InvariantViolation(format!(
                    "negative flow {} on {:?}",
                    edge.flow, edge.kind
                )));
            }
            if edge.flow > edge.capacity + FLOW_EPSILON {
                return Err(SchedulerError::InvariantViolation(format!(
                    "flow {} exceeds capacity {} on {:?}",
                    edge.flow, edge.capacity, edge.kind
                )));
            }
            if let EdgeKind::Compute(m) = edge.kind {
                if edge.capacity > self.raw_capacity(m) + FLOW_EPSILON {
                    return Err(SchedulerError::InvariantViolation(format!(
                        "{} capacity {} exceeds raw throughput",
                        m, edge.capacity
                    )));
                }
            }
        }
        for (node, kind) in self.nodes.iter().enumerate() {
            if matches!(kind, NodeKind::Source | NodeKind::Sink) {
                continue;
            }
            let inflow: f64 = self.in_edges[node].iter().map(|&e| self.edges[e].flow).sum();
            let outflow: f64 = self.out_edges[node].iter().map(|&e| self.edges[e].flow).sum();
            if (inflow - outflow).abs() > FLOW_EPSILON * (1.0 + inflow.abs()) {
                return Err(SchedulerError::InvariantViolation(format!(
                    "flow not conserved at {:?}: in {} out {}",
                    kind, inflow, outflow
                )));
            }
        }
        if self.flow_value + FLOW_EPSILON < self.committed_flow() {
            return Err(SchedulerError::InvariantViolation(format!(
                "flow value {} below committed flow {}",
                self.flow_value,
                self.committed_flow()
            )));
        }
        Ok(())
    }
}
