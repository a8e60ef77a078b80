//! Max-flow routing.
//!
//! Online mode searches the live residual graph for every arrival. Offline
//! mode routes against a [`PathPlan`]: the maximum flow decomposed into
//! source-to-sink paths, each with a flow budget. The plan is rebuilt on
//! every rebatch and admissions are charged against it in between.

use crate::flow_graph::{FlowGraph, FlowPath, IdOrder, FLOW_EPSILON};
use crate::scheduler::SchedulingMode;
use crate::traits::*;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedPath {
    pub path: FlowPath,
    /// Flow the decomposition assigned to this path.
    pub budget: f64,
    /// Flow currently committed along it.
    pub in_use: f64,
}

impl PlannedPath {
    pub fn has_room(&self, demand: f64) -> bool {
        self.in_use + demand <= self.budget + FLOW_EPSILON
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathPlan {
    entries: Vec<PlannedPath>,
}

impl PathPlan {
    pub fn from_graph(graph: &FlowGraph) -> Self {
        let entries = graph
            .max_flow_decomposition()
            .into_iter()
            .map(|(path, budget)| PlannedPath {
                path,
                budget,
                in_use: 0.0,
            })
            .collect();
        Self { entries }
    }

    /// Re-derive `in_use` from the routes of in-flight requests.
    pub fn recount(&mut self, admitted: &BTreeMap<RequestId, FlowPath>) {
        for entry in &mut self.entries {
            entry.in_use = 0.0;
        }
        for path in admitted.values() {
            self.charge(path, REQUEST_DEMAND);
        }
    }

    fn charge(&mut self, path: &FlowPath, amount: f64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| &e.path == path) {
            entry.in_use = (entry.in_use + amount).max(0.0);
        }
    }

    pub fn entries(&self) -> &[PlannedPath] {
        &self.entries
    }

    pub fn total_budget(&self) -> f64 {
        self.entries.iter().map(|e| e.budget).sum()
    }
}

#[derive(Debug, Clone)]
pub struct MaxFlowPolicy {
    mode: SchedulingMode,
    order: IdOrder,
    plan: PathPlan,
}

impl MaxFlowPolicy {
    pub fn new(mode: SchedulingMode, order: IdOrder) -> Self {
        Self {
            mode,
            order,
            plan: PathPlan::default(),
        }
    }

    pub fn plan(&self) -> &PathPlan {
        &self.plan
    }

    fn select_planned(&self, ctx: &RoutingContext<'_>) -> Option<FlowPath> {
        let admissible = |m| ctx.admissible(m);
        let mut best: Option<(&PlannedPath, crate::flow_graph::PathRank)> = None;
        for entry in &self.plan.entries {
            if !entry.has_room(ctx.demand)
                || !ctx
                    .graph
                    .path_is_feasible(&entry.path, ctx.demand, &admissible)
            {
                continue;
            }
            let rank = ctx.graph.rank(&entry.path);
            let better = match &best {
                None => true,
                Some((_, current)) => rank.outranks(current, self.order),
            };
            if better {
                best = Some((entry, rank));
            }
        }
        best.map(|(entry, _)| entry.path.clone())
    }
}

impl SchedulingPolicy for MaxFlowPolicy {
    fn select(&mut self, _request: &RouteRequest, ctx: &RoutingContext<'_>) -> Option<FlowPath> {
        match self.mode {
            SchedulingMode::Online => {
                ctx.graph
                    .find_path(ctx.demand, &|m| ctx.admissible(m), self.order)
            }
            SchedulingMode::Offline => self.select_planned(ctx),
        }
    }

    fn on_admit(&mut self, path: &FlowPath) {
        if self.mode == SchedulingMode::Offline {
            self.plan.charge(path, REQUEST_DEMAND);
        }
    }

    fn on_release(&mut self, path: &FlowPath) {
        if self.mode == SchedulingMode::Offline {
            self.plan.charge(path, -REQUEST_DEMAND);
        }
    }

    fn on_rebatch(&mut self, graph: &FlowGraph, admitted: &BTreeMap<RequestId, FlowPath>) {
        if self.mode == SchedulingMode::Offline {
            self.plan = PathPlan::from_graph(graph);
            self.plan.recount(admitted);
        }
    }

    fn name(&self) -> &str {
        "max_flow"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterBuilder, ClusterModel, HardwareType, MachineId};
    use crate::kv_cache::{KvCacheTracker, KvParameters};

    fn two_path_cluster() -> ClusterModel {
        ClusterBuilder::new(1)
            .machine(0, HardwareType::A100, 3.0, 100, (0, 1))
            .machine(1, HardwareType::L4, 2.0, 100, (0, 1))
            .build()
            .unwrap()
    }

    fn ctx<'a>(
        cluster: &'a ClusterModel,
        graph: &'a FlowGraph,
        kv: &'a KvCacheTracker,
    ) -> RoutingContext<'a> {
        RoutingContext {
            cluster,
            graph,
            kv,
            footprint: 1,
            demand: REQUEST_DEMAND,
        }
    }

    fn request() -> RouteRequest {
        RouteRequest {
            id: RequestId(0),
            token_count: 1,
        }
    }

    #[test]
    fn test_plan_budgets_cover_flow_value() {
        let cluster = two_path_cluster();
        let graph = FlowGraph::from_cluster(&cluster);
        let plan = PathPlan::from_graph(&graph);
        assert_eq!(plan.entries().len(), 2);
        assert!((plan.total_budget() - graph.flow_value()).abs() < 1e-9);
    }

    #[test]
    fn test_offline_respects_budget() {
        let cluster = two_path_cluster();
        let mut graph = FlowGraph::from_cluster(&cluster);
        let kv = KvCacheTracker::new(&cluster, KvParameters::default());
        let mut policy = MaxFlowPolicy::new(SchedulingMode::Offline, IdOrder::Ascending);
        policy.on_rebatch(&graph, &BTreeMap::new());

        let mut picks = Vec::new();
        for _ in 0..5 {
            let path = policy
                .select(&request(), &ctx(&cluster, &graph, &kv))
                .unwrap();
            graph.commit(&path, REQUEST_DEMAND).unwrap();
            policy.on_admit(&path);
            picks.push(path.machines[0]);
        }
        assert_eq!(picks.iter().filter(|m| **m == MachineId(0)).count(), 3);
        assert_eq!(picks.iter().filter(|m| **m == MachineId(1)).count(), 2);
        assert!(policy
            .select(&request(), &ctx(&cluster, &graph, &kv))
            .is_none());
    }

    #[test]
    fn test_online_balances_headroom() {
        let cluster = two_path_cluster();
        let mut graph = FlowGraph::from_cluster(&cluster);
        let kv = KvCacheTracker::new(&cluster, KvParameters::default());
        let mut policy = MaxFlowPolicy::new(SchedulingMode::Online, IdOrder::Ascending);

        let first = policy
            .select(&request(), &ctx(&cluster, &graph, &kv))
            .unwrap();
        assert_eq!(first.machines, vec![MachineId(0)]);
        graph.commit(&first, REQUEST_DEMAND).unwrap();
        // Both machines now have headroom 2; ids break the tie.
        let second = policy
            .select(&request(), &ctx(&cluster, &graph, &kv))
            .unwrap();
        assert_eq!(second.machines, vec![MachineId(0)]);
    }

    #[test]
    fn test_recount_tracks_admitted_routes() {
        let cluster = two_path_cluster();
        let graph = FlowGraph::from_cluster(&cluster);
        let mut plan = PathPlan::from_graph(&graph);
        let path = plan.entries()[0].path.clone();
        let admitted: BTreeMap<_, _> = (0..2).map(|i| (RequestId(i), path.clone())).collect();
        plan.recount(&admitted);
        assert_eq!(plan.entries()[0].in_use, 2.0);
        assert_eq!(plan.entries()[1].in_use, 0.0);
    }
}
