//! Shortest-queue routing.
//!
//! Walks the pipeline stage by stage, always stepping to the next machine
//! with the fewest in-flight requests (ties broken by machine id), and
//! backtracks when a branch cannot reach the sink.

use crate::flow_graph::FlowPath;
use crate::traits::*;

#[derive(Debug, Clone, Default)]
pub struct ShortestQueue;

impl ShortestQueue {
    pub fn new() -> Self {
        Self
    }
}

impl SchedulingPolicy for ShortestQueue {
    fn select(&mut self, _request: &RouteRequest, ctx: &RoutingContext<'_>) -> Option<FlowPath> {
        let graph = ctx.graph;
        let mut order = |edges: &mut Vec<usize>| {
            edges.sort_by(|&a, &b| {
                let key = |e: usize| match graph.edge_target_machine(e) {
                    Some(m) => (graph.machine_flow(m), m.0),
                    None => (0.0, 0),
                };
                let (fa, ia) = key(a);
                let (fb, ib) = key(b);
                fa.total_cmp(&fb).then(ia.cmp(&ib))
            });
        };
        graph.depth_first_path(ctx.demand, &|m| ctx.admissible(m), &mut order)
    }

    fn name(&self) -> &str {
        "shortest_queue"
    }
}
