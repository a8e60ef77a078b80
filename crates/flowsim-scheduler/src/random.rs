//! Random routing baseline.
//!
//! Picks uniformly among feasible next hops at every stage, backtracking
//! out of dead ends. Seeded so runs stay reproducible.

use crate::flow_graph::FlowPath;
use crate::traits::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

#[derive(Debug, Clone)]
pub struct RandomPolicy {
    rng: ChaCha8Rng,
}

impl RandomPolicy {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomPolicy {
    fn default() -> Self {
        Self::new(42)
    }
}

impl SchedulingPolicy for RandomPolicy {
    fn select(&mut self, _request: &RouteRequest, ctx: &RoutingContext<'_>) -> Option<FlowPath> {
        let mut order = |edges: &mut Vec<usize>| edges.shuffle(&mut self.rng);
        ctx.graph
            .depth_first_path(ctx.demand, &|m| ctx.admissible(m), &mut order)
    }

    fn name(&self) -> &str {
        "random"
    }
}
