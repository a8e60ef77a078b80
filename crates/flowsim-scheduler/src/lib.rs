//! Global request scheduling for pipeline-parallel LLM serving clusters.
//!
//! The cluster's compute capacity is modeled as a flow network
//! ([`FlowGraph`]) and coupled to per-machine KV cache admission
//! ([`KvCacheTracker`]). A [`GlobalScheduler`] routes each request along a
//! source-to-sink path or queues it when no path has room:
//!
//! | Method | Strategy |
//! |--------|----------|
//! | [`MaxFlowPolicy`] | Max-headroom augmenting path (online) or a precomputed max-flow plan (offline) |
//! | [`ShortestQueue`] | Least-loaded next hop at every stage |
//! | [`RandomPolicy`] | Uniformly random feasible next hop |

pub mod cluster;
pub mod flow_graph;
pub mod kv_cache;
pub mod max_flow;
pub mod random;
pub mod scheduler;
pub mod shortest_queue;
pub mod traits;

pub use cluster::{
    ClusterBuilder, ClusterError, ClusterModel, Endpoint, HardwareType, LayerRange, Link,
    LinkSpec, Machine, MachineId, MachineSpec, Placement, Shard, ShardAssignment,
};
pub use flow_graph::{FlowGraph, FlowPath, IdOrder, PathRank};
pub use kv_cache::{KvCacheTracker, KvParameters};
pub use max_flow::{MaxFlowPolicy, PathPlan};
pub use random::RandomPolicy;
pub use scheduler::{
    GlobalScheduler, Policy, SchedulerConfig, SchedulerError, SchedulingMethod, SchedulingMode,
};
pub use shortest_queue::ShortestQueue;
pub use traits::*;

/// Parse a scheduling method by name.
pub fn scheduler_by_name(name: &str) -> Option<SchedulingMethod> {
    name.parse().ok()
}

/// List all available scheduling method names.
pub fn available_methods() -> Vec<&'static str> {
    SchedulingMethod::ALL.iter().map(|m| m.as_str()).collect()
}
