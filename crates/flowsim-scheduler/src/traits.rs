//! Scheduling policy trait definitions.
//!
//! Every policy implements [`SchedulingPolicy`]: given a request and a
//! read-only view of the capacity network and KV state, it either picks a
//! route through the pipeline or declines, in which case the request is
//! queued until capacity frees up.

use crate::cluster::ClusterModel;
use crate::flow_graph::{FlowGraph, FlowPath};
use crate::kv_cache::KvCacheTracker;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unique request identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Flow units one admitted request holds on every edge of its route.
pub const REQUEST_DEMAND: f64 = 1.0;

/// Information about a request awaiting admission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteRequest {
    pub id: RequestId,
    /// Tokens the request carries at admission (its prompt length).
    pub token_count: u32,
}

/// Outcome of a routing attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingDecision {
    /// The request was admitted along this route.
    Admit(FlowPath),
    /// No route has spare capacity; hold the request and retry later.
    Queue,
}

/// Read-only state a policy routes against.
pub struct RoutingContext<'a> {
    pub cluster: &'a ClusterModel,
    pub graph: &'a FlowGraph,
    pub kv: &'a KvCacheTracker,
    /// KV tokens the request would reserve on each machine of its route.
    pub footprint: u64,
    pub demand: f64,
}

impl RoutingContext<'_> {
    /// Whether `machine` can take the request's KV reservation.
    pub fn admissible(&self, machine: crate::cluster::MachineId) -> bool {
        self.kv.fits(machine, self.footprint)
    }
}

/// The shared routing capability of every scheduling method.
pub trait SchedulingPolicy {
    /// Pick a feasible route, or `None` to apply backpressure.
    fn select(&mut self, request: &RouteRequest, ctx: &RoutingContext<'_>) -> Option<FlowPath>;

    /// Called after a route is committed.
    fn on_admit(&mut self, _path: &FlowPath) {}

    /// Called after a route is released.
    fn on_release(&mut self, _path: &FlowPath) {}

    /// Called when the scheduler rebuilds its precomputed structures.
    fn on_rebatch(&mut self, _graph: &FlowGraph, _admitted: &BTreeMap<RequestId, FlowPath>) {}

    /// Human-readable name for reports.
    fn name(&self) -> &str;
}
