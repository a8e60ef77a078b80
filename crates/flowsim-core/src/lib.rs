//! flowsim: discrete-event simulator for pipeline-parallel LLM serving.
//!
//! This crate provides the simulation engine that moves requests through a
//! cluster of machines, each hosting a contiguous range of model layers.
//! Admission and routing are decided by the global max-flow scheduler from
//! `flowsim-scheduler`; the engine models network hops and per-machine
//! compute, and records every step for analysis.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐     ┌───────────┐     ┌──────────────┐
//! │  Feeder  │────▶│  Engine   │────▶│   Registry   │
//! │(arrivals)│     │ (Events)  │     │  + Analysis  │
//! └──────────┘     └─────┬─────┘     └──────────────┘
//!                        │
//!                ┌───────┴───────┐
//!                │    Global     │
//!                │   Scheduler   │
//!                └───────┬───────┘
//!                        │
//!          ┌─────────────┼─────────────┐
//!          ▼             ▼             ▼
//!    ┌──────────┐  ┌──────────┐  ┌──────────┐
//!    │ Machine 0│─▶│ Machine 1│─▶│ Machine N│
//!    │layers a-b│  │layers b-c│  │layers ..L│
//!    └──────────┘  └──────────┘  └──────────┘
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod feeder;
pub mod metrics;
pub mod registry;
pub mod request;

// Re-export key types for convenience.
pub use clock::SimClock;
pub use config::{ConfigError, SimConfig};
pub use engine::{SimError, SimEvent, SimulationEngine};
pub use feeder::{OfflineFeeder, OnlineFeeder, RequestFeeder, TraceFeeder};
pub use metrics::{AnalysisSummary, Measurement, SimulationReport, WatchSnapshot};
pub use registry::{RegistryArchive, RequestRegistry};
pub use request::{ArrivalSpec, Request, RequestPhase};

use flowsim_scheduler::SchedulingMethod;

/// Run a complete simulation with requests from the config's feeder.
pub fn run_simulation(config: SimConfig) -> Result<SimulationReport, SimError> {
    SimulationEngine::from_config(config)?.run()
}

/// Run a complete simulation over a fixed list of arrivals.
pub fn run_with_arrivals(
    config: SimConfig,
    arrivals: Vec<ArrivalSpec>,
) -> Result<SimulationReport, SimError> {
    SimulationEngine::new(config, Box::new(TraceFeeder::new(arrivals)))?.run()
}

/// Run the same config once per scheduling method.
///
/// Each run builds its own engine from a clone of `config`.
pub fn compare_methods(
    config: &SimConfig,
    methods: &[SchedulingMethod],
) -> Result<Vec<SimulationReport>, SimError> {
    methods
        .iter()
        .map(|method| {
            let mut cfg = config.clone();
            cfg.scheduler.method = *method;
            run_simulation(cfg)
        })
        .collect()
}
