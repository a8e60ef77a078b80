//! Discrete-event simulation engine.
//!
//! The engine keeps a priority queue of [`SimEvent`]s ordered by
//! `(time, sequence)`. Each iteration pops the next event, advances the
//! virtual clock and processes it, possibly scheduling more events.
//!
//! A request is admitted by the [`GlobalScheduler`], then walks its route
//! once per step: a hop from the coordinator to the first machine, compute
//! there, a hop to the next machine, and so on until the last machine
//! finishes the step. Each machine serves stage work first-come first-served.
//! Requests the scheduler declines wait in a FIFO and are retried whenever
//! capacity may have freed up.

use crate::clock::{secs_to_us, SimClock};
use crate::config::{ConfigError, SimConfig};
use crate::feeder::{FeederView, RequestFeeder};
use crate::metrics::{analyze, SimulationReport, WatchSnapshot};
use crate::registry::RequestRegistry;
use crate::request::{ArrivalSpec, Request, RequestPhase, StageKind};
use flowsim_scheduler::{
    ClusterModel, Endpoint, GlobalScheduler, MachineId, RequestId, RouteRequest,
    RoutingDecision, SchedulerError, SchedulingMode,
};
use std::collections::{BTreeMap, BinaryHeap};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Simulation invariant violated: {0}")]
    Invariant(String),
    #[error("Request {0} arrived twice")]
    DuplicateRequest(RequestId),
    #[error("Unknown request {0}")]
    UnknownRequest(RequestId),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Events in the discrete-event simulation.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    /// A new request reaches the coordinator.
    Arrival(ArrivalSpec),
    /// A request's activations reached `to` over the network.
    NetworkTransferComplete { request_id: RequestId, to: MachineId },
    /// `machine` finished computing its layers for the request's step.
    StageComplete {
        request_id: RequestId,
        machine: MachineId,
    },
    /// A request's admission deadline passed.
    AdmissionTimeout { request_id: RequestId },
    /// Periodic replanning in offline mode.
    Rebatch,
}

/// A timestamped event for the priority queue.
#[derive(Debug, Clone)]
struct TimedEvent {
    time_us: u64,
    sequence: u64,
    event: SimEvent,
}

impl PartialEq for TimedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time_us == other.time_us && self.sequence == other.sequence
    }
}

impl Eq for TimedEvent {}

impl PartialOrd for TimedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; we want min-heap
        other
            .time_us
            .cmp(&self.time_us)
            .then(other.sequence.cmp(&self.sequence))
    }
}

/// Microseconds a machine needs to compute `layers` of its shard for
/// `tokens` tokens. Never less than one.
pub fn service_time_us(tokens: u32, layers: u32, layers_hosted: u32, throughput: f64) -> u64 {
    if layers_hosted == 0 || throughput <= 0.0 {
        return 1;
    }
    let seconds = tokens as f64 * layers as f64 / (layers_hosted as f64 * throughput);
    ((seconds * 1e6).ceil() as u64).max(1)
}

/// The main simulation engine.
pub struct SimulationEngine {
    /// Virtual clock.
    pub clock: SimClock,
    /// Event queue (min-heap by time).
    event_queue: BinaryHeap<TimedEvent>,
    /// Sequence counter for tie-breaking.
    sequence: u64,
    scheduler: GlobalScheduler,
    feeder: Box<dyn RequestFeeder>,
    registry: RequestRegistry,
    /// Time each machine finishes its queued stage work.
    busy_until: BTreeMap<MachineId, u64>,
    watch: Vec<WatchSnapshot>,
    next_watch_us: Option<u64>,
    initial_flow_value: f64,
    /// Total events processed.
    pub events_processed: u64,
    config: SimConfig,
}

impl SimulationEngine {
    /// Create an engine whose requests come from the config's feeder.
    pub fn from_config(config: SimConfig) -> Result<Self, SimError> {
        let feeder = config.build_feeder()?;
        Self::new(config, feeder)
    }

    /// Create an engine from config and an explicit feeder.
    pub fn new(config: SimConfig, feeder: Box<dyn RequestFeeder>) -> Result<Self, SimError> {
        config.validate()?;
        let cluster = config.build_cluster()?;
        Ok(Self::with_cluster(config, cluster, feeder))
    }

    /// Create an engine over an already built cluster.
    pub fn with_cluster(
        config: SimConfig,
        cluster: ClusterModel,
        feeder: Box<dyn RequestFeeder>,
    ) -> Self {
        let busy_until = cluster.machine_ids().map(|id| (id, 0)).collect();
        let scheduler = GlobalScheduler::new(cluster, config.scheduler_config());
        let initial_flow_value = scheduler.flow_value();
        let start_us = config.start_us();
        let next_watch_us = config
            .simulation
            .watch_interval_s
            .map(|_| config.analysis_start_us());

        Self {
            clock: SimClock::starting_at_us(start_us),
            event_queue: BinaryHeap::new(),
            sequence: 0,
            scheduler,
            feeder,
            registry: RequestRegistry::new(),
            busy_until,
            watch: Vec::new(),
            next_watch_us,
            initial_flow_value,
            events_processed: 0,
            config,
        }
    }

    pub fn scheduler(&self) -> &GlobalScheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    /// Schedule an event at a given time.
    pub fn schedule_event(&mut self, time_us: u64, event: SimEvent) {
        self.event_queue.push(TimedEvent {
            time_us,
            sequence: self.sequence,
            event,
        });
        self.sequence += 1;
    }

    /// Get the number of pending events.
    pub fn pending_events(&self) -> usize {
        self.event_queue.len()
    }

    /// Run until the stop time or until no events remain.
    ///
    /// Consumes the engine: events scheduled past the stop time are
    /// discarded with it.
    pub fn run(mut self) -> Result<SimulationReport, SimError> {
        let stop_us = self.config.stop_us();
        info!(
            name = %self.config.simulation.name,
            method = self.scheduler.policy_name(),
            mode = %self.scheduler.config().mode,
            flow_value = self.initial_flow_value,
            "Starting simulation"
        );

        let view = self.feeder_view();
        let arrivals = self.feeder.initial_arrivals(&view);
        self.schedule_arrivals(arrivals);
        if self.scheduler.config().mode == SchedulingMode::Offline {
            let next = self.clock.now_us() + self.rebatch_interval_us();
            self.schedule_event(next, SimEvent::Rebatch);
        }

        while let Some(timed_event) = self.event_queue.pop() {
            if timed_event.time_us > stop_us {
                break;
            }
            self.take_snapshots_until(timed_event.time_us);
            self.clock.advance_to_us(timed_event.time_us);
            self.process_event(timed_event.event)?;
            self.events_processed += 1;
            if self.config.simulation.check_invariants {
                self.scheduler.check_invariants()?;
            }
        }
        self.take_snapshots_until(stop_us);

        let archive = self.registry.drain();
        if !archive.unresolved.is_empty() {
            warn!(
                count = archive.unresolved.len(),
                "Requests unresolved at stop time"
            );
        }
        let summary = analyze(&archive, self.config.analysis_start_us(), stop_us);
        info!(
            events = self.events_processed,
            completed = archive.completed.len(),
            dropped = archive.dropped.len(),
            "Simulation finished"
        );

        Ok(SimulationReport {
            name: self.config.simulation.name.clone(),
            method: self.scheduler.policy_name().to_string(),
            mode: self.scheduler.config().mode.to_string(),
            seed: self.config.simulation.seed,
            initial_flow_value: self.initial_flow_value,
            final_flow_value: self.scheduler.flow_value(),
            events_processed: self.events_processed,
            summary,
            watch: std::mem::take(&mut self.watch),
            archive,
        })
    }

    /// Process a single event.
    fn process_event(&mut self, event: SimEvent) -> Result<(), SimError> {
        match event {
            SimEvent::Arrival(spec) => self.handle_arrival(spec),
            SimEvent::NetworkTransferComplete { request_id, to } => {
                self.handle_transfer_complete(request_id, to)
            }
            SimEvent::StageComplete {
                request_id,
                machine,
            } => self.handle_stage_complete(request_id, machine),
            SimEvent::AdmissionTimeout { request_id } => self.handle_timeout(request_id),
            SimEvent::Rebatch => self.handle_rebatch(),
        }
    }

    fn schedule_arrivals(&mut self, arrivals: Vec<ArrivalSpec>) {
        let now = self.clock.now_us();
        for mut spec in arrivals {
            spec.arrival_us = spec.arrival_us.max(now);
            self.schedule_event(spec.arrival_us, SimEvent::Arrival(spec));
        }
    }

    /// Register a request and queue it behind anything already waiting.
    fn handle_arrival(&mut self, spec: ArrivalSpec) -> Result<(), SimError> {
        let now = self.clock.now_us();
        let ratio = self.scheduler.config().kv.expected_output_length_ratio;
        self.registry.insert(Request::from_arrival(&spec, ratio))?;
        self.registry.enqueue_pending(spec.request_id);
        if let Some(deadline) = spec.deadline_us {
            self.schedule_event(
                deadline.max(now),
                SimEvent::AdmissionTimeout {
                    request_id: spec.request_id,
                },
            );
        }
        debug!(request = %spec.request_id, input = spec.input_len, "Arrival");
        self.retry_pending()
    }

    /// Offer every pending request to the scheduler in arrival order.
    ///
    /// A request that cannot be placed does not block later ones.
    fn retry_pending(&mut self) -> Result<(), SimError> {
        for id in self.registry.pending_ids() {
            let token_count = self
                .registry
                .get(id)
                .ok_or(SimError::UnknownRequest(id))?
                .input_len;
            match self.scheduler.route(&RouteRequest { id, token_count })? {
                RoutingDecision::Admit(path) => {
                    self.registry.remove_pending(id);
                    let now = self.clock.now_us();
                    let request = self.registry.get_mut(id)?;
                    request.admit(path.machines, now);
                    self.start_step(id)?;
                }
                RoutingDecision::Queue => {}
            }
        }
        Ok(())
    }

    /// Begin a pipeline pass with the hop from the coordinator.
    fn start_step(&mut self, id: RequestId) -> Result<(), SimError> {
        let now = self.clock.now_us();
        let request = self.registry.get_mut(id)?;
        request.begin_step(now);
        let tokens = request.token_seq_length;
        let first = request.current_machine().ok_or_else(|| {
            SimError::Invariant(format!("request {} admitted with an empty route", id))
        })?;
        let transfer_us = self.transfer_time_us(Endpoint::Coordinator, first, tokens)?;
        self.schedule_event(
            now + transfer_us,
            SimEvent::NetworkTransferComplete {
                request_id: id,
                to: first,
            },
        );
        Ok(())
    }

    fn handle_transfer_complete(&mut self, id: RequestId, to: MachineId) -> Result<(), SimError> {
        let now = self.clock.now_us();
        let request = self.registry.get_mut(id)?;
        if request.current_machine() != Some(to) {
            return Err(SimError::Invariant(format!(
                "request {} arrived at {} off its route",
                id, to
            )));
        }
        request.record(to, StageKind::Transfer, now)?;
        let tokens = request.token_seq_length;
        let entry_layer = match request.hop() {
            0 => 0,
            hop => {
                let prev = request.route[hop - 1];
                self.scheduler
                    .cluster()
                    .shard(prev)
                    .map(|s| s.layers.end)
                    .ok_or(SchedulerError::UnknownMachine(prev))?
            }
        };

        let cluster = self.scheduler.cluster();
        let machine = cluster
            .machine(to)
            .ok_or(SchedulerError::UnknownMachine(to))?;
        let service_us = service_time_us(
            tokens,
            cluster.layers_computed(to, entry_layer),
            machine.shard.layers.len(),
            machine.throughput,
        );
        let busy = self.busy_until.entry(to).or_insert(0);
        let finish = (*busy).max(now) + service_us;
        *busy = finish;
        self.schedule_event(
            finish,
            SimEvent::StageComplete {
                request_id: id,
                machine: to,
            },
        );
        Ok(())
    }

    fn handle_stage_complete(&mut self, id: RequestId, machine: MachineId) -> Result<(), SimError> {
        let now = self.clock.now_us();
        let request = self.registry.get_mut(id)?;
        request.record(machine, StageKind::Compute, now)?;

        if !request.is_last_hop() {
            let next = request.next_machine().ok_or_else(|| {
                SimError::Invariant(format!("request {} has no hop after {}", id, machine))
            })?;
            request.advance_hop();
            let tokens = request.token_seq_length;
            let transfer_us = self.transfer_time_us(Endpoint::Machine(machine), next, tokens)?;
            self.schedule_event(
                now + transfer_us,
                SimEvent::NetworkTransferComplete {
                    request_id: id,
                    to: next,
                },
            );
            return Ok(());
        }

        let step = request.finish_step(now);
        let phase = request.advance_phase()?;
        debug!(request = %id, phase = ?step.phase, latency_us = step.latency_us(), "Step complete");
        self.registry.record_step(step);

        match phase {
            RequestPhase::Completed => {
                self.scheduler.release(id)?;
                self.registry.complete(id, now)?;
                let view = self.feeder_view();
                let arrivals = self.feeder.on_completion(&view);
                self.schedule_arrivals(arrivals);
                self.retry_pending()
            }
            _ => self.start_step(id),
        }
    }

    fn handle_timeout(&mut self, id: RequestId) -> Result<(), SimError> {
        if !self.registry.is_pending(id) {
            return Ok(());
        }
        let now = self.clock.now_us();
        self.registry.drop_request(id, now)?;
        warn!(request = %id, at_us = now, "Dropped at admission deadline");
        Ok(())
    }

    fn handle_rebatch(&mut self) -> Result<(), SimError> {
        self.scheduler.rebatch()?;
        self.retry_pending()?;
        if !self.event_queue.is_empty() || self.registry.pending_len() > 0 {
            let next = self.clock.now_us() + self.rebatch_interval_us();
            self.schedule_event(next, SimEvent::Rebatch);
        }
        Ok(())
    }

    fn transfer_time_us(&self, from: Endpoint, to: MachineId, tokens: u32) -> Result<u64, SimError> {
        let link = self
            .scheduler
            .cluster()
            .link(from, Endpoint::Machine(to))
            .ok_or_else(|| SimError::Invariant(format!("no link from {} to {}", from, to)))?;
        Ok(link.transfer_time_us(tokens).max(1))
    }

    fn rebatch_interval_us(&self) -> u64 {
        secs_to_us(self.config.scheduler.rebatch_interval_s).max(1)
    }

    fn feeder_view(&self) -> FeederView {
        FeederView {
            now_us: self.clock.now_us(),
            stop_us: self.config.stop_us(),
            mean_kv_occupancy: self.scheduler.mean_kv_occupancy(),
            pending: self.registry.pending_len(),
            in_flight: self.registry.in_flight(),
            resolved: self.registry.completed().len() + self.registry.dropped().len(),
        }
    }

    /// Record every watch tick at or before `time_us`.
    fn take_snapshots_until(&mut self, time_us: u64) {
        let Some(interval_s) = self.config.simulation.watch_interval_s else {
            return;
        };
        let interval_us = secs_to_us(interval_s).max(1);
        let stop_us = self.config.stop_us();
        while let Some(tick) = self.next_watch_us {
            if tick > time_us || tick > stop_us {
                break;
            }
            self.watch.push(WatchSnapshot {
                time_us: tick,
                flow_value: self.scheduler.flow_value(),
                kv_occupancy: self.scheduler.kv_occupancy(),
                pending_queue_depth: self.registry.pending_len(),
                in_flight: self.registry.in_flight(),
            });
            self.next_watch_us = Some(tick + interval_us);
        }
    }
}
