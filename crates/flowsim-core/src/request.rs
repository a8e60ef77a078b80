//! Request model.
//!
//! A [`Request`] is one LLM query moving through the pipeline. It is created
//! when it arrives, mutated only by the engine's dispatch path, and archived
//! unchanged once its last decode step completes.

use crate::engine::SimError;
use flowsim_scheduler::{MachineId, RequestId};
use serde::{Deserialize, Serialize};

/// An arrival produced by a feeder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrivalSpec {
    pub request_id: RequestId,
    pub arrival_us: u64,
    pub input_len: u32,
    pub output_len: u32,
    /// Latest time the request may still be admitted.
    #[serde(default)]
    pub deadline_us: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    /// Prompt processing: the whole input in one step.
    Initialization,
    /// One decode step producing one token.
    Increment,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Arrived at the machine after a network hop.
    Transfer,
    /// Finished computing on the machine.
    Compute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub location: MachineId,
    pub kind: StageKind,
    pub at_us: u64,
}

/// One completed pipeline pass of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub request_id: RequestId,
    pub phase: RequestPhase,
    pub token_seq_length: u32,
    pub started_us: u64,
    pub completed_us: u64,
    pub history: Vec<HistoryEntry>,
}

impl StepRecord {
    pub fn latency_us(&self) -> u64 {
        self.completed_us.saturating_sub(self.started_us)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub phase: RequestPhase,
    /// Tokens processed by the current step.
    pub token_seq_length: u32,
    pub arrival_us: u64,
    pub input_len: u32,
    pub output_len: u32,
    pub tokens_generated: u32,
    pub deadline_us: Option<u64>,
    /// Forecast KV tokens held for the request's lifetime.
    pub output_estimate: u64,
    /// Machines of the admitted route, empty while pending.
    pub route: Vec<MachineId>,
    pub admitted_us: Option<u64>,
    pub history: Vec<HistoryEntry>,
    #[serde(skip)]
    step_started_us: u64,
    #[serde(skip)]
    step_history_start: usize,
    #[serde(skip)]
    hop: usize,
}

impl Request {
    pub fn from_arrival(spec: &ArrivalSpec, expected_output_length_ratio: f64) -> Self {
        Self {
            id: spec.request_id,
            phase: RequestPhase::Initialization,
            token_seq_length: spec.input_len,
            arrival_us: spec.arrival_us,
            input_len: spec.input_len,
            output_len: spec.output_len,
            tokens_generated: 0,
            deadline_us: spec.deadline_us,
            output_estimate: (spec.input_len as f64 * expected_output_length_ratio).ceil() as u64,
            route: Vec::new(),
            admitted_us: None,
            history: Vec::new(),
            step_started_us: spec.arrival_us,
            step_history_start: 0,
            hop: 0,
        }
    }

    pub fn is_admitted(&self) -> bool {
        self.admitted_us.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.phase == RequestPhase::Completed
    }

    /// Bind the request to its route.
    pub fn admit(&mut self, route: Vec<MachineId>, now_us: u64) {
        self.route = route;
        self.admitted_us = Some(now_us);
    }

    /// Start a pipeline pass at `now_us`.
    ///
    /// The prompt step is timed from arrival so queueing counts toward it.
    pub fn begin_step(&mut self, now_us: u64) {
        self.step_started_us = match self.phase {
            RequestPhase::Initialization => self.arrival_us,
            _ => now_us,
        };
        self.step_history_start = self.history.len();
        self.hop = 0;
    }

    /// Index of the current machine within the route.
    pub fn hop(&self) -> usize {
        self.hop
    }

    pub fn current_machine(&self) -> Option<MachineId> {
        self.route.get(self.hop).copied()
    }

    pub fn next_machine(&self) -> Option<MachineId> {
        self.route.get(self.hop + 1).copied()
    }

    pub fn advance_hop(&mut self) {
        self.hop += 1;
    }

    pub fn is_last_hop(&self) -> bool {
        self.hop + 1 >= self.route.len()
    }

    /// Append a history entry; timestamps must strictly increase.
    pub fn record(&mut self, location: MachineId, kind: StageKind, at_us: u64) -> Result<(), SimError> {
        if let Some(last) = self.history.last() {
            if at_us <= last.at_us {
                return Err(SimError::Invariant(format!(
                    "request {} history not increasing: {} after {}",
                    self.id, at_us, last.at_us
                )));
            }
        }
        self.history.push(HistoryEntry {
            location,
            kind,
            at_us,
        });
        Ok(())
    }

    /// Close the current step, returning its record.
    pub fn finish_step(&self, now_us: u64) -> StepRecord {
        StepRecord {
            request_id: self.id,
            phase: self.phase,
            token_seq_length: self.token_seq_length,
            started_us: self.step_started_us,
            completed_us: now_us,
            history: self.history[self.step_history_start..].to_vec(),
        }
    }

    /// Move to the next phase after a step completes.
    pub fn advance_phase(&mut self) -> Result<RequestPhase, SimError> {
        self.phase = match self.phase {
            RequestPhase::Initialization if self.output_len == 0 => RequestPhase::Completed,
            RequestPhase::Initialization => RequestPhase::Increment,
            RequestPhase::Increment => {
                self.tokens_generated += 1;
                if self.tokens_generated >= self.output_len {
                    RequestPhase::Completed
                } else {
                    RequestPhase::Increment
                }
            }
            RequestPhase::Completed => {
                return Err(SimError::Invariant(format!(
                    "request {} advanced past completion",
                    self.id
                )))
            }
        };
        if self.phase == RequestPhase::Increment {
            self.token_seq_length = 1;
        }
        Ok(self.phase)
    }
}
