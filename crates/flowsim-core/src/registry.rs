//! Request lifecycle bookkeeping.
//!
//! The [`RequestRegistry`] owns every request of a run: live requests (pending
//! admission or in flight), the archive of completed requests, requests
//! dropped at their admission deadline, and the per-step log used for
//! analysis. It is created with the engine and drained into the run report.

use crate::engine::SimError;
use crate::request::{Request, StepRecord};
use flowsim_scheduler::RequestId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// A request that timed out before admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedRecord {
    pub dropped_us: u64,
    pub request: Request,
}

/// Everything the registry held at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryArchive {
    pub completed: BTreeMap<RequestId, (u64, Request)>,
    pub dropped: BTreeMap<RequestId, DroppedRecord>,
    pub steps: Vec<StepRecord>,
    /// Requests still pending or in flight when the run stopped.
    pub unresolved: Vec<RequestId>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestRegistry {
    live: BTreeMap<RequestId, Request>,
    pending: VecDeque<RequestId>,
    completed: BTreeMap<RequestId, (u64, Request)>,
    dropped: BTreeMap<RequestId, DroppedRecord>,
    steps: Vec<StepRecord>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly arrived request.
    pub fn insert(&mut self, request: Request) -> Result<(), SimError> {
        let id = request.id;
        if self.live.contains_key(&id)
            || self.completed.contains_key(&id)
            || self.dropped.contains_key(&id)
        {
            return Err(SimError::DuplicateRequest(id));
        }
        self.live.insert(id, request);
        Ok(())
    }

    pub fn get(&self, id: RequestId) -> Option<&Request> {
        self.live.get(&id)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Result<&mut Request, SimError> {
        self.live.get_mut(&id).ok_or(SimError::UnknownRequest(id))
    }

    /// Queue a request behind earlier pending ones.
    pub fn enqueue_pending(&mut self, id: RequestId) {
        self.pending.push_back(id);
    }

    /// Pending requests in arrival order.
    pub fn pending_ids(&self) -> Vec<RequestId> {
        self.pending.iter().copied().collect()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.pending.contains(&id)
    }

    pub fn remove_pending(&mut self, id: RequestId) -> bool {
        match self.pending.iter().position(|p| *p == id) {
            Some(idx) => {
                self.pending.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Admitted requests not yet completed.
    pub fn in_flight(&self) -> usize {
        self.live.len() - self.pending.len()
    }

    pub fn record_step(&mut self, step: StepRecord) {
        self.steps.push(step);
    }

    /// Archive a finished request.
    pub fn complete(&mut self, id: RequestId, now_us: u64) -> Result<(), SimError> {
        let request = self.live.remove(&id).ok_or(SimError::UnknownRequest(id))?;
        if !request.is_completed() {
            return Err(SimError::Invariant(format!(
                "request {} archived in phase {:?}",
                id, request.phase
            )));
        }
        self.completed.insert(id, (now_us, request));
        Ok(())
    }

    /// Fail a pending request with an admission timeout.
    pub fn drop_request(&mut self, id: RequestId, now_us: u64) -> Result<(), SimError> {
        if !self.remove_pending(id) {
            return Err(SimError::Invariant(format!(
                "request {} dropped while not pending",
                id
            )));
        }
        let request = self.live.remove(&id).ok_or(SimError::UnknownRequest(id))?;
        self.dropped.insert(
            id,
            DroppedRecord {
                dropped_us: now_us,
                request,
            },
        );
        Ok(())
    }

    pub fn completed(&self) -> &BTreeMap<RequestId, (u64, Request)> {
        &self.completed
    }

    pub fn dropped(&self) -> &BTreeMap<RequestId, DroppedRecord> {
        &self.dropped
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// Move everything out, leaving the registry empty.
    pub fn drain(&mut self) -> RegistryArchive {
        let unresolved = self.live.keys().copied().collect();
        self.live.clear();
        self.pending.clear();
        RegistryArchive {
            completed: std::mem::take(&mut self.completed),
            dropped: std::mem::take(&mut self.dropped),
            steps: std::mem::take(&mut self.steps),
            unresolved,
        }
    }
}
