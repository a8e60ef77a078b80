//! KV cache admission control.
//!
//! Tracks, per machine, how many KV tokens are reserved by admitted requests.
//! A request reserves `ceil(token_count * expected_output_length_ratio)`
//! tokens on every machine of its route when it is admitted, and releases
//! them when it completes. Once a machine's occupancy reaches its
//! high-water-mark, its compute capacity is clipped so the flow solver stops
//! sending new work there.

use crate::cluster::{ClusterModel, MachineId};
use crate::scheduler::SchedulerError;
use crate::traits::RequestId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Admission parameters shared by every machine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KvParameters {
    /// Occupancy fraction at which a machine stops admitting (0, 1].
    pub expected_kv_hwm: f64,
    /// Multiplier applied to a request's token count to forecast its
    /// footprint over all of its future decode steps.
    pub expected_output_length_ratio: f64,
}

impl Default for KvParameters {
    fn default() -> Self {
        Self {
            expected_kv_hwm: 0.85,
            expected_output_length_ratio: 1.0,
        }
    }
}

/// KV state of one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineKvState {
    pub capacity: u64,
    pub reserved: u64,
    pub high_water_mark: f64,
}

impl MachineKvState {
    pub fn free(&self) -> u64 {
        self.capacity.saturating_sub(self.reserved)
    }

    /// Occupied fraction in [0, 1].
    pub fn occupancy(&self) -> f64 {
        self.reserved as f64 / self.capacity as f64
    }

    /// Largest reservation total the high-water-mark allows.
    pub fn admission_limit(&self) -> u64 {
        ((self.high_water_mark * self.capacity as f64) + 1e-9).floor() as u64
    }

    pub fn is_clipped(&self) -> bool {
        self.occupancy() + 1e-12 >= self.high_water_mark
    }

    pub fn fits(&self, footprint: u64) -> bool {
        self.reserved + footprint <= self.admission_limit().min(self.capacity)
    }

    /// Clipping factor applied to raw throughput.
    pub fn clip(&self) -> f64 {
        if self.is_clipped() {
            0.0
        } else {
            1.0
        }
    }
}

/// A live reservation held by one admitted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub machines: Vec<MachineId>,
    pub footprint: u64,
}

/// Per-machine KV admission state for the whole cluster.
#[derive(Debug, Clone)]
pub struct KvCacheTracker {
    params: KvParameters,
    machines: BTreeMap<MachineId, MachineKvState>,
    reservations: BTreeMap<RequestId, Reservation>,
}

impl KvCacheTracker {
    pub fn new(cluster: &ClusterModel, params: KvParameters) -> Self {
        let machines = cluster
            .machines()
            .map(|m| {
                (
                    m.id,
                    MachineKvState {
                        capacity: m.kv_capacity,
                        reserved: 0,
                        high_water_mark: params.expected_kv_hwm,
                    },
                )
            })
            .collect();
        Self {
            params,
            machines,
            reservations: BTreeMap::new(),
        }
    }

    pub fn params(&self) -> KvParameters {
        self.params
    }

    /// Forecast footprint of a request with `token_count` tokens.
    pub fn footprint(&self, token_count: u32) -> u64 {
        let forecast = (token_count as f64 * self.params.expected_output_length_ratio).ceil();
        (forecast as u64).max(1)
    }

    pub fn state(&self, machine: MachineId) -> Option<&MachineKvState> {
        self.machines.get(&machine)
    }

    pub fn occupancy(&self, machine: MachineId) -> f64 {
        self.machines
            .get(&machine)
            .map(|s| s.occupancy())
            .unwrap_or(0.0)
    }

    /// Occupancy of every machine, ordered by id.
    pub fn occupancies(&self) -> BTreeMap<MachineId, f64> {
        self.machines
            .iter()
            .map(|(id, s)| (*id, s.occupancy()))
            .collect()
    }

    pub fn mean_occupancy(&self) -> f64 {
        if self.machines.is_empty() {
            return 0.0;
        }
        self.machines.values().map(|s| s.occupancy()).sum::<f64>() / self.machines.len() as f64
    }

    pub fn is_clipped(&self, machine: MachineId) -> bool {
        self.machines
            .get(&machine)
            .is_some_and(|s| s.is_clipped())
    }

    pub fn fits(&self, machine: MachineId, footprint: u64) -> bool {
        self.machines
            .get(&machine)
            .is_some_and(|s| s.fits(footprint))
    }

    /// Throughput after KV clipping.
    pub fn effective_capacity(&self, machine: MachineId, raw_throughput: f64) -> f64 {
        self.machines
            .get(&machine)
            .map(|s| raw_throughput * s.clip())
            .unwrap_or(0.0)
    }

    /// Override one machine's high-water-mark.
    pub fn set_high_water_mark(
        &mut self,
        machine: MachineId,
        high_water_mark: f64,
    ) -> Result<(), SchedulerError> {
        if !(high_water_mark > 0.0 && high_water_mark <= 1.0) {
            return Err(SchedulerError::InvalidHighWaterMark(high_water_mark));
        }
        let state = self
            .machines
            .get_mut(&machine)
            .ok_or(SchedulerError::UnknownMachine(machine))?;
        state.high_water_mark = high_water_mark;
        Ok(())
    }

    pub fn is_reserved(&self, request: RequestId) -> bool {
        self.reservations.contains_key(&request)
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Reserve `footprint` tokens on every machine in `machines`.
    ///
    /// Either every machine is charged or none is.
    pub fn reserve(
        &mut self,
        request: RequestId,
        machines: &[MachineId],
        footprint: u64,
    ) -> Result<(), SchedulerError> {
        if self.reservations.contains_key(&request) {
            return Err(SchedulerError::InvariantViolation(format!(
                "request {} already holds a KV reservation",
                request
            )));
        }
        for machine in machines {
            let state = self
                .machines
                .get(machine)
                .ok_or(SchedulerError::UnknownMachine(*machine))?;
            if state.reserved + footprint > state.capacity {
                return Err(SchedulerError::InvariantViolation(format!(
                    "reserving {} tokens on {} would exceed capacity {} (reserved {})",
                    footprint, machine, state.capacity, state.reserved
                )));
            }
        }
        for machine in machines {
            if let Some(state) = self.machines.get_mut(machine) {
                state.reserved += footprint;
            }
        }
        self.reservations.insert(
            request,
            Reservation {
                machines: machines.to_vec(),
                footprint,
            },
        );
        Ok(())
    }

    /// Release the reservation held by `request`.
    pub fn release(&mut self, request: RequestId) -> Result<Reservation, SchedulerError> {
        let reservation = self.reservations.remove(&request).ok_or_else(|| {
            SchedulerError::InvariantViolation(format!(
                "request {} has no KV reservation to release",
                request
            ))
        })?;
        for machine in &reservation.machines {
            let state = self
                .machines
                .get_mut(machine)
                .ok_or(SchedulerError::UnknownMachine(*machine))?;
            if state.reserved < reservation.footprint {
                return Err(SchedulerError::InvariantViolation(format!(
                    "releasing {} tokens on {} but only {} reserved",
                    reservation.footprint, machine, state.reserved
                )));
            }
            state.reserved -= reservation.footprint;
        }
        Ok(reservation)
    }

    /// Verify `reserved + free == capacity` and that per-machine totals match
    /// the live reservations.
    pub fn check_invariants(&self) -> Result<(), SchedulerError> {
        let mut expected: BTreeMap<MachineId, u64> = BTreeMap::new();
        for reservation in self.reservations.values() {
            for machine in &reservation.machines {
                *expected.entry(*machine).or_default() += reservation.footprint;
            }
        }
        for (id, state) in &self.machines {
            if state.reserved > state.capacity {
                return Err(SchedulerError::InvariantViolation(format!(
                    "{} over-reserved: {} > {}",
                    id, state.reserved, state.capacity
                )));
            }
            if state.reserved + state.free() != state.capacity {
                return Err(SchedulerError::InvariantViolation(format!(
                    "{} reserved + free != capacity",
                    id
                )));
            }
            let live = expected.get(id).copied().unwrap_or(0);
            if live != state.reserved {
                return Err(SchedulerError::InvariantViolation(format!(
                    "{} reserves {} tokens but live reservations total {}",
                    id, state.reserved, live
                )));
            }
        }
        Ok(())
    }
}
