//! Request feeders.
//!
//! A feeder decides when requests arrive. The engine asks it for the initial
//! arrivals when a run starts and again after every completed request, so a
//! feeder can either pre-generate a whole schedule ([`OnlineFeeder`],
//! [`TraceFeeder`]) or react to cluster load ([`OfflineFeeder`]).

use crate::clock::secs_to_us;
use crate::request::ArrivalSpec;
use flowsim_scheduler::RequestId;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeederError {
    #[error("Arrival rate must be positive, got {0}")]
    InvalidRate(f64),
    #[error("Invalid length distribution: {0}")]
    InvalidLength(String),
    #[error("Feed high-water-mark must be in (0, 1], got {0}")]
    InvalidFeedHwm(f64),
}

/// Cluster state visible to a feeder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeederView {
    pub now_us: u64,
    pub stop_us: u64,
    pub mean_kv_occupancy: f64,
    pub pending: usize,
    pub in_flight: usize,
    /// Requests completed or dropped so far.
    pub resolved: usize,
}

pub trait RequestFeeder {
    /// Arrivals scheduled when the run starts.
    fn initial_arrivals(&mut self, view: &FeederView) -> Vec<ArrivalSpec>;

    /// Arrivals triggered by a request completing.
    fn on_completion(&mut self, _view: &FeederView) -> Vec<ArrivalSpec> {
        Vec::new()
    }

    fn name(&self) -> &str;
}

/// Token lengths drawn uniformly from `mean ± std`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LengthDistribution {
    pub mean: f64,
    pub std: f64,
    /// Floor applied after sampling.
    pub min: u32,
}

impl LengthDistribution {
    pub fn fixed(len: u32) -> Self {
        Self {
            mean: len as f64,
            std: 0.0,
            min: 0,
        }
    }

    pub fn validate(&self) -> Result<(), FeederError> {
        if !(self.mean.is_finite() && self.mean >= 0.0) {
            return Err(FeederError::InvalidLength(format!("mean {}", self.mean)));
        }
        if !(self.std.is_finite() && self.std >= 0.0) {
            return Err(FeederError::InvalidLength(format!("std {}", self.std)));
        }
        Ok(())
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> u32 {
        let value = if self.std > 0.0 {
            rng.gen_range((self.mean - self.std)..=(self.mean + self.std))
        } else {
            self.mean
        };
        (value.round().max(0.0) as u32).max(self.min)
    }
}

/// Shared request generation for the synthetic feeders.
#[derive(Debug, Clone)]
struct RequestSampler {
    input: LengthDistribution,
    output: LengthDistribution,
    deadline_s: Option<f64>,
    rng: ChaCha8Rng,
    next_id: u64,
}

impl RequestSampler {
    fn new(
        input: LengthDistribution,
        output: LengthDistribution,
        deadline_s: Option<f64>,
        seed: u64,
    ) -> Result<Self, FeederError> {
        input.validate()?;
        output.validate()?;
        Ok(Self {
            input,
            output,
            deadline_s,
            rng: ChaCha8Rng::seed_from_u64(seed),
            next_id: 0,
        })
    }

    fn arrival(&mut self, arrival_us: u64) -> ArrivalSpec {
        let request_id = RequestId(self.next_id);
        self.next_id += 1;
        ArrivalSpec {
            request_id,
            arrival_us,
            input_len: self.input.sample(&mut self.rng).max(1),
            output_len: self.output.sample(&mut self.rng),
            deadline_us: self.deadline_s.map(|d| arrival_us + secs_to_us(d)),
        }
    }
}

/// Replays a fixed list of arrivals.
#[derive(Debug, Clone)]
pub struct TraceFeeder {
    arrivals: Vec<ArrivalSpec>,
}

impl TraceFeeder {
    pub fn new(arrivals: Vec<ArrivalSpec>) -> Self {
        Self { arrivals }
    }
}

impl RequestFeeder for TraceFeeder {
    fn initial_arrivals(&mut self, _view: &FeederView) -> Vec<ArrivalSpec> {
        std::mem::take(&mut self.arrivals)
    }

    fn name(&self) -> &str {
        "trace"
    }
}

/// Poisson arrivals at a fixed rate, generated up front.
#[derive(Debug, Clone)]
pub struct OnlineFeeder {
    gaps: Exp<f64>,
    sampler: RequestSampler,
}

impl OnlineFeeder {
    pub fn new(
        rate: f64,
        input: LengthDistribution,
        output: LengthDistribution,
        deadline_s: Option<f64>,
        seed: u64,
    ) -> Result<Self, FeederError> {
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(FeederError::InvalidRate(rate));
        }
        let gaps = Exp::new(rate).map_err(|_| FeederError::InvalidRate(rate))?;
        Ok(Self {
            gaps,
            sampler: RequestSampler::new(input, output, deadline_s, seed)?,
        })
    }
}

impl RequestFeeder for OnlineFeeder {
    fn initial_arrivals(&mut self, view: &FeederView) -> Vec<ArrivalSpec> {
        let mut arrivals = Vec::new();
        let mut t_us = view.now_us;
        loop {
            let gap = self.gaps.sample(&mut self.sampler.rng);
            t_us += secs_to_us(gap).max(1);
            if t_us > view.stop_us {
                break;
            }
            arrivals.push(self.sampler.arrival(t_us));
        }
        arrivals
    }

    fn name(&self) -> &str {
        "online"
    }
}

/// Keeps the cluster loaded: an initial burst, then on every completion as
/// many new requests as it takes to bring projected mean KV occupancy up to
/// `feed_hwm`.
///
/// Requests issued but not yet admitted count toward the projection at the
/// occupancy an admitted request was last seen to hold.
#[derive(Debug, Clone)]
pub struct OfflineFeeder {
    initial_count: usize,
    feed_hwm: f64,
    sampler: RequestSampler,
    issued: usize,
    occupancy_per_request: Option<f64>,
}

impl OfflineFeeder {
    pub fn new(
        initial_count: usize,
        feed_hwm: f64,
        input: LengthDistribution,
        output: LengthDistribution,
        deadline_s: Option<f64>,
        seed: u64,
    ) -> Result<Self, FeederError> {
        if !(feed_hwm > 0.0 && feed_hwm <= 1.0) {
            return Err(FeederError::InvalidFeedHwm(feed_hwm));
        }
        Ok(Self {
            initial_count,
            feed_hwm,
            sampler: RequestSampler::new(input, output, deadline_s, seed)?,
            issued: 0,
            occupancy_per_request: None,
        })
    }

    fn issue(&mut self, now_us: u64) -> ArrivalSpec {
        self.issued += 1;
        self.sampler.arrival(now_us)
    }
}

impl RequestFeeder for OfflineFeeder {
    fn initial_arrivals(&mut self, view: &FeederView) -> Vec<ArrivalSpec> {
        (0..self.initial_count)
            .map(|_| self.issue(view.now_us))
            .collect()
    }

    fn on_completion(&mut self, view: &FeederView) -> Vec<ArrivalSpec> {
        if view.now_us >= view.stop_us {
            return Vec::new();
        }
        if view.in_flight > 0 && view.mean_kv_occupancy > 0.0 {
            self.occupancy_per_request = Some(view.mean_kv_occupancy / view.in_flight as f64);
        }

        let Some(per_request) = self.occupancy_per_request else {
            // Nothing observed yet: feed one at a time.
            return if view.mean_kv_occupancy < self.feed_hwm {
                vec![self.issue(view.now_us)]
            } else {
                Vec::new()
            };
        };

        // Issued but not yet admitted, including arrivals still in transit.
        let waiting = self.issued.saturating_sub(view.resolved + view.in_flight);
        let mut projected = view.mean_kv_occupancy + waiting as f64 * per_request;
        let mut arrivals = Vec::new();
        while projected < self.feed_hwm {
            arrivals.push(self.issue(view.now_us));
            projected += per_request;
        }
        arrivals
    }

    fn name(&self) -> &str {
        "offline"
    }
}
