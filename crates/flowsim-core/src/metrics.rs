//! Run analysis and reporting.
//!
//! Each completed pipeline pass is one [`StepRecord`]: prompt steps process
//! the whole input, decode steps exactly one token. Analysis looks at steps
//! completing inside a time window and reports decode throughput and the
//! average prompt/decode latency. Empty windows yield [`Measurement::NoData`].

use crate::clock::us_to_secs;
use crate::registry::RegistryArchive;
use crate::request::{RequestPhase, StepRecord};
use flowsim_scheduler::MachineId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// A computed value, or the absence of anything to compute it from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measurement {
    Value(f64),
    NoData,
}

impl Measurement {
    /// `numerator / denominator`, or `NoData` when the denominator is zero.
    pub fn ratio(numerator: f64, denominator: f64) -> Self {
        if denominator > 0.0 {
            Measurement::Value(numerator / denominator)
        } else {
            Measurement::NoData
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Measurement::Value(v) => Some(*v),
            Measurement::NoData => None,
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Measurement::Value(v) => fmt::Display::fmt(v, f),
            // Precision would truncate the placeholder, so only honor width.
            Measurement::NoData => match f.width() {
                Some(w) => write!(f, "{:>w$}", "n/a", w = w),
                None => f.write_str("n/a"),
            },
        }
    }
}

/// Percentile values for a distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Percentiles {
    /// Compute percentiles, or `None` for an empty slice.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        Some(Self {
            p50: percentile_sorted(&sorted, 50.0),
            p90: percentile_sorted(&sorted, 90.0),
            p99: percentile_sorted(&sorted, 99.0),
            min: sorted[0],
            max: sorted[n - 1],
            mean: sorted.iter().sum::<f64>() / n as f64,
        })
    }
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    let idx = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Periodic telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchSnapshot {
    pub time_us: u64,
    pub flow_value: f64,
    pub kv_occupancy: BTreeMap<MachineId, f64>,
    pub pending_queue_depth: usize,
    pub in_flight: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub window_start_us: u64,
    pub window_end_us: u64,
    /// Decode tokens per second over the window.
    pub decode_throughput: Measurement,
    /// Seconds from arrival to the end of the prompt step.
    pub avg_prompt_latency: Measurement,
    /// Seconds per decode step.
    pub avg_decode_latency: Measurement,
    pub prompt_latency: Option<Percentiles>,
    pub decode_latency: Option<Percentiles>,
    pub prompt_steps: usize,
    pub decode_steps: usize,
    /// Requests finishing inside the window.
    pub completed_requests: usize,
    /// Input plus generated tokens of those requests.
    pub completed_tokens: u64,
    /// Requests dropped at their admission deadline inside the window.
    pub dropped_requests: usize,
}

/// Analyze steps and requests finishing in `[start_us, end_us]`.
pub fn analyze(archive: &RegistryArchive, start_us: u64, end_us: u64) -> AnalysisSummary {
    let in_window = |t: u64| start_us <= t && t <= end_us;
    let steps: Vec<&StepRecord> = archive
        .steps
        .iter()
        .filter(|s| in_window(s.completed_us))
        .collect();

    let prompt: Vec<f64> = steps
        .iter()
        .filter(|s| s.phase == RequestPhase::Initialization)
        .map(|s| us_to_secs(s.latency_us()))
        .collect();
    let decode: Vec<f64> = steps
        .iter()
        .filter(|s| s.phase == RequestPhase::Increment)
        .map(|s| us_to_secs(s.latency_us()))
        .collect();
    let decode_tokens: u64 = steps
        .iter()
        .filter(|s| s.phase == RequestPhase::Increment)
        .map(|s| s.token_seq_length as u64)
        .sum();

    let window_s = us_to_secs(end_us.saturating_sub(start_us));
    let decode_throughput = if steps.is_empty() {
        Measurement::NoData
    } else {
        Measurement::ratio(decode_tokens as f64, window_s)
    };
    if steps.is_empty() {
        warn!(start_us, end_us, "No completed steps in analysis window");
    }

    let (completed_requests, completed_tokens) = archive
        .completed
        .values()
        .filter(|(t, _)| in_window(*t))
        .fold((0usize, 0u64), |(n, tokens), (_, r)| {
            (n + 1, tokens + r.input_len as u64 + r.tokens_generated as u64)
        });
    let dropped_requests = archive
        .dropped
        .values()
        .filter(|d| in_window(d.dropped_us))
        .count();

    AnalysisSummary {
        window_start_us: start_us,
        window_end_us: end_us,
        decode_throughput,
        avg_prompt_latency: Measurement::ratio(prompt.iter().sum(), prompt.len() as f64),
        avg_decode_latency: Measurement::ratio(decode.iter().sum(), decode.len() as f64),
        prompt_latency: Percentiles::from_values(&prompt),
        decode_latency: Percentiles::from_values(&decode),
        prompt_steps: prompt.len(),
        decode_steps: decode.len(),
        completed_requests,
        completed_tokens,
        dropped_requests,
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub name: String,
    pub method: String,
    pub mode: String,
    pub seed: u64,
    /// Max flow of the idle cluster when the run started.
    pub initial_flow_value: f64,
    pub final_flow_value: f64,
    pub events_processed: u64,
    pub summary: AnalysisSummary,
    pub watch: Vec<WatchSnapshot>,
    pub archive: RegistryArchive,
}

/// Format a report as a pretty-printed table string.
pub fn format_table(report: &SimulationReport) -> String {
    let s = &report.summary;
    let mut out = String::new();
    out.push_str(&format!(
        "\n{:=<70}\n",
        format!("  {} / {} ({})  ", report.name, report.method, report.mode)
    ));
    out.push_str(&format!(
        "  Window: {:.1}s - {:.1}s | Max flow: {:.1} tokens/s\n",
        us_to_secs(s.window_start_us),
        us_to_secs(s.window_end_us),
        report.initial_flow_value
    ));
    out.push_str(&format!(
        "  Completed: {} ({} tokens) | Dropped: {} | Unresolved: {}\n",
        s.completed_requests,
        s.completed_tokens,
        s.dropped_requests,
        report.archive.unresolved.len()
    ));
    out.push_str(&format!("{:-<70}\n", "  Throughput  "));
    out.push_str(&format!(
        "  Avg decode speed:   {:.1} tokens/s\n",
        s.decode_throughput
    ));
    out.push_str(&format!("{:-<70}\n", "  Latency  "));
    out.push_str(&format!(
        "  Avg prompt latency: {:.3}s ({} steps)\n",
        s.avg_prompt_latency, s.prompt_steps
    ));
    out.push_str(&format!(
        "  Avg decode latency: {:.3}s ({} steps)\n",
        s.avg_decode_latency, s.decode_steps
    ));
    if let Some(p) = &s.prompt_latency {
        out.push_str(&format!(
            "  Prompt (s)   P50={:>8.3}  P90={:>8.3}  P99={:>8.3}\n",
            p.p50, p.p90, p.p99
        ));
    }
    if let Some(p) = &s.decode_latency {
        out.push_str(&format!(
            "  Decode (s)   P50={:>8.3}  P90={:>8.3}  P99={:>8.3}\n",
            p.p50, p.p90, p.p99
        ));
    }
    out.push_str(&format!("{:=<70}\n", ""));
    out
}

/// Format a comparison table of several runs.
pub fn format_comparison_table(results: &[SimulationReport]) -> String {
    if results.is_empty() {
        return String::from("No results to compare.\n");
    }

    let mut out = String::new();
    out.push_str(&format!("\n{:=<86}\n", "  Scheduler Comparison  "));
    out.push_str(&format!(
        "{:<24} {:>10} {:>12} {:>12} {:>10} {:>8}\n",
        "Method", "Decode/s", "Prompt (s)", "Decode (s)", "Tokens", "Dropped"
    ));
    out.push_str(&format!("{:-<86}\n", ""));
    for r in results {
        let s = &r.summary;
        out.push_str(&format!(
            "{:<24} {:>10.1} {:>12.3} {:>12.4} {:>10} {:>8}\n",
            format!("{} ({})", r.method, r.mode),
            s.decode_throughput,
            s.avg_prompt_latency,
            s.avg_decode_latency,
            s.completed_tokens,
            s.dropped_requests,
        ));
    }
    out.push_str(&format!("{:=<86}\n", ""));
    out
}
