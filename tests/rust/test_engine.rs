/// Integration tests for the simulation engine.
use flowsim_core::config::SimConfig;
use flowsim_core::request::{ArrivalSpec, StageKind};
use flowsim_core::{Measurement, SimulationEngine};
use flowsim_scheduler::{RequestId, SchedulingMethod, SchedulingMode};

/// Two pipeline stages with two replicas each, fed by Poisson arrivals.
fn production_config() -> SimConfig {
    SimConfig::from_str(
        r#"
[simulation]
name = "integration-test"
seed = 42
warm_up_s = 2
duration_s = 20
watch_interval_s = 5

[model]
num_layers = 8

[scheduler]
method = "max_flow"
mode = "online"
kv_hwm = 0.85

[placement]
finish_loading_time_s = 1.0

[[placement.machines]]
id = 0
hardware = "A100"
throughput = 400
kv_capacity = 4000
layers = [0, 4]

[[placement.machines]]
id = 1
hardware = "L4"
throughput = 200
kv_capacity = 2000
layers = [0, 4]

[[placement.machines]]
id = 2
hardware = "A100"
throughput = 400
kv_capacity = 4000
layers = [4, 8]

[[placement.machines]]
id = 3
hardware = "T4"
throughput = 150
kv_capacity = 1500
layers = [4, 8]

[[placement.links]]
from = 0
to = 2
latency_s = 0.002

[[placement.links]]
from = 0
to = 3
latency_s = 0.003

[[placement.links]]
from = 1
to = 2
latency_s = 0.002

[[placement.links]]
from = 1
to = 3
latency_s = 0.002

[feeder]
kind = "online"
rate = 5
input_len_mean = 32
input_len_std = 8
output_len_mean = 4
output_len_std = 2
"#,
    )
    .unwrap()
}

fn single_machine_config(kv_hwm: f64) -> SimConfig {
    SimConfig::from_str(&format!(
        r#"
[simulation]
duration_s = 30
watch_interval_s = 1

[model]
num_layers = 2

[scheduler]
kv_hwm = {}

[placement]
[[placement.machines]]
id = 0
throughput = 10
kv_capacity = 100
layers = [0, 2]
"#,
        kv_hwm
    ))
    .unwrap()
}

fn arrival(id: u64, arrival_us: u64, input_len: u32, output_len: u32) -> ArrivalSpec {
    ArrivalSpec {
        request_id: RequestId(id),
        arrival_us,
        input_len,
        output_len,
        deadline_us: None,
    }
}

#[test]
fn test_full_simulation_max_flow() {
    let report = flowsim_core::run_simulation(production_config()).unwrap();

    assert_eq!(report.method, "max_flow");
    assert_eq!(report.mode, "online");
    assert!(report.initial_flow_value > 0.0);
    assert!(report.summary.completed_requests > 0);
    assert!(report.summary.prompt_steps > 0);
    assert!(matches!(
        report.summary.decode_throughput,
        Measurement::Value(v) if v > 0.0
    ));
    assert!(report.summary.avg_prompt_latency.value().unwrap() > 0.0);
    assert!(report.summary.avg_decode_latency.value().unwrap() > 0.0);
    assert!(report.archive.dropped.is_empty());
}

#[test]
fn test_full_simulation_all_methods() {
    let config = production_config();
    let results = flowsim_core::compare_methods(&config, &SchedulingMethod::ALL).unwrap();

    assert_eq!(results.len(), 3);
    for (report, method) in results.iter().zip(SchedulingMethod::ALL) {
        assert_eq!(report.method, method.as_str());
        assert!(
            report.summary.completed_requests > 0,
            "Method {} produced no completed requests",
            method
        );
    }
}

#[test]
fn test_runs_are_deterministic() {
    for method in SchedulingMethod::ALL {
        let mut config = production_config();
        config.scheduler.method = method;
        let a = flowsim_core::run_simulation(config.clone()).unwrap();
        let b = flowsim_core::run_simulation(config).unwrap();

        let json_a = serde_json::to_string(&a.archive.completed).unwrap();
        let json_b = serde_json::to_string(&b.archive.completed).unwrap();
        assert_eq!(json_a, json_b, "method {} is not deterministic", method);
        assert_eq!(a.events_processed, b.events_processed);
        assert_eq!(
            serde_json::to_string(&a.watch).unwrap(),
            serde_json::to_string(&b.watch).unwrap()
        );
    }
}

#[test]
fn test_histories_strictly_increase() {
    let report = flowsim_core::run_simulation(production_config()).unwrap();
    for (done_us, request) in report.archive.completed.values() {
        assert!(!request.history.is_empty());
        assert!(
            request.history.windows(2).all(|w| w[0].at_us < w[1].at_us),
            "request {} history is not strictly increasing",
            request.id
        );
        let last = request.history.last().unwrap();
        assert_eq!(last.at_us, *done_us);
        assert_eq!(last.kind, StageKind::Compute);
    }
    for step in &report.archive.steps {
        assert!(step.started_us < step.completed_us);
    }
}

#[test]
fn test_routes_follow_the_pipeline() {
    let report = flowsim_core::run_simulation(production_config()).unwrap();
    for (_, request) in report.archive.completed.values() {
        assert_eq!(request.route.len(), 2);
        assert!(request.route[0].0 <= 1);
        assert!(request.route[1].0 >= 2);
    }
}

#[test]
fn test_run_starts_after_loading() {
    let report = flowsim_core::run_simulation(production_config()).unwrap();
    // Placement finishes at 1 s, warm-up is 2 s.
    assert_eq!(report.summary.window_start_us, 3_000_000);
    assert_eq!(report.summary.window_end_us, 23_000_000);
    assert!(report
        .archive
        .steps
        .iter()
        .all(|s| s.started_us >= 1_000_000));
    let ticks: Vec<u64> = report.watch.iter().map(|w| w.time_us).collect();
    assert_eq!(
        ticks,
        vec![3_000_000, 8_000_000, 13_000_000, 18_000_000, 23_000_000]
    );
}

#[test]
fn test_deadline_drops_queued_request() {
    let config = single_machine_config(0.5);
    let mut late = arrival(1, 100_000, 10, 1);
    late.deadline_us = Some(600_000);
    // The first request fills half the KV cache and computes for 5 s.
    let report =
        flowsim_core::run_with_arrivals(config, vec![arrival(0, 0, 50, 1), late]).unwrap();

    let dropped = &report.archive.dropped[&RequestId(1)];
    assert_eq!(dropped.dropped_us, 600_000);
    assert!(!dropped.request.is_admitted());
    assert_eq!(report.summary.dropped_requests, 1);
    assert!(report.archive.completed.contains_key(&RequestId(0)));
}

#[test]
fn test_deadline_ignored_once_admitted() {
    let config = single_machine_config(1.0);
    let mut first = arrival(0, 0, 10, 2);
    first.deadline_us = Some(1_000);
    let report = flowsim_core::run_with_arrivals(config, vec![first]).unwrap();
    assert!(report.archive.dropped.is_empty());
    assert!(report.archive.completed.contains_key(&RequestId(0)));
}

#[test]
fn test_unresolved_requests_reported() {
    let mut config = single_machine_config(1.0);
    config.simulation.duration_s = 1.0;
    // 100 prompt tokens at 10 tok/s cannot finish within 1 s.
    let report = flowsim_core::run_with_arrivals(config, vec![arrival(0, 0, 100, 4)]).unwrap();
    assert!(report.archive.completed.is_empty());
    assert_eq!(report.archive.unresolved, vec![RequestId(0)]);
    assert_eq!(report.summary.decode_throughput, Measurement::NoData);
}

#[test]
fn test_offline_mode_rebatches_and_completes() {
    let mut config = production_config();
    config.scheduler.mode = SchedulingMode::Offline;
    config.scheduler.rebatch_interval_s = 2.0;
    let report = flowsim_core::run_simulation(config).unwrap();
    assert_eq!(report.mode, "offline");
    assert!(report.summary.completed_requests > 0);
}

#[test]
fn test_engine_exposes_scheduler_state() {
    let config = single_machine_config(1.0);
    let engine = SimulationEngine::new(
        config,
        Box::new(flowsim_core::TraceFeeder::new(Vec::new())),
    )
    .unwrap();
    assert_eq!(engine.scheduler().flow_value(), 10.0);
    assert_eq!(
        engine.scheduler().machine_capacity(flowsim_scheduler::MachineId(0)),
        10.0
    );
    assert_eq!(engine.pending_events(), 0);
}

#[test]
fn test_sample_config_loads() {
    let path =
        std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/two_stage.toml");
    let config = SimConfig::from_file(&path).unwrap();
    let cluster = config.build_cluster().unwrap();
    assert_eq!(cluster.num_machines(), 4);
    assert_eq!(config.start_us(), 30_000_000);
    assert!(config.build_feeder().is_ok());
}
