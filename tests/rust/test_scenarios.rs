/// End-to-end scenarios for admission, backpressure, and scheduling modes.
use flowsim_core::config::SimConfig;
use flowsim_core::request::ArrivalSpec;
use flowsim_scheduler::{
    ClusterBuilder, GlobalScheduler, HardwareType, KvParameters, MachineId, RequestId,
    RouteRequest, RoutingDecision, SchedulerConfig, SchedulingMode,
};

fn single_machine(kv_hwm: f64, duration_s: f64) -> SimConfig {
    SimConfig::from_str(&format!(
        r#"
[simulation]
name = "scenario"
duration_s = {}
watch_interval_s = 1

[model]
num_layers = 1

[scheduler]
kv_hwm = {}

[placement]
[[placement.machines]]
id = 0
throughput = 10
kv_capacity = 100
layers = [0, 1]
"#,
        duration_s, kv_hwm
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
fn test_single_machine_serves_five_requests() {
    let arrivals = (0..5).map(|i| arrival(i, 0, 1, 0)).collect();
    let report = flowsim_core::run_with_arrivals(single_machine(1.0, 5.0), arrivals).unwrap();

    assert_eq!(report.initial_flow_value, 10.0);
    assert_eq!(report.archive.completed.len(), 5);
    for (done_us, request) in report.archive.completed.values() {
        assert!(*done_us <= 1_000_000, "{} finished at {}", request.id, done_us);
        assert_eq!(request.route, vec![MachineId(0)]);
    }
    assert!(report.archive.unresolved.is_empty());
}

#[test]
fn test_backpressure_until_release() {
    // Request 0 reserves half of the KV cache; request 1 must wait for it.
    let arrivals = vec![arrival(0, 0, 50, 2), arrival(1, 1_000_000, 10, 0)];
    let report = flowsim_core::run_with_arrivals(single_machine(0.5, 30.0), arrivals).unwrap();

    let (first_done, _) = report.archive.completed[&RequestId(0)];
    let (_, second) = &report.archive.completed[&RequestId(1)];
    assert_eq!(second.admitted_us, Some(first_done));
    assert!(first_done > 5_000_000);

    let queued_at_two = report.watch.iter().find(|w| w.time_us == 2_000_000).unwrap();
    assert_eq!(queued_at_two.pending_queue_depth, 1);
    assert_eq!(queued_at_two.in_flight, 1);
    assert_eq!(queued_at_two.kv_occupancy[&MachineId(0)], 0.5);
}

#[test]
fn test_backpressure_at_scheduler_level() {
    let cluster = ClusterBuilder::new(1)
        .machine(0, HardwareType::A100, 10.0, 100, (0, 1))
        .build()
        .unwrap();
    let config = SchedulerConfig {
        kv: KvParameters {
            expected_kv_hwm: 0.5,
            expected_output_length_ratio: 1.0,
        },
        ..Default::default()
    };
    let mut scheduler = GlobalScheduler::new(cluster, config);
    let long = RouteRequest {
        id: RequestId(0),
        token_count: 50,
    };
    let short = RouteRequest {
        id: RequestId(1),
        token_count: 10,
    };

    assert!(matches!(
        scheduler.route(&long).unwrap(),
        RoutingDecision::Admit(_)
    ));
    assert_eq!(scheduler.route(&short).unwrap(), RoutingDecision::Queue);
    // Clipped down to the committed flow.
    assert_eq!(scheduler.machine_capacity(MachineId(0)), 1.0);

    scheduler.release(RequestId(0)).unwrap();
    assert_eq!(scheduler.machine_capacity(MachineId(0)), 10.0);
    assert!(matches!(
        scheduler.route(&short).unwrap(),
        RoutingDecision::Admit(_)
    ));
    scheduler.check_invariants().unwrap();
}

fn pipeline(mode: &str) -> SimConfig {
    SimConfig::from_str(&format!(
        r#"
[simulation]
name = "parity"
duration_s = 120

[model]
num_layers = 4

[scheduler]
mode = "{}"
kv_hwm = 0.8
rebatch_interval_s = 1

[placement]
[[placement.machines]]
id = 0
throughput = 60
kv_capacity = 400
layers = [0, 2]

[[placement.machines]]
id = 1
throughput = 40
kv_capacity = 300
layers = [0, 2]

[[placement.machines]]
id = 2
throughput = 80
kv_capacity = 500
layers = [2, 4]

[[placement.links]]
from = 0
to = 2
latency_s = 0.002

[[placement.links]]
from = 1
to = 2
latency_s = 0.004
"#,
        mode
    ))
    .unwrap()
}

#[test]
fn test_offline_and_online_complete_same_tokens() {
    let arrivals: Vec<ArrivalSpec> = (0..30)
        .map(|i| arrival(i, i * 100_000, 16 + (i % 4) as u32 * 4, 3 + (i % 3) as u32))
        .collect();
    let expected: u64 = arrivals
        .iter()
        .map(|a| a.input_len as u64 + a.output_len as u64)
        .sum();

    let online = flowsim_core::run_with_arrivals(pipeline("online"), arrivals.clone()).unwrap();
    let offline = flowsim_core::run_with_arrivals(pipeline("offline"), arrivals).unwrap();

    assert_eq!(online.mode, SchedulingMode::Online.as_str());
    assert_eq!(offline.mode, SchedulingMode::Offline.as_str());
    assert_eq!(online.summary.completed_requests, 30);
    assert_eq!(offline.summary.completed_requests, 30);
    assert_eq!(online.summary.completed_tokens, expected);
    assert_eq!(offline.summary.completed_tokens, expected);
}

#[test]
fn test_offline_feeder_keeps_cluster_loaded() {
    let mut config = pipeline("offline");
    config.simulation.duration_s = 20.0;
    config.simulation.watch_interval_s = Some(1.0);
    config.feeder = Some(
        toml::from_str(
            r#"
kind = "offline"
initial_count = 5
feed_hwm = 0.5
input_len_mean = 16
output_len_mean = 4
"#,
        )
        .unwrap(),
    );
    let report = flowsim_core::run_simulation(config).unwrap();
    assert!(report.summary.completed_requests > 5);
    assert!(report.archive.dropped.is_empty());
    let max_live = report
        .watch
        .iter()
        .map(|w| w.in_flight + w.pending_queue_depth)
        .max()
        .unwrap();
    assert!(max_live > 10, "load never grew past {}", max_live);
}

#[test]
fn test_offline_feeder_fills_kv_to_feed_mark() {
    let mut config = SimConfig::from_str(
        r#"
[simulation]
name = "offline-fill"
duration_s = 60
watch_interval_s = 1

[model]
num_layers = 1

[scheduler]
kv_hwm = 0.9

[placement]
[[placement.machines]]
id = 0
throughput = 1000
kv_capacity = 10000
layers = [0, 1]
"#,
    )
    .unwrap();
    config.feeder = Some(
        toml::from_str(
            r#"
kind = "offline"
initial_count = 2
feed_hwm = 0.8
input_len_mean = 16
output_len_mean = 4
"#,
        )
        .unwrap(),
    );
    let report = flowsim_core::run_simulation(config).unwrap();

    let max_live = report
        .watch
        .iter()
        .map(|w| w.in_flight + w.pending_queue_depth)
        .max()
        .unwrap();
    let max_occupancy = report
        .watch
        .iter()
        .map(|w| w.kv_occupancy[&MachineId(0)])
        .fold(0.0, f64::max);
    // Each request holds 16 of 10000 tokens, so the mark needs hundreds live.
    assert!(max_live >= 100, "max live {}", max_live);
    assert!(max_occupancy > 0.5, "max occupancy {}", max_occupancy);
    assert!(max_occupancy <= 0.9);
    assert!(report.summary.completed_requests > 2);
}
