/// Integration tests for the capacity network and the global scheduler.
use flowsim_scheduler::flow_graph::{EdgeKind, SINK, SOURCE};
use flowsim_scheduler::*;

/// Three stages: two fast and one slow replica each, fully linked.
fn three_stage_cluster() -> ClusterModel {
    let mut builder = ClusterBuilder::new(6);
    for stage in 0..3u32 {
        for (r, tp) in [(0u32, 30.0), (1, 20.0), (2, 5.0)] {
            builder = builder.machine(
                stage * 3 + r,
                HardwareType::A100,
                tp,
                1_000,
                (stage * 2, stage * 2 + 2),
            );
        }
    }
    for stage in 0..2u32 {
        for a in 0..3u32 {
            for b in 0..3u32 {
                let latency = 0.001 * (1 + (a + b) % 3) as f64;
                builder = builder.link(stage * 3 + a, (stage + 1) * 3 + b, latency, None);
            }
        }
    }
    builder.build().unwrap()
}

fn scheduler(method: SchedulingMethod, kv_hwm: f64) -> GlobalScheduler {
    GlobalScheduler::new(
        three_stage_cluster(),
        SchedulerConfig {
            method,
            kv: KvParameters {
                expected_kv_hwm: kv_hwm,
                expected_output_length_ratio: 1.0,
            },
            ..Default::default()
        },
    )
}

fn request(id: u64, tokens: u32) -> RouteRequest {
    RouteRequest {
        id: RequestId(id),
        token_count: tokens,
    }
}

/// Admit requests until the scheduler queues one; returns the admitted ids.
fn fill(scheduler: &mut GlobalScheduler, tokens: u32) -> Vec<RequestId> {
    let mut admitted = Vec::new();
    for id in 0..10_000 {
        match scheduler.route(&request(id, tokens)).unwrap() {
            RoutingDecision::Admit(_) => admitted.push(RequestId(id)),
            RoutingDecision::Queue => break,
        }
    }
    admitted
}

fn assert_conservation(graph: &FlowGraph) {
    let nodes = graph.nodes().len();
    let mut net = vec![0.0; nodes];
    for edge in graph.edges() {
        assert!(edge.flow >= 0.0);
        assert!(edge.flow <= edge.capacity + flow_graph::FLOW_EPSILON);
        net[edge.from] -= edge.flow;
        net[edge.to] += edge.flow;
    }
    for (node, value) in net.iter().enumerate() {
        if node != SOURCE && node != SINK {
            assert!(value.abs() < 1e-6, "node {} is unbalanced by {}", node, value);
        }
    }
    assert!((net[SINK] + net[SOURCE]).abs() < 1e-6);
}

#[test]
fn test_flow_value_is_min_stage_capacity() {
    let scheduler = scheduler(SchedulingMethod::MaxFlow, 0.85);
    assert_eq!(scheduler.flow_value(), 55.0);
}

#[test]
fn test_conservation_through_admit_and_release() {
    for method in SchedulingMethod::ALL {
        let mut scheduler = scheduler(method, 1.0);
        let admitted = fill(&mut scheduler, 1);
        assert!(!admitted.is_empty(), "{} admitted nothing", method);
        assert_conservation(scheduler.graph());
        scheduler.check_invariants().unwrap();

        for id in admitted.iter().step_by(2) {
            scheduler.release(*id).unwrap();
        }
        assert_conservation(scheduler.graph());
        scheduler.check_invariants().unwrap();
    }
}

#[test]
fn test_max_flow_admits_up_to_flow_value() {
    let mut scheduler = scheduler(SchedulingMethod::MaxFlow, 1.0);
    let admitted = fill(&mut scheduler, 1);
    assert_eq!(admitted.len(), 55);
    assert!((scheduler.graph().committed_flow() - 55.0).abs() < 1e-9);
}

#[test]
fn test_compute_flow_never_exceeds_throughput() {
    let mut scheduler = scheduler(SchedulingMethod::ShortestQueue, 1.0);
    fill(&mut scheduler, 1);
    for edge in scheduler.graph().edges() {
        if let EdgeKind::Compute(m) = edge.kind {
            let raw = scheduler.cluster().machine(m).unwrap().throughput;
            assert!(edge.flow <= raw + 1e-9, "{} carries {}", m, edge.flow);
        }
    }
}

#[test]
fn test_first_route_prefers_headroom_then_latency() {
    let mut scheduler = scheduler(SchedulingMethod::MaxFlow, 1.0);
    let RoutingDecision::Admit(path) = scheduler.route(&request(0, 1)).unwrap() else {
        panic!("first request must be admitted");
    };
    // Only the fast replicas have 30 tok/s of headroom.
    assert_eq!(path.machines, vec![MachineId(0), MachineId(3), MachineId(6)]);
}

#[test]
fn test_id_order_breaks_remaining_ties() {
    let cluster = ClusterBuilder::new(1)
        .machine(0, HardwareType::A100, 10.0, 100, (0, 1))
        .machine(1, HardwareType::A100, 10.0, 100, (0, 1))
        .build()
        .unwrap();
    for (order, expected) in [(IdOrder::Ascending, 0), (IdOrder::Descending, 1)] {
        let mut scheduler = GlobalScheduler::new(
            cluster.clone(),
            SchedulerConfig {
                id_order: order,
                ..Default::default()
            },
        );
        let RoutingDecision::Admit(path) = scheduler.route(&request(0, 1)).unwrap() else {
            panic!("request must be admitted");
        };
        assert_eq!(path.machines, vec![MachineId(expected)]);
    }
}

#[test]
fn test_admission_monotone_in_high_water_mark() {
    let mut previous = 0;
    for hwm in [0.1, 0.25, 0.5, 0.75, 1.0] {
        let mut scheduler = scheduler(SchedulingMethod::MaxFlow, hwm);
        let admitted = fill(&mut scheduler, 40).len();
        assert!(
            admitted >= previous,
            "hwm {} admitted {} < {}",
            hwm,
            admitted,
            previous
        );
        previous = admitted;
    }
    assert!(previous > 0);
}

#[test]
fn test_routing_is_deterministic() {
    for method in SchedulingMethod::ALL {
        let routes = |mut s: GlobalScheduler| -> Vec<Vec<MachineId>> {
            (0..40)
                .filter_map(|id| match s.route(&request(id, 8)).unwrap() {
                    RoutingDecision::Admit(path) => Some(path.machines),
                    RoutingDecision::Queue => None,
                })
                .collect()
        };
        assert_eq!(
            routes(scheduler(method, 0.85)),
            routes(scheduler(method, 0.85)),
            "{} routes differ between runs",
            method
        );
    }
}

#[test]
fn test_offline_plan_rebuilt_on_rebatch() {
    let mut scheduler = GlobalScheduler::new(
        three_stage_cluster(),
        SchedulerConfig {
            mode: SchedulingMode::Offline,
            kv: KvParameters {
                expected_kv_hwm: 1.0,
                expected_output_length_ratio: 1.0,
            },
            ..Default::default()
        },
    );
    let admitted = fill(&mut scheduler, 1);
    assert_eq!(admitted.len(), 55);
    for id in &admitted {
        scheduler.release(*id).unwrap();
    }
    scheduler.rebatch().unwrap();
    assert_eq!(fill(&mut scheduler, 1).len(), 55);
    scheduler.check_invariants().unwrap();
}
