/// Integration tests for KV cache admission control.
use flowsim_scheduler::*;

fn pipeline() -> ClusterModel {
    ClusterBuilder::new(4)
        .machine(0, HardwareType::A100, 100.0, 1_000, (0, 2))
        .machine(1, HardwareType::L4, 100.0, 400, (2, 4))
        .link(0, 1, 0.001, None)
        .build()
        .unwrap()
}

fn params(hwm: f64, ratio: f64) -> KvParameters {
    KvParameters {
        expected_kv_hwm: hwm,
        expected_output_length_ratio: ratio,
    }
}

#[test]
fn test_reservation_lifecycle() {
    let cluster = pipeline();
    let mut kv = KvCacheTracker::new(&cluster, params(0.9, 1.0));
    let route = [MachineId(0), MachineId(1)];

    for i in 0..4 {
        kv.reserve(RequestId(i), &route, 50).unwrap();
    }
    assert_eq!(kv.occupancy(MachineId(0)), 0.2);
    assert_eq!(kv.occupancy(MachineId(1)), 0.5);
    assert!((kv.mean_occupancy() - 0.35).abs() < 1e-12);
    kv.check_invariants().unwrap();

    for i in 0..4 {
        let reservation = kv.release(RequestId(i)).unwrap();
        assert_eq!(reservation.footprint, 50);
        assert_eq!(reservation.machines, route.to_vec());
    }
    assert_eq!(kv.occupancy(MachineId(1)), 0.0);
    assert_eq!(kv.reservation_count(), 0);
    kv.check_invariants().unwrap();
}

#[test]
fn test_smallest_cache_bounds_the_route() {
    let cluster = pipeline();
    let kv = KvCacheTracker::new(&cluster, params(0.5, 1.0));
    // Machine 1 admits up to 200 tokens, machine 0 up to 500.
    assert!(kv.fits(MachineId(0), 300));
    assert!(!kv.fits(MachineId(1), 300));
    assert!(kv.fits(MachineId(1), 200));
}

#[test]
fn test_output_ratio_scales_footprint() {
    let cluster = pipeline();
    assert_eq!(KvCacheTracker::new(&cluster, params(0.9, 1.0)).footprint(64), 64);
    assert_eq!(KvCacheTracker::new(&cluster, params(0.9, 2.5)).footprint(64), 160);
    assert_eq!(KvCacheTracker::new(&cluster, params(0.9, 0.1)).footprint(1), 1);
}

#[test]
fn test_clipped_machine_closes_admission_in_scheduler() {
    let config = SchedulerConfig {
        kv: params(0.5, 1.0),
        ..Default::default()
    };
    let mut scheduler = GlobalScheduler::new(pipeline(), config);

    let big = RouteRequest {
        id: RequestId(0),
        token_count: 200,
    };
    assert!(matches!(
        scheduler.route(&big).unwrap(),
        RoutingDecision::Admit(_)
    ));
    // Machine 1 reached its mark; its capacity falls to the committed flow.
    assert!(scheduler.kv().is_clipped(MachineId(1)));
    assert_eq!(scheduler.machine_capacity(MachineId(1)), 1.0);
    assert_eq!(scheduler.machine_capacity(MachineId(0)), 100.0);
    assert_eq!(scheduler.flow_value(), 1.0);

    let small = RouteRequest {
        id: RequestId(1),
        token_count: 1,
    };
    assert_eq!(scheduler.route(&small).unwrap(), RoutingDecision::Queue);

    scheduler.release(RequestId(0)).unwrap();
    assert!(!scheduler.kv().is_clipped(MachineId(1)));
    assert_eq!(scheduler.flow_value(), 100.0);
    assert!(matches!(
        scheduler.route(&small).unwrap(),
        RoutingDecision::Admit(_)
    ));
    scheduler.check_invariants().unwrap();
}

#[test]
fn test_per_machine_high_water_mark_override() {
    let mut scheduler = GlobalScheduler::new(pipeline(), SchedulerConfig::default());
    scheduler.set_high_water_mark(MachineId(1), 0.01).unwrap();
    // 0.01 of 400 tokens leaves room for exactly four one-token requests.
    let mut admitted = 0;
    for id in 0..10 {
        let req = RouteRequest {
            id: RequestId(id),
            token_count: 1,
        };
        if let RoutingDecision::Admit(_) = scheduler.route(&req).unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 4);
    assert!(scheduler.set_high_water_mark(MachineId(7), 0.5).is_err());
}

#[test]
fn test_high_water_mark_override_out_of_range() {
    let mut scheduler = GlobalScheduler::new(pipeline(), SchedulerConfig::default());
    for hwm in [0.0, -0.5, 1.5, f64::NAN] {
        assert!(matches!(
            scheduler.set_high_water_mark(MachineId(1), hwm),
            Err(SchedulerError::InvalidHighWaterMark(_))
        ));
    }
    // The rejected values leave the machine open.
    assert!(!scheduler.kv().is_clipped(MachineId(1)));
    assert!(scheduler.kv().fits(MachineId(1), 1));
    scheduler.set_high_water_mark(MachineId(1), 1.0).unwrap();
}
