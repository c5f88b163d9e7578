use crate::error::Error;
use crate::hooks::DefaultHooks;
use crate::model::configuration::Configuration;
use crate::model::node::{NodeState, ResourceShape};
use crate::model::request::{ReservationRequestBuilder, StartMode, SubRequest};
use crate::model::reservation::ReservationKey;
use crate::scheduler::allocator::ReservationAllocator;
use crate::scheduler::range::TimeRange;
use crate::scheduler::tests::platform_mock::{generate_mock_config, generate_mock_platform, generate_mock_platform_with_config, HOUR, NOW};
use crate::scheduler::tests::setup_for_tests;
use crate::scheduler::timeline::{NodeConsistency, Occupancy, Projection, TimelineEntry};
use slotmap::SlotMap;

fn entry(reservation: ReservationKey, start: i64, end: i64, tasks: u32) -> TimelineEntry {
    TimelineEntry {
        reservation,
        start,
        end,
        tasks,
        shape: ResourceShape::procs(1),
        occupancy: Occupancy::Dedicated,
    }
}

#[test]
fn test_projection_subtracts_committed_entries() {
    setup_for_tests();
    let mut platform = generate_mock_platform(1, 8);
    let hooks = DefaultHooks;
    let request = ReservationRequestBuilder::new(HOUR, NOW + HOUR)
        .sub_request(SubRequest::new(4, ResourceShape::procs(1)))
        .build();
    ReservationAllocator::new(&mut platform, &hooks).allocate(&request).unwrap();

    let node = platform.node(0).unwrap();
    let projection = Projection::new(ResourceShape::procs(1), NOW, NOW + 3 * HOUR);
    let ranges = node.project_availability(&projection, NOW, platform.config()).unwrap();
    assert_eq!(
        ranges.ranges(),
        &[
            TimeRange::new(NOW, NOW + HOUR, 8),
            TimeRange::new(NOW + HOUR, NOW + 2 * HOUR, 4),
            TimeRange::new(NOW + 2 * HOUR, NOW + 3 * HOUR, 8),
        ]
    );

    // Two processors per task
    let projection = Projection::new(ResourceShape::procs(2), NOW, NOW + 3 * HOUR);
    let ranges = node.project_availability(&projection, NOW, platform.config()).unwrap();
    assert_eq!(ranges.tasks_at(NOW), 4);
    assert_eq!(ranges.tasks_at(NOW + HOUR), 2);

    // Exclusive projections see the node as busy as soon as anything is reserved
    let projection = Projection {
        exclusive: true,
        ..Projection::new(ResourceShape::procs(1), NOW, NOW + 3 * HOUR)
    };
    let ranges = node.project_availability(&projection, NOW, platform.config()).unwrap();
    assert_eq!(ranges.tasks_at(NOW + HOUR), 0);
    assert_eq!(ranges.tasks_at(NOW + 2 * HOUR), 8);
}

#[test]
fn test_down_node_grace_delay() {
    setup_for_tests();
    let config = Configuration {
        node_down_state_delay_time: 2 * HOUR,
        ..generate_mock_config()
    };
    let mut platform = generate_mock_platform_with_config(config, 1, 8);
    platform.node_mut(0).unwrap().state = NodeState::Down;

    let projection = Projection::new(ResourceShape::procs(1), NOW, NOW + 4 * HOUR);
    let node = platform.node(0).unwrap();
    let ranges = node.project_availability(&projection, NOW, platform.config()).unwrap();
    assert_eq!(ranges.ranges(), &[TimeRange::new(NOW + 2 * HOUR, NOW + 4 * HOUR, 8)]);

    let ignoring = Projection {
        ignore_state: true,
        ..projection
    };
    let ranges = node.project_availability(&ignoring, NOW, platform.config()).unwrap();
    assert_eq!(ranges.ranges(), &[TimeRange::new(NOW, NOW + 4 * HOUR, 8)]);

    let forever = Configuration {
        node_down_state_delay_time: -1,
        ..generate_mock_config()
    };
    let ranges = node.project_availability(&projection, NOW, &forever).unwrap();
    assert!(ranges.is_empty());

    let drained_config = Configuration {
        node_drain_state_delay_time: HOUR,
        ..generate_mock_config()
    };
    platform.node_mut(0).unwrap().state = NodeState::Drained;
    let node = platform.node(0).unwrap();
    let ranges = node.project_availability(&projection, NOW, &drained_config).unwrap();
    assert_eq!(ranges.earliest_start(1), Some(NOW + HOUR));
}

#[test]
fn test_reservation_ceiling() {
    setup_for_tests();
    let config = Configuration {
        max_rsv_per_node: 2,
        max_rsv_per_shared_node: 3,
        shared_partition: Some("shared".into()),
        ..generate_mock_config()
    };
    let mut platform = generate_mock_platform_with_config(config.clone(), 1, 8);
    let mut keys: SlotMap<ReservationKey, ()> = SlotMap::with_key();
    let (a, b, c) = (keys.insert(()), keys.insert(()), keys.insert(()));

    let node = platform.node_mut(0).unwrap();
    node.insert_entry(&config, entry(a, NOW, NOW + HOUR, 1), false).unwrap();
    node.insert_entry(&config, entry(b, NOW, NOW + HOUR, 1), false).unwrap();
    // Same reservation again: not a new reservation on the node
    node.insert_entry(&config, entry(b, NOW + HOUR, NOW + 2 * HOUR, 1), false).unwrap();
    assert!(matches!(
        node.insert_entry(&config, entry(c, NOW, NOW + HOUR, 1), false),
        Err(Error::CapacityExceeded { max: 2, .. })
    ));
    node.insert_entry(&config, entry(c, NOW, NOW + HOUR, 1), true).unwrap();
    assert_eq!(node.timeline.reservation_count(), 3);

    assert_eq!(node.remove_entries(b), 2);
    assert_eq!(node.remove_entries(b), 0);
    assert_eq!(node.timeline.reservation_count(), 2);

    assert_eq!(config.rsv_ceiling("shared"), 3);
    assert_eq!(config.rsv_ceiling("default"), 2);
}

#[test]
fn test_no_oversubscription() {
    setup_for_tests();
    let mut platform = generate_mock_platform(4, 8);
    let hooks = DefaultHooks;
    for i in 0..12u32 {
        let request = ReservationRequestBuilder::new((1 + (i % 3) as i64) * HOUR, NOW + (i % 4) as i64 * HOUR / 2)
            .sub_request(SubRequest::new(3 + i % 7, ResourceShape::new(1, 2 + i % 3, 0, 0)))
            .start_mode(StartMode::Earliest)
            .build();
        ReservationAllocator::new(&mut platform, &hooks).allocate(&request).unwrap();
    }
    let exclusive = ReservationRequestBuilder::new(HOUR, NOW)
        .sub_request(SubRequest::new(1, ResourceShape::procs(1)))
        .start_mode(StartMode::Earliest)
        .exclusive()
        .build();
    ReservationAllocator::new(&mut platform, &hooks).allocate(&exclusive).unwrap();

    for node in platform.nodes() {
        let configured = node.capacity.configured;
        for entry in node.timeline.entries() {
            for time in [entry.start, entry.end - 1] {
                let used = node.timeline.consumed_at(time, &configured, None);
                assert!(used.fits_in(&configured), "node {} oversubscribed at {}: {:?}", node.name, time, used);
            }
        }
    }
}

#[test]
fn test_check_consistency() {
    setup_for_tests();
    let config = Configuration {
        node_down_state_delay_time: 2 * HOUR,
        ..generate_mock_config()
    };
    let mut platform = generate_mock_platform_with_config(config, 2, 8);
    let hooks = DefaultHooks;
    let soon = ReservationRequestBuilder::new(HOUR, NOW + HOUR)
        .sub_request(SubRequest::new(8, ResourceShape::procs(1)))
        .build();
    let later = ReservationRequestBuilder::new(HOUR, NOW + 5 * HOUR)
        .sub_request(SubRequest::new(8, ResourceShape::procs(1)))
        .build();
    let soon = ReservationAllocator::new(&mut platform, &hooks).allocate(&soon).unwrap();
    let later = ReservationAllocator::new(&mut platform, &hooks).allocate(&later).unwrap();
    let soon_node = platform.reservation(soon.key).unwrap().nodes[0].node;
    let later_node = platform.reservation(later.key).unwrap().nodes[0].node;

    for id in [soon_node, later_node] {
        platform.node_mut(id).unwrap().state = NodeState::Down;
    }
    let config = platform.config().clone();
    let check = |key: ReservationKey, node| {
        let reservation = platform.reservation(key).unwrap();
        platform.node(node).unwrap().check_consistency(key, reservation, NOW, &config)
    };
    // Starts within the assumed down window
    assert_eq!(check(soon.key, soon_node), NodeConsistency::Invalid { tasks: 8 });
    // Starts once the node is assumed back
    assert_eq!(check(later.key, later_node), NodeConsistency::Valid { tasks: 8 });
    if soon_node != later_node {
        assert_eq!(check(soon.key, later_node), NodeConsistency::Missing);
    }
}

#[test]
fn test_started_reservation_has_no_grace() {
    setup_for_tests();
    let config = Configuration {
        node_down_state_delay_time: 0,
        ..generate_mock_config()
    };
    let mut platform = generate_mock_platform_with_config(config, 1, 8);
    let request = ReservationRequestBuilder::new(HOUR, NOW)
        .sub_request(SubRequest::new(8, ResourceShape::procs(1)))
        .build();
    let key = ReservationAllocator::new(&mut platform, &DefaultHooks).allocate(&request).unwrap().key;
    platform.node_mut(0).unwrap().state = NodeState::Down;

    let config = platform.config().clone();
    let node = platform.node(0).unwrap();
    // The node is projected usable right away...
    let projection = Projection {
        exclude: Some(key),
        ..Projection::new(ResourceShape::procs(1), NOW, NOW + HOUR)
    };
    let availability = node.project_availability(&projection, NOW, &config).unwrap();
    assert_eq!(availability.tasks_at(NOW), 8);
    // ...but the running reservation on it is lost
    let reservation = platform.reservation(key).unwrap();
    assert_eq!(node.check_consistency(key, reservation, NOW, &config), NodeConsistency::Invalid { tasks: 8 });
}
