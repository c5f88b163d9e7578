use crate::error::Error;
use crate::hooks::DefaultHooks;
use crate::model::node::{NodeSet, ResourceShape};
use crate::model::request::{HostListMode, ReservationRequestBuilder, SizingMode, StartMode, SubRequest};
use crate::model::reservation::NodeTasks;
use crate::platform::Platform;
use crate::scheduler::allocator::ReservationAllocator;
use crate::scheduler::feasible::{FeasibleSetFinder, RangeQuery};
use crate::scheduler::tests::platform_mock::{generate_mock_platform, HOUR, NOW};
use crate::scheduler::tests::setup_for_tests;

/// Reserves `tasks` processors of a host over `[start, start + duration)`.
fn occupy(platform: &mut Platform, host: &str, tasks: u32, start: i64, duration: i64) {
    let request = ReservationRequestBuilder::new(duration, start)
        .sub_request(SubRequest::new(tasks, ResourceShape::procs(1)))
        .host_expression(host, HostListMode::Exact)
        .build();
    ReservationAllocator::new(platform, &DefaultHooks).allocate(&request).unwrap();
}

#[test]
fn test_fixed_start_collects_every_available_node() {
    setup_for_tests();
    let mut platform = generate_mock_platform(4, 8);
    occupy(&mut platform, "node01", 8, NOW, 2 * HOUR);

    let request = SubRequest::new(16, ResourceShape::procs(1));
    let query = RangeQuery::new("job", &request, HOUR, NOW, "default");
    let set = FeasibleSetFinder::new(&platform).find_range(&query, &platform.all_nodes()).unwrap();
    assert_eq!(set.start, NOW);
    assert_eq!(set.task_count, 24);
    assert_eq!(set.node_count, 3);
    assert!(!set.partial);
    assert_eq!(set.nodes, vec![NodeTasks::new(1, 8), NodeTasks::new(2, 8), NodeTasks::new(3, 8)]);
}

#[test]
fn test_earliest_start_and_window_errors() {
    setup_for_tests();
    let mut platform = generate_mock_platform(1, 8);
    occupy(&mut platform, "node01", 6, NOW, 2 * HOUR);
    let candidates = platform.all_nodes();
    let finder = FeasibleSetFinder::new(&platform);

    let request = SubRequest::new(4, ResourceShape::procs(1));
    let query = RangeQuery::new("job", &request, HOUR, NOW, "default").start_mode(StartMode::Earliest);
    let set = finder.find_range(&query, &candidates).unwrap();
    assert_eq!(set.start, NOW + 2 * HOUR);
    assert_eq!(set.task_count, 8);

    // Only 2 tasks at the requested start, but enough later on
    let query = RangeQuery::new("job", &request, HOUR, NOW, "default");
    assert!(matches!(finder.find_range(&query, &candidates), Err(Error::NoFeasibleWindow { .. })));

    // A 1.5 hour window starting at now + 1h overlaps the busy period
    let query = RangeQuery::new("job", &request, 3 * HOUR / 2, NOW + HOUR, "default").start_mode(StartMode::Earliest);
    assert_eq!(finder.find_range(&query, &candidates).unwrap().start, NOW + 2 * HOUR);

    // Never enough tasks
    let request = SubRequest::new(16, ResourceShape::procs(1));
    let query = RangeQuery::new("job", &request, HOUR, NOW, "default").start_mode(StartMode::Earliest);
    match finder.find_range(&query, &candidates) {
        Err(Error::InsufficientResources { available, required, .. }) => {
            assert_eq!(required, 16);
            assert!(available < 16);
        }
        other => panic!("unexpected result {:?}", other.map(|s| s.start)),
    }
}

#[test]
fn test_best_effort_reports_partial_set() {
    setup_for_tests();
    let platform = generate_mock_platform(1, 8);
    let request = SubRequest::new(12, ResourceShape::procs(1));
    let query = RangeQuery::new("job", &request, HOUR, NOW, "default").sizing(SizingMode::BestEffort);
    let set = FeasibleSetFinder::new(&platform).find_range(&query, &platform.all_nodes()).unwrap();
    assert!(set.partial);
    assert_eq!(set.task_count, 8);
    assert_eq!(set.start, NOW);
}

#[test]
fn test_required_nodes_must_be_available_together() {
    setup_for_tests();
    let mut platform = generate_mock_platform(3, 8);
    occupy(&mut platform, "node01", 8, NOW, HOUR);
    let candidates = platform.all_nodes();
    let required = NodeSet::from_iter([0]);
    let finder = FeasibleSetFinder::new(&platform);

    let request = SubRequest::new(2, ResourceShape::procs(1));
    let query = RangeQuery::new("job", &request, HOUR, NOW, "default")
        .start_mode(StartMode::Earliest)
        .required_nodes(&required);
    let set = finder.find_range(&query, &candidates).unwrap();
    assert_eq!(set.start, NOW + HOUR);
    assert!(set.nodes.iter().any(|n| n.node == 0));

    let query = RangeQuery::new("job", &request, HOUR, NOW, "default").required_nodes(&required);
    assert!(finder.find_range(&query, &candidates).is_err());
}

#[test]
fn test_per_node_constraints() {
    setup_for_tests();
    let mut platform = generate_mock_platform(2, 8);
    occupy(&mut platform, "node01", 4, NOW, HOUR);
    let candidates = platform.all_nodes();
    let finder = FeasibleSetFinder::new(&platform);

    let request = SubRequest::new(4, ResourceShape::procs(1)).tasks_per_node(2);
    let query = RangeQuery::new("job", &request, HOUR, NOW, "default");
    let set = finder.find_range(&query, &candidates).unwrap();
    assert_eq!(set.nodes, vec![NodeTasks::new(0, 2), NodeTasks::new(1, 2)]);

    let request = SubRequest::new(6, ResourceShape::procs(1)).tasks_per_node(2);
    let query = RangeQuery::new("job", &request, HOUR, NOW, "default");
    assert!(matches!(finder.find_range(&query, &candidates), Err(Error::InsufficientResources { available: 4, required: 6, .. })));

    let request = SubRequest::new(6, ResourceShape::procs(1)).min_tasks_per_node(6);
    let query = RangeQuery::new("job", &request, HOUR, NOW, "default");
    let set = finder.find_range(&query, &candidates).unwrap();
    assert_eq!(set.nodes, vec![NodeTasks::new(1, 8)]);

    let request = SubRequest::new(2, ResourceShape::procs(1)).feature("gpu");
    let query = RangeQuery::new("job", &request, HOUR, NOW, "default");
    assert!(matches!(finder.find_range(&query, &candidates), Err(Error::InsufficientResources { .. })));

    // Memory bound tasks: 32 memory units per node, 8 per task
    let request = SubRequest::new(7, ResourceShape::new(1, 8, 0, 0));
    let query = RangeQuery::new("job", &request, HOUR, NOW, "default");
    let set = finder.find_range(&query, &candidates).unwrap();
    assert_eq!(set.nodes, vec![NodeTasks::new(0, 4), NodeTasks::new(1, 4)]);
    let request = SubRequest::new(2, ResourceShape::new(1, 12, 0, 0));
    let query = RangeQuery::new("job", &request, HOUR, NOW, "default");
    let set = finder.find_range(&query, &candidates).unwrap();
    assert_eq!(set.task_count, 4);
}

#[test]
fn test_max_end_range_keeps_the_tightest_node() {
    setup_for_tests();
    let mut platform = generate_mock_platform(3, 8);
    occupy(&mut platform, "node02", 8, NOW + 4 * HOUR, HOUR);
    occupy(&mut platform, "node01", 8, NOW + 2 * HOUR, HOUR);
    let request = SubRequest::new(2, ResourceShape::procs(1));
    let query = RangeQuery::new("rsv", &request, HOUR, NOW, "default").want_max_end_range();
    let set = FeasibleSetFinder::new(&platform).find_range(&query, &platform.all_nodes()).unwrap();
    assert_eq!(set.nodes, vec![NodeTasks::new(0, 2)]);
    assert_eq!(set.node_count, 1);
}
