use crate::error::Error;
use crate::model::node::ResourceShape;
use crate::model::request::{HostListMode, ReservationRequest, ReservationRequestBuilder, SizingMode, SubRequest};
use crate::model::reservation::NodeTasks;
use crate::scheduler::distribution::{distribute, HostList};
use crate::scheduler::feasible::{FeasibleSetFinder, RangeQuery};
use crate::scheduler::tests::platform_mock::{generate_mock_platform, HOUR, NOW};
use crate::scheduler::tests::setup_for_tests;

fn job(requests: Vec<SubRequest>, sizing: SizingMode) -> ReservationRequest {
    requests
        .into_iter()
        .fold(ReservationRequestBuilder::new(HOUR, NOW).name("job").sizing(sizing), |b, r| b.sub_request(r))
        .build()
}

fn nt(node: u32, tasks: u32) -> NodeTasks {
    NodeTasks::new(node, tasks)
}

#[test]
fn test_single_use_nodes_are_forced_first() {
    setup_for_tests();
    // Both sub-requests consume memory. Only nodes 0 and 1 have enough memory for the first one.
    let request = job(
        vec![
            SubRequest::new(2, ResourceShape::new(0, 32, 0, 0)).node_count(2),
            SubRequest::new(1, ResourceShape::new(0, 8, 0, 0)),
        ],
        SizingMode::Strict,
    );
    let candidates = vec![vec![nt(0, 1), nt(1, 1)], vec![nt(0, 4), nt(1, 4), nt(2, 2)]];
    let distribution = distribute(&request, &candidates, None, "default", NOW).unwrap();
    assert_eq!(distribution.assignments[0], vec![nt(0, 1), nt(1, 1)]);
    assert_eq!(distribution.assignments[1], vec![nt(2, 1)]);
    assert!(!distribution.partial);
}

#[test]
fn test_look_ahead_protects_contending_requests() {
    setup_for_tests();
    let request = job(
        vec![
            SubRequest::new(4, ResourceShape::procs(1)),
            SubRequest::new(1, ResourceShape::procs(1)),
            SubRequest::new(2, ResourceShape::new(0, 8, 0, 0)),
        ],
        SizingMode::Strict,
    );
    let candidates = vec![
        vec![nt(0, 2), nt(1, 2), nt(2, 2)],
        vec![nt(0, 1)],
        vec![nt(1, 1), nt(2, 1)],
    ];
    let distribution = distribute(&request, &candidates, None, "default", NOW).unwrap();
    // The first request is the hungriest on node 0, but taking it would leave nothing for the second one.
    assert_eq!(distribution.assignments[1], vec![nt(0, 1)]);
    assert_eq!(distribution.assignments[0], vec![nt(1, 2), nt(2, 2)]);
    assert_eq!(distribution.assignments[2], vec![nt(1, 1), nt(2, 1)]);
    assert!(!distribution.partial);
}

#[test]
fn test_strict_and_best_effort_shortage() {
    setup_for_tests();
    let candidates = vec![vec![nt(0, 2)]];
    let strict = job(vec![SubRequest::new(4, ResourceShape::procs(1))], SizingMode::Strict);
    assert!(matches!(
        distribute(&strict, &candidates, None, "default", NOW),
        Err(Error::InsufficientResources { what: "tasks", available: 2, required: 4, .. })
    ));

    let best_effort = job(vec![SubRequest::new(4, ResourceShape::procs(1))], SizingMode::BestEffort);
    let distribution = distribute(&best_effort, &candidates, None, "default", NOW).unwrap();
    assert!(distribution.partial);
    assert_eq!(distribution.total_tasks(), 2);
}

#[test]
fn test_disjoint_dimensions_share_nodes() {
    setup_for_tests();
    let request = job(
        vec![SubRequest::new(1, ResourceShape::new(0, 8, 0, 0)), SubRequest::new(1, ResourceShape::new(0, 0, 4, 0))],
        SizingMode::Strict,
    );
    let candidates = vec![vec![nt(0, 4)], vec![nt(0, 4)]];
    let distribution = distribute(&request, &candidates, None, "default", NOW).unwrap();
    assert_eq!(distribution.assignments, vec![vec![nt(0, 1)], vec![nt(0, 1)]]);
}

#[test]
fn test_node_count_spreads_tasks() {
    setup_for_tests();
    let request = job(vec![SubRequest::new(5, ResourceShape::procs(1)).node_count(2)], SizingMode::Strict);
    let candidates = vec![vec![nt(0, 8), nt(1, 8), nt(2, 8)]];
    let distribution = distribute(&request, &candidates, None, "default", NOW).unwrap();
    assert_eq!(distribution.assignments[0], vec![nt(0, 3), nt(1, 2)]);
    assert_eq!(distribution.total_tasks(), 5);
}

#[test]
fn test_request_without_nodes_fails() {
    setup_for_tests();
    let request = job(
        vec![SubRequest::new(1, ResourceShape::procs(1)), SubRequest::new(1, ResourceShape::procs(1))],
        SizingMode::BestEffort,
    );
    let candidates = vec![vec![nt(0, 8)], vec![]];
    assert!(matches!(
        distribute(&request, &candidates, None, "default", NOW),
        Err(Error::InsufficientResources { what: "nodes", .. })
    ));
}

#[test]
fn test_exact_host_list_prepass() {
    setup_for_tests();
    let request = job(vec![SubRequest::new(4, ResourceShape::procs(1))], SizingMode::Strict);
    let candidates = vec![vec![nt(0, 8), nt(1, 8), nt(2, 1)]];
    let host_list = HostList {
        req_index: 0,
        mode: HostListMode::Exact,
        nodes: vec![nt(1, 2), nt(0, 2)],
    };
    let distribution = distribute(&request, &candidates, Some(&host_list), "default", NOW).unwrap();
    assert_eq!(distribution.assignments[0], vec![nt(1, 2), nt(0, 2)]);

    let short = HostList {
        nodes: vec![nt(1, 2), nt(2, 2)],
        ..host_list.clone()
    };
    assert!(distribute(&request, &candidates, Some(&short), "default", NOW).is_err());

    let unknown = HostList {
        nodes: vec![nt(7, 1)],
        ..host_list.clone()
    };
    assert!(distribute(&request, &candidates, Some(&unknown), "default", NOW).is_err());

    let empty = HostList { nodes: vec![], ..host_list };
    assert!(distribute(&request, &candidates, Some(&empty), "default", NOW).is_err());
}

#[test]
fn test_distribution_conservation() {
    setup_for_tests();
    let platform = generate_mock_platform(6, 8);
    let request = job(
        vec![
            SubRequest::new(6, ResourceShape::procs(2)),
            SubRequest::new(5, ResourceShape::procs(1)).node_count(2),
            SubRequest::new(3, ResourceShape::new(1, 8, 0, 0)),
        ],
        SizingMode::Strict,
    );
    let finder = FeasibleSetFinder::new(&platform);
    let candidates: Vec<Vec<NodeTasks>> = request
        .requests
        .iter()
        .map(|r| {
            let query = RangeQuery::new("job", r, HOUR, NOW, "default");
            finder.find_range(&query, &platform.all_nodes()).unwrap().nodes
        })
        .collect();
    let distribution = distribute(&request, &candidates, None, "default", NOW).unwrap();

    for node in platform.nodes() {
        let mut used = ResourceShape::default();
        for (req_index, assignment) in distribution.assignments.iter().enumerate() {
            for assigned in assignment.iter().filter(|a| a.node == node.id) {
                let offered = candidates[req_index].iter().find(|c| c.node == node.id).map(|c| c.tasks).unwrap_or(0);
                assert!(assigned.tasks <= offered);
                used = used.saturating_add(&request.requests[req_index].shape.scaled(assigned.tasks));
            }
        }
        assert!(used.fits_in(&node.capacity.configured), "node {} over-assigned: {:?}", node.name, used);
    }
    for (req_index, sub_request) in request.requests.iter().enumerate() {
        assert!(distribution.task_count(req_index) >= sub_request.required_tasks());
    }
}
