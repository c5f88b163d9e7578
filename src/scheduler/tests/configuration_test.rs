use crate::error::Error;
use crate::model::configuration::Configuration;
use crate::model::node::ResourceShape;
use crate::model::standing::{DayOfWeek, Period, TimeWindow};
use crate::scheduler::tests::setup_for_tests;

const CONFIG: &str = r#"
MAX_REQ_PER_JOB: 4
NODE_DOWN_STATE_DELAY_TIME: -1
MAX_META_TASKS: 128
SHARED_PARTITION: shared
STANDING_RESERVATIONS:
  maintenance:
    PERIOD: week
    DEPTH: 2
    START_TIME: 7200
    DURATION: 3600
    HOST_EXPRESSION: "R:node[01-02]"
  nightly:
    PERIOD: day
    DAYS: [mon, fri]
    TASK_COUNT: 8
    RESOURCES:
      PROCS: 1
      MEMORY: 4
    ROLLBACK_OFFSET: 600
    DISABLED_TIMES:
      - START: 1750000000
        END: 1750003600
"#;

#[test]
fn test_default_configuration() {
    setup_for_tests();
    let config = Configuration::default();
    assert_eq!(config.max_ranges_per_series, 256);
    assert_eq!(config.max_req_per_job, 16);
    assert_eq!(config.max_srsv_depth, 32);
    assert_eq!(config.rsv_ceiling("default"), 64);
    assert_eq!(config.node_down_state_delay_time, 0);
    assert!(config.standing_reservations.is_empty());
}

#[test]
fn test_load_from_yaml() {
    setup_for_tests();
    let config = Configuration::load_from_yaml(CONFIG).unwrap();
    assert_eq!(config.max_req_per_job, 4);
    assert_eq!(config.node_down_state_delay_time, -1);
    assert_eq!(config.max_meta_tasks, Some(128));
    // Missing keys keep their default
    assert_eq!(config.max_rsv_per_node, 64);
    assert_eq!(config.rsv_ceiling("shared"), 1024);
    assert_eq!(config.rsv_ceiling("default"), 64);

    let names: Vec<&str> = config.standing_reservations.keys().map(|k| k.as_ref()).collect();
    assert_eq!(names, vec!["maintenance", "nightly"]);

    let maintenance = &config.standing_reservations["maintenance"];
    assert_eq!(maintenance.period, Period::Week);
    assert_eq!(maintenance.depth, 2);
    assert_eq!(maintenance.start_time, Some(7200));
    assert_eq!(maintenance.duration, Some(3600));
    assert_eq!(maintenance.host_expression.as_deref(), Some("R:node[01-02]"));
    assert_eq!(maintenance.task_count, 0);

    let nightly = &config.standing_reservations["nightly"];
    assert_eq!(nightly.days, Some(vec![DayOfWeek::Mon, DayOfWeek::Fri]));
    assert_eq!(nightly.resources, ResourceShape::new(1, 4, 0, 0));
    assert_eq!(nightly.rollback_offset, Some(600));
    assert_eq!(nightly.depth, 2);
    assert_eq!(
        nightly.disabled_times,
        vec![TimeWindow {
            start: 1_750_000_000,
            end: 1_750_003_600
        }]
    );
}

#[test]
fn test_load_from_json() {
    setup_for_tests();
    let config = Configuration::load_from_yaml(r#"{"MAX_SRSV_DEPTH": 4, "SCHEDULING_HORIZON": 86400}"#).unwrap();
    assert_eq!(config.max_srsv_depth, 4);
    assert_eq!(config.scheduling_horizon, 86400);
}

#[test]
fn test_load_errors() {
    setup_for_tests();
    assert!(matches!(Configuration::load_from_yaml("MAX_REQ_PER_JOB: many"), Err(Error::ConfigLoad(_))));
    assert!(matches!(
        Configuration::load_from_yaml("STANDING_RESERVATIONS:\n  weekly:\n    PERIOD: fortnight\n"),
        Err(Error::ConfigLoad(_))
    ));
    assert!(matches!(
        Configuration::load_from_file("/nonexistent/rsv-scheduler/scheduler.yaml"),
        Err(Error::Io(_))
    ));
}
