use crate::error::Result;
use crate::model::node::ResourceShape;
use crate::model::standing::{DayOfWeek, Period, TimeWindow};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;

const DEFAULT_CONFIG_FILE: &str = "/etc/rsv-scheduler/scheduler.yaml";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct Configuration {
    /// Maximum number of ranges of a single range series.
    pub max_ranges_per_series: usize,
    pub max_req_per_job: usize,
    pub max_srsv_depth: usize,
    // --- Per-node reservation ceilings ---
    pub max_rsv_per_node: usize,
    pub max_rsv_per_shared_node: usize,
    pub shared_partition: Option<Box<str>>,
    // --- Node state handling ---
    /// Time (seconds) a down node is assumed unavailable from now. Negative: forever.
    pub node_down_state_delay_time: i64,
    /// Time (seconds) a drained node is assumed unavailable from now. Negative: forever.
    pub node_drain_state_delay_time: i64,
    /// Ceiling applied to every global task series.
    pub max_meta_tasks: Option<u32>,
    /// Length of the time window searched for a feasible start.
    pub scheduling_horizon: i64,
    pub standing_reservations: IndexMap<Box<str>, StandingReservationConfig>,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            max_ranges_per_series: 256,
            max_req_per_job: 16,
            max_srsv_depth: 32,
            max_rsv_per_node: 64,
            max_rsv_per_shared_node: 1024,
            shared_partition: None,
            node_down_state_delay_time: 0,
            node_drain_state_delay_time: 0,
            max_meta_tasks: None,
            scheduling_horizon: 2 * 365 * 24 * 3600, // 2 years
            standing_reservations: IndexMap::new(),
        }
    }
}

impl Configuration {
    /// Loads the configuration from the default file location.
    pub fn load() -> Result<Self> {
        Self::load_from_file(DEFAULT_CONFIG_FILE)
    }
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::load_from_yaml(&content)
    }
    /// Parses a YAML (or JSON) document. Missing keys take their default value.
    pub fn load_from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Per-node reservation ceiling for a node of the given partition.
    pub fn rsv_ceiling(&self, partition: &str) -> usize {
        match &self.shared_partition {
            Some(shared) if shared.as_ref() == partition => self.max_rsv_per_shared_node,
            _ => self.max_rsv_per_node,
        }
    }
}

/// Field values of a standing reservation template.
/// Time offsets are expressed in seconds from the beginning of the period.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct StandingReservationConfig {
    pub period: Period,
    pub depth: usize,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub duration: Option<i64>,
    /// Days the template applies to. Only valid with a daily period.
    pub days: Option<Vec<DayOfWeek>>,
    pub task_count: u32,
    pub node_count: u32,
    pub resources: ResourceShape,
    pub features: Vec<Box<str>>,
    pub host_expression: Option<Box<str>>,
    pub partition: Option<Box<str>>,
    pub owner: Option<Box<str>>,
    pub acl: Vec<Box<str>>,
    pub best_effort: bool,
    pub exclusive: bool,
    pub ignore_state: bool,
    /// Instances are kept starting at least this long after now.
    pub rollback_offset: Option<i64>,
    pub enable_time: Option<i64>,
    pub disable_time: Option<i64>,
    pub disabled_times: Vec<TimeWindow>,
    pub disabled: bool,
}

impl Default for StandingReservationConfig {
    fn default() -> Self {
        StandingReservationConfig {
            period: Period::Day,
            depth: 2,
            start_time: None,
            end_time: None,
            duration: None,
            days: None,
            task_count: 0,
            node_count: 0,
            resources: ResourceShape::procs(1),
            features: Vec::new(),
            host_expression: None,
            partition: None,
            owner: None,
            acl: Vec::new(),
            best_effort: false,
            exclusive: false,
            ignore_state: false,
            rollback_offset: None,
            enable_time: None,
            disable_time: None,
            disabled_times: Vec::new(),
            disabled: false,
        }
    }
}
