use crate::model::node::{Node, ResourceShape};
use crate::model::reservation::StandingLink;
use serde::{Deserialize, Serialize};

/// How strictly a request must be sized.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    /// The request fails unless every task and node target is met.
    #[default]
    Strict,
    /// The request succeeds with whatever was found, flagged as partial.
    BestEffort,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// The allocation must start exactly at the earliest start.
    #[default]
    Fixed,
    /// The allocation starts at the first time at or after the earliest start where the request fits.
    Earliest,
}

/// How an explicit host list constrains the node selection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostListMode {
    /// Every listed host is used, and only listed hosts.
    #[default]
    Exact,
    /// Any subset of the listed hosts.
    Subset,
    /// Every listed host plus any other eligible node.
    Superset,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartitionScope {
    /// Every partition is evaluated and the one yielding the most tasks is kept.
    #[default]
    Any,
    Named(Box<str>),
    /// A single pool spanning every node of the cluster.
    All,
}

/// One homogeneous resource requirement within a request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubRequest {
    pub index: usize,
    /// Resources consumed by each task.
    pub shape: ResourceShape,
    pub task_count: u32,
    pub node_count: u32,
    /// Maximum number of tasks a single node may contribute.
    pub tasks_per_node: Option<u32>,
    /// A node contributing less than this number of tasks is not used.
    pub min_tasks_per_node: u32,
    pub features: Vec<Box<str>>,
    pub arch: Option<Box<str>>,
    pub os: Option<Box<str>>,
}

impl SubRequest {
    pub fn new(task_count: u32, shape: ResourceShape) -> Self {
        SubRequest {
            index: 0,
            shape,
            task_count,
            node_count: 0,
            tasks_per_node: None,
            min_tasks_per_node: 1,
            features: Vec::new(),
            arch: None,
            os: None,
        }
    }
    pub fn node_count(mut self, node_count: u32) -> Self {
        self.node_count = node_count;
        self
    }
    pub fn tasks_per_node(mut self, tasks_per_node: u32) -> Self {
        self.tasks_per_node = Some(tasks_per_node);
        self
    }
    pub fn min_tasks_per_node(mut self, min_tasks_per_node: u32) -> Self {
        self.min_tasks_per_node = min_tasks_per_node.max(1);
        self
    }
    pub fn feature(mut self, feature: &str) -> Self {
        self.features.push(feature.into());
        self
    }
    pub fn arch(mut self, arch: &str) -> Self {
        self.arch = Some(arch.into());
        self
    }
    pub fn os(mut self, os: &str) -> Self {
        self.os = Some(os.into());
        self
    }

    /// Amount of work still to place, counted as in tasks or nodes whichever is larger.
    pub fn required_tasks(&self) -> u32 {
        self.task_count.max(self.node_count)
    }

    /// Returns true if the node satisfies the feature, architecture and OS constraints.
    pub fn matches(&self, node: &Node) -> bool {
        self.features.iter().all(|f| node.has_feature(f))
            && self.arch.as_ref().is_none_or(|arch| node.arch.as_ref() == Some(arch))
            && self.os.as_ref().is_none_or(|os| node.os.as_ref() == Some(os))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags {
    /// Resizable best-effort allocation; closed segments are reported before being replaced.
    pub space_flex: bool,
    pub exclusive: bool,
    /// Overlay reservation that grants access without consuming capacity.
    pub shared: bool,
    pub ignore_state: bool,
    /// Allow exceeding the per-node reservation ceiling.
    pub override_rsv_limit: bool,
}

/// A job or reservation request, composed of one or more sub-requests.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReservationRequest {
    pub name: Option<Box<str>>,
    pub owner: Option<Box<str>>,
    pub acl: Vec<Box<str>>,
    pub requests: Vec<SubRequest>,
    pub duration: i64,
    pub earliest_start: i64,
    pub start_mode: StartMode,
    pub sizing: SizingMode,
    pub flags: RequestFlags,
    pub partition: PartitionScope,
    pub host_expression: Option<Box<str>>,
    pub host_list_mode: HostListMode,
    pub standing: Option<StandingLink>,
}

impl ReservationRequest {
    pub fn object_name(&self) -> &str {
        self.name.as_deref().unwrap_or("request")
    }
    pub fn total_tasks(&self) -> u32 {
        self.requests.iter().map(|r| r.required_tasks()).sum()
    }
}

pub struct ReservationRequestBuilder {
    name: Option<Box<str>>,
    owner: Option<Box<str>>,
    acl: Vec<Box<str>>,
    requests: Vec<SubRequest>,
    duration: i64,
    earliest_start: i64,
    start_mode: StartMode,
    sizing: SizingMode,
    flags: RequestFlags,
    partition: PartitionScope,
    host_expression: Option<Box<str>>,
    host_list_mode: HostListMode,
    standing: Option<StandingLink>,
}

impl ReservationRequestBuilder {
    pub fn new(duration: i64, earliest_start: i64) -> Self {
        ReservationRequestBuilder {
            name: None,
            owner: None,
            acl: Vec::new(),
            requests: Vec::new(),
            duration,
            earliest_start,
            start_mode: StartMode::Fixed,
            sizing: SizingMode::Strict,
            flags: RequestFlags::default(),
            partition: PartitionScope::Any,
            host_expression: None,
            host_list_mode: HostListMode::Exact,
            standing: None,
        }
    }
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.into());
        self
    }
    pub fn owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.into());
        self
    }
    pub fn acl(mut self, acl: Vec<Box<str>>) -> Self {
        self.acl = acl;
        self
    }
    pub fn sub_request(mut self, request: SubRequest) -> Self {
        self.requests.push(request);
        self
    }
    pub fn start_mode(mut self, start_mode: StartMode) -> Self {
        self.start_mode = start_mode;
        self
    }
    pub fn sizing(mut self, sizing: SizingMode) -> Self {
        self.sizing = sizing;
        self
    }
    pub fn flags(mut self, flags: RequestFlags) -> Self {
        self.flags = flags;
        self
    }
    pub fn exclusive(mut self) -> Self {
        self.flags.exclusive = true;
        self
    }
    pub fn ignore_state(mut self) -> Self {
        self.flags.ignore_state = true;
        self
    }
    pub fn partition(mut self, partition: PartitionScope) -> Self {
        self.partition = partition;
        self
    }
    pub fn host_expression(mut self, expression: &str, mode: HostListMode) -> Self {
        self.host_expression = Some(expression.into());
        self.host_list_mode = mode;
        self
    }
    pub fn standing(mut self, link: StandingLink) -> Self {
        self.standing = Some(link);
        self
    }
    pub fn build(self) -> ReservationRequest {
        let requests = self
            .requests
            .into_iter()
            .enumerate()
            .map(|(index, mut request)| {
                request.index = index;
                request
            })
            .collect();
        ReservationRequest {
            name: self.name,
            owner: self.owner,
            acl: self.acl,
            requests,
            duration: self.duration,
            earliest_start: self.earliest_start,
            start_mode: self.start_mode,
            sizing: self.sizing,
            flags: self.flags,
            partition: self.partition,
            host_expression: self.host_expression,
            host_list_mode: self.host_list_mode,
            standing: self.standing,
        }
    }
}
