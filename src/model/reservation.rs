use crate::model::node::{NodeId, NodeSet, ResourceShape};
use crate::scheduler::timeline::Occupancy;
use prettytable::{format, row, Table};
use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    pub struct ReservationKey;
}

/// Tasks a node can provide (or has been given) for a sub-request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeTasks {
    pub node: NodeId,
    pub tasks: u32,
}

impl NodeTasks {
    pub fn new(node: NodeId, tasks: u32) -> Self {
        NodeTasks { node, tasks }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedNode {
    pub node: NodeId,
    pub req_index: usize,
    pub tasks: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservationFlags {
    pub best_effort: bool,
    pub space_flex: bool,
    pub exclusive: bool,
    pub shared: bool,
    pub ignore_state: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Idle,
    Active,
    Ended,
}

/// Link from a reservation instance to the standing reservation template that created it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StandingLink {
    pub template: Box<str>,
    pub depth_index: usize,
}

/// A committed, time-bounded allocation of node capacity.
/// The time window is `[start, end)` in epoch seconds.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Reservation {
    pub name: Box<str>,
    pub owner: Option<Box<str>>,
    pub acl: Vec<Box<str>>,
    pub partition: Box<str>,
    pub start: i64,
    pub end: i64,
    pub nodes: Vec<AllocatedNode>,
    /// Per-task shape of each sub-request, indexed by `AllocatedNode::req_index`.
    pub shapes: Vec<ResourceShape>,
    pub required_tasks: u32,
    pub allocated_tasks: u32,
    pub flags: ReservationFlags,
    pub state: ReservationState,
    pub standing: Option<StandingLink>,
    pub host_expression: Option<Box<str>>,
    /// Beginning of the segment not yet reported for accounting (space-flex resizing).
    pub accounting_start: i64,
}

impl Reservation {
    pub fn duration(&self) -> i64 {
        self.end - self.start
    }
    pub fn is_active_at(&self, time: i64) -> bool {
        self.start <= time && time < self.end
    }
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start < end && start < self.end
    }
    pub fn node_set(&self) -> NodeSet {
        NodeSet::from_iter(self.nodes.iter().map(|n| n.node))
    }
    pub fn tasks_on(&self, node: NodeId) -> u32 {
        self.nodes.iter().filter(|n| n.node == node).map(|n| n.tasks).sum()
    }
    pub fn shape(&self, req_index: usize) -> ResourceShape {
        self.shapes.get(req_index).copied().unwrap_or_default()
    }
    pub fn occupancy(&self) -> Occupancy {
        if self.flags.shared {
            Occupancy::Shared
        } else if self.flags.exclusive {
            Occupancy::Exclusive
        } else {
            Occupancy::Dedicated
        }
    }
    pub fn is_partial(&self) -> bool {
        self.allocated_tasks < self.required_tasks
    }

    /// Adds tasks on a node for a sub-request, merging with an existing allocation of the same node and request.
    pub fn add_node_tasks(&mut self, node: NodeId, req_index: usize, tasks: u32) {
        if let Some(allocated) = self.nodes.iter_mut().find(|n| n.node == node && n.req_index == req_index) {
            allocated.tasks += tasks;
        } else {
            self.nodes.push(AllocatedNode { node, req_index, tasks });
        }
        self.allocated_tasks += tasks;
    }

    /// Builds a `Table` listing the allocated nodes.
    pub fn to_table(&self, node_names: impl Fn(NodeId) -> Box<str>) -> Table {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_CLEAN);
        table.add_row(row![buFc->"Node", buFc->"Req", buFc->"Tasks", buFc->"Begin (epoch)", buFc->"End (epoch)"]);
        for allocated in &self.nodes {
            table.add_row(row![node_names(allocated.node), allocated.req_index, allocated.tasks, self.start, self.end]);
        }
        table
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReservationEventKind {
    Created,
    Modified,
    Started,
    Ended,
    Destroyed,
    /// The reservation no longer matches the state of its nodes.
    Corrupted,
    /// A space-flex segment was closed before the allocation got replaced.
    SegmentClosed { start: i64, end: i64, tasks: u32 },
}

/// Abstract lifecycle event, delivered to [`crate::hooks::HooksHandler::notify`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReservationEvent {
    pub kind: ReservationEventKind,
    pub reservation: Box<str>,
    pub time: i64,
}

impl ReservationEvent {
    pub fn new(kind: ReservationEventKind, reservation: &str, time: i64) -> Self {
        ReservationEvent {
            kind,
            reservation: reservation.into(),
            time,
        }
    }
}
