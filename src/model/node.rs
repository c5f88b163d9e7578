use crate::scheduler::timeline::NodeTimeline;
use range_set_blaze::RangeSetBlaze;
use serde::{Deserialize, Serialize};

/// Index of a node in the platform node table.
pub type NodeId = u32;

/// Set of node indices. Partitions, host lists and candidate pools are all expressed as `NodeSet`s.
pub type NodeSet = RangeSetBlaze<u32>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceDimension {
    Procs,
    Memory,
    Disk,
    Gres,
}

impl ResourceDimension {
    pub const ALL: [ResourceDimension; 4] = [
        ResourceDimension::Procs,
        ResourceDimension::Memory,
        ResourceDimension::Disk,
        ResourceDimension::Gres,
    ];
}

/// Amount of each resource dimension. Used both for node capacities and for the per-task shape of a request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct ResourceShape {
    pub procs: u32,
    pub memory: u32,
    pub disk: u32,
    pub gres: u32,
}

impl ResourceShape {
    pub const fn new(procs: u32, memory: u32, disk: u32, gres: u32) -> Self {
        ResourceShape { procs, memory, disk, gres }
    }
    pub const fn procs(procs: u32) -> Self {
        ResourceShape::new(procs, 0, 0, 0)
    }

    pub fn get(&self, dimension: ResourceDimension) -> u32 {
        match dimension {
            ResourceDimension::Procs => self.procs,
            ResourceDimension::Memory => self.memory,
            ResourceDimension::Disk => self.disk,
            ResourceDimension::Gres => self.gres,
        }
    }

    pub fn is_empty(&self) -> bool {
        ResourceDimension::ALL.iter().all(|d| self.get(*d) == 0)
    }

    /// Dimensions with a non-zero amount.
    pub fn dimensions(&self) -> impl Iterator<Item = ResourceDimension> + '_ {
        ResourceDimension::ALL.into_iter().filter(|d| self.get(*d) > 0)
    }

    /// Two shapes contend for the same node capacity when they both consume at least one common dimension.
    pub fn shares_dimension(&self, other: &ResourceShape) -> bool {
        self.dimensions().any(|d| other.get(d) > 0)
    }

    /// Number of tasks of shape `per_task` fitting in `self`.
    /// An empty per-task shape is counted as one processor per task.
    pub fn tasks_for(&self, per_task: &ResourceShape) -> u32 {
        if per_task.is_empty() {
            return self.procs;
        }
        per_task.dimensions().map(|d| self.get(d) / per_task.get(d)).min().unwrap_or(0)
    }

    pub fn scaled(&self, tasks: u32) -> ResourceShape {
        let per_task = if self.is_empty() { ResourceShape::procs(1) } else { *self };
        ResourceShape::new(
            per_task.procs.saturating_mul(tasks),
            per_task.memory.saturating_mul(tasks),
            per_task.disk.saturating_mul(tasks),
            per_task.gres.saturating_mul(tasks),
        )
    }

    pub fn saturating_add(&self, other: &ResourceShape) -> ResourceShape {
        ResourceShape::new(
            self.procs.saturating_add(other.procs),
            self.memory.saturating_add(other.memory),
            self.disk.saturating_add(other.disk),
            self.gres.saturating_add(other.gres),
        )
    }

    pub fn saturating_sub(&self, other: &ResourceShape) -> ResourceShape {
        ResourceShape::new(
            self.procs.saturating_sub(other.procs),
            self.memory.saturating_sub(other.memory),
            self.disk.saturating_sub(other.disk),
            self.gres.saturating_sub(other.gres),
        )
    }

    /// Returns true if every dimension of `self` is lower or equal to the one of `other`.
    pub fn fits_in(&self, other: &ResourceShape) -> bool {
        ResourceDimension::ALL.iter().all(|d| self.get(*d) <= other.get(*d))
    }
}

/// Capacity triple of a node.
/// `configured` is what the node offers, `dedicated` is what active reservations currently hold,
/// and `available` is what the resource manager reports as free right now.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capacity {
    pub configured: ResourceShape,
    pub dedicated: ResourceShape,
    pub available: ResourceShape,
}

impl Capacity {
    pub fn new(configured: ResourceShape) -> Self {
        Capacity {
            configured,
            dedicated: ResourceShape::default(),
            available: configured,
        }
    }
    pub fn dedicate(&mut self, amount: &ResourceShape) {
        self.dedicated = self.dedicated.saturating_add(amount);
        self.available = self.available.saturating_sub(amount);
    }
    pub fn release(&mut self, amount: &ResourceShape) {
        self.dedicated = self.dedicated.saturating_sub(amount);
        self.available = self.available.saturating_add(amount);
        if !self.available.fits_in(&self.configured) {
            self.available = self.configured.saturating_sub(&self.dedicated);
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Idle,
    Busy,
    Active,
    Down,
    Drained,
    Draining,
    Unknown,
}

impl NodeState {
    pub fn is_operational(&self) -> bool {
        matches!(self, NodeState::Idle | NodeState::Busy | NodeState::Active)
    }
    pub fn is_down(&self) -> bool {
        matches!(self, NodeState::Down | NodeState::Unknown)
    }
    pub fn is_drained(&self) -> bool {
        matches!(self, NodeState::Drained | NodeState::Draining)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: Box<str>,
    pub partition: Box<str>,
    pub classes: Vec<Box<str>>,
    pub features: Vec<Box<str>>,
    pub arch: Option<Box<str>>,
    pub os: Option<Box<str>>,
    pub capacity: Capacity,
    pub state: NodeState,
    pub timeline: NodeTimeline,
}

impl Node {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f.as_ref() == feature)
    }
    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c.as_ref() == class)
    }
}

pub struct NodeBuilder {
    name: Box<str>,
    partition: Box<str>,
    classes: Vec<Box<str>>,
    features: Vec<Box<str>>,
    arch: Option<Box<str>>,
    os: Option<Box<str>>,
    configured: ResourceShape,
    state: NodeState,
}

impl NodeBuilder {
    pub fn new(name: &str, configured: ResourceShape) -> Self {
        NodeBuilder {
            name: name.into(),
            partition: "default".into(),
            classes: Vec::new(),
            features: Vec::new(),
            arch: None,
            os: None,
            configured,
            state: NodeState::Idle,
        }
    }
    pub fn partition(mut self, partition: &str) -> Self {
        self.partition = partition.into();
        self
    }
    pub fn class(mut self, class: &str) -> Self {
        self.classes.push(class.into());
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
    pub fn state(mut self, state: NodeState) -> Self {
        self.state = state;
        self
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn get_partition(&self) -> &str {
        &self.partition
    }

    /// Builds the node with the index it will have in the platform node table.
    pub fn build(self, id: NodeId) -> Node {
        Node {
            id,
            name: self.name,
            partition: self.partition,
            classes: self.classes,
            features: self.features,
            arch: self.arch,
            os: self.os,
            capacity: Capacity::new(self.configured),
            state: self.state,
            timeline: NodeTimeline::default(),
        }
    }
}
