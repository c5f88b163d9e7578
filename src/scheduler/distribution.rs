use crate::error::{Error, Result};
use crate::model::node::{NodeId, ResourceShape};
use crate::model::request::{HostListMode, ReservationRequest, SizingMode};
use crate::model::reservation::NodeTasks;
use auto_bench_fct::auto_bench_fct_hy;
use indexmap::IndexMap;
use log::{debug, info, trace};

/// Explicit host list pinned to one sub-request.
#[derive(Debug, Clone)]
pub struct HostList {
    pub req_index: usize,
    pub mode: HostListMode,
    /// Hosts and the number of tasks wanted on each of them.
    pub nodes: Vec<NodeTasks>,
}

/// Per sub-request node assignment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Distribution {
    pub assignments: Vec<Vec<NodeTasks>>,
    pub partial: bool,
}

impl Distribution {
    pub fn task_count(&self, req_index: usize) -> u32 {
        self.assignments.get(req_index).map(|a| a.iter().map(|n| n.tasks).sum()).unwrap_or(0)
    }
    pub fn total_tasks(&self) -> u32 {
        (0..self.assignments.len()).map(|i| self.task_count(i)).sum()
    }
}

/// Bookkeeping of the greedy node distribution.
struct DistributionState<'r> {
    request: &'r ReservationRequest,
    shapes: Vec<ResourceShape>,
    /// Tasks each remaining node can still give to each sub-request, in first-candidate order.
    node_tasks: IndexMap<NodeId, Vec<u32>>,
    /// Number of sub-requests able to use each node when the distribution started.
    frequency: IndexMap<NodeId, usize>,
    /// Frequency-weighted availability of each sub-request.
    weighted_available: Vec<f64>,
    total_available: Vec<u32>,
    assignments: Vec<Vec<NodeTasks>>,
}

impl<'r> DistributionState<'r> {
    fn new(request: &'r ReservationRequest, candidates: &[Vec<NodeTasks>]) -> Self {
        let req_count = request.requests.len();
        let mut node_tasks: IndexMap<NodeId, Vec<u32>> = IndexMap::new();
        for (req_index, nodes) in candidates.iter().enumerate().take(req_count) {
            for candidate in nodes.iter().filter(|n| n.tasks > 0) {
                node_tasks.entry(candidate.node).or_insert_with(|| vec![0; req_count])[req_index] = candidate.tasks;
            }
        }
        let frequency: IndexMap<NodeId, usize> = node_tasks
            .iter()
            .map(|(node, tasks)| (*node, tasks.iter().filter(|t| **t > 0).count()))
            .collect();
        let mut weighted_available = vec![0.0; req_count];
        let mut total_available = vec![0; req_count];
        for (node, tasks) in &node_tasks {
            for (req_index, count) in tasks.iter().enumerate() {
                weighted_available[req_index] += *count as f64 / frequency[node] as f64;
                total_available[req_index] += *count;
            }
        }
        DistributionState {
            request,
            // An empty per-task shape stands for one processor.
            shapes: request.requests.iter().map(|r| r.shape.scaled(1)).collect(),
            node_tasks,
            frequency,
            weighted_available,
            total_available,
            assignments: vec![Vec::new(); req_count],
        }
    }

    fn tasks_got(&self, req_index: usize) -> u32 {
        self.assignments[req_index].iter().map(|n| n.tasks).sum()
    }
    fn tasks_missing(&self, req_index: usize) -> u32 {
        self.request.requests[req_index].required_tasks().saturating_sub(self.tasks_got(req_index))
    }
    fn nodes_missing(&self, req_index: usize) -> u32 {
        self.request.requests[req_index].node_count.saturating_sub(self.assignments[req_index].len() as u32)
    }
    fn is_satisfied(&self, req_index: usize) -> bool {
        self.tasks_missing(req_index) == 0 && self.nodes_missing(req_index) == 0
    }
    fn unsatisfied_count(&self) -> usize {
        (0..self.assignments.len()).filter(|i| !self.is_satisfied(*i)).count()
    }

    /// Tasks to take from a node offering `available` tasks to a sub-request: an even share of what is missing
    /// over the nodes still missing, and never more than needed.
    fn tasks_to_take(&self, req_index: usize, available: u32) -> u32 {
        let missing_tasks = self.tasks_missing(req_index);
        let missing_nodes = self.nodes_missing(req_index);
        let tasks = if missing_nodes > 0 {
            missing_tasks.div_ceil(missing_nodes).max(1)
        } else {
            missing_tasks
        };
        tasks.min(available)
    }

    /// Gives `tasks` tasks of `node` to a sub-request. The node stays available to the sub-requests using
    /// resource dimensions the assignment does not consume.
    fn assign(&mut self, node: NodeId, req_index: usize, tasks: u32) {
        trace!("Node {} gives {} tasks to req {}", node, tasks, req_index);
        self.assignments[req_index].push(NodeTasks::new(node, tasks));
        let frequency = self.frequency.get(&node).copied().unwrap_or(1).max(1) as f64;
        let shape = self.shapes[req_index];
        let Some(node_tasks) = self.node_tasks.get_mut(&node) else { return };
        for (k, count) in node_tasks.iter_mut().enumerate() {
            if *count == 0 || (k != req_index && !self.shapes[k].shares_dimension(&shape)) {
                continue;
            }
            self.weighted_available[k] -= *count as f64 / frequency;
            self.total_available[k] = self.total_available[k].saturating_sub(*count);
            *count = 0;
        }
        if node_tasks.iter().all(|c| *c == 0) {
            self.node_tasks.shift_remove(&node);
        }
    }

    /// Returns true if giving `node` to `req_index` would leave a contending sub-request unable to reach its target.
    fn starves_other(&self, node: NodeId, req_index: usize) -> bool {
        let Some(node_tasks) = self.node_tasks.get(&node) else { return false };
        let shape = self.shapes[req_index];
        node_tasks.iter().enumerate().any(|(j, count)| {
            if j == req_index || *count == 0 || !self.shapes[j].shares_dimension(&shape) {
                return false;
            }
            let missing = self.tasks_missing(j);
            missing > 0 && missing > self.total_available[j].saturating_sub(*count)
        })
    }

    fn hunger(&self, req_index: usize) -> f64 {
        self.tasks_missing(req_index).max(self.nodes_missing(req_index)) as f64 / self.weighted_available[req_index].max(1.0)
    }

    /// Chooses the sub-request a shared node goes to, or `None` if none may take it.
    fn select_request(&self, node: NodeId) -> Option<usize> {
        let node_tasks = self.node_tasks.get(&node)?;
        let candidates: Vec<usize> = (0..node_tasks.len())
            .filter(|i| node_tasks[*i] > 0 && !self.is_satisfied(*i))
            .collect();
        if candidates.len() == 1 {
            return candidates.first().copied();
        }
        let mut allowed: Vec<usize> = candidates.iter().copied().filter(|i| !self.starves_other(node, *i)).collect();
        if allowed.is_empty() {
            // Someone starves whatever the choice.
            allowed = candidates;
        }
        // With no more nodes than unsatisfied sub-requests, prefer a sub-request this node completes.
        if self.unsatisfied_count() >= self.node_tasks.len() {
            let completing: Vec<usize> = allowed
                .iter()
                .copied()
                .filter(|i| node_tasks[*i] >= self.tasks_missing(*i) && self.nodes_missing(*i) <= 1)
                .collect();
            if !completing.is_empty() {
                allowed = completing;
            }
        }
        allowed
            .into_iter()
            .fold(None::<(usize, f64)>, |best, i| {
                let hunger = self.hunger(i);
                match best {
                    Some((_, best_hunger)) if best_hunger >= hunger => best,
                    _ => Some((i, hunger)),
                }
            })
            .map(|(i, _)| i)
    }
}

/// Assigns the candidate nodes of every sub-request, most constrained nodes first.
///
/// `candidates[i]` lists, in candidate order, the tasks each node can provide to sub-request `i`.
/// Nodes usable by a single sub-request are forced to it. Nodes usable by several go to the hungriest one,
/// unless that would make another contending sub-request unable to reach its target.
/// Each sub-request only takes what it needs. Nothing is committed: the caller commits on success.
#[auto_bench_fct_hy]
pub fn distribute(
    request: &ReservationRequest,
    candidates: &[Vec<NodeTasks>],
    host_list: Option<&HostList>,
    partition: &str,
    start: i64,
) -> Result<Distribution> {
    let object = request.object_name();
    let insufficient = |what: &'static str, available: u32, required: u32| {
        info!(
            "inadequate {} located for {} at {} in partition {} ({} < {})",
            what, object, start, partition, available, required
        );
        Error::InsufficientResources {
            object: object.into(),
            what,
            time: start,
            partition: partition.into(),
            available,
            required,
        }
    };

    let mut state = DistributionState::new(request, candidates);

    if let Some(host_list) = host_list.filter(|h| h.mode == HostListMode::Exact) {
        if host_list.nodes.is_empty() {
            return Err(insufficient("hosts", 0, 1));
        }
        for wanted in &host_list.nodes {
            let available = state
                .node_tasks
                .get(&wanted.node)
                .and_then(|tasks| tasks.get(host_list.req_index).copied())
                .unwrap_or(0);
            if available < wanted.tasks || available == 0 {
                debug!("Host {} cannot provide {} tasks to {}", wanted.node, wanted.tasks, object);
                return Err(insufficient("tasks on requested host", available, wanted.tasks.max(1)));
            }
            state.assign(wanted.node, host_list.req_index, wanted.tasks.max(1));
        }
    }

    let max_frequency = state.frequency.values().copied().max().unwrap_or(0);
    for frequency in 1..=max_frequency {
        let bucket: Vec<NodeId> = state
            .frequency
            .iter()
            .filter(|(_, f)| **f == frequency)
            .map(|(node, _)| *node)
            .collect();
        for node in bucket {
            while let Some(req_index) = state.select_request(node) {
                let available = state.node_tasks.get(&node).map(|t| t[req_index]).unwrap_or(0);
                let tasks = state.tasks_to_take(req_index, available);
                if tasks == 0 {
                    break;
                }
                state.assign(node, req_index, tasks);
            }
        }
    }

    let mut partial = false;
    for (req_index, sub_request) in request.requests.iter().enumerate() {
        if state.assignments[req_index].is_empty() {
            return Err(insufficient("nodes", 0, sub_request.node_count.max(1)));
        }
        if !state.is_satisfied(req_index) {
            if request.sizing == SizingMode::Strict {
                if state.tasks_missing(req_index) > 0 {
                    return Err(insufficient("tasks", state.tasks_got(req_index), sub_request.required_tasks()));
                }
                return Err(insufficient("nodes", state.assignments[req_index].len() as u32, sub_request.node_count));
            }
            partial = true;
        }
    }
    debug!(
        "{} distributed over {} sub-requests{}",
        object,
        request.requests.len(),
        if partial { " (partial)" } else { "" }
    );
    Ok(Distribution {
        assignments: state.assignments,
        partial,
    })
}
