use crate::error::{Error, Result};
use crate::model::node::{NodeId, NodeSet};
use crate::model::request::{SizingMode, StartMode, SubRequest};
use crate::model::reservation::{NodeTasks, ReservationKey};
use crate::platform::Platform;
use crate::scheduler::range::RangeList;
use crate::scheduler::timeline::Projection;
use auto_bench_fct::auto_bench_fct_hy;
use log::{debug, info, trace};

/// Parameters of a range search for one sub-request.
#[derive(Debug, Clone)]
pub struct RangeQuery<'a> {
    /// Name of the job or reservation the search is made for, used in messages.
    pub object: &'a str,
    pub request: &'a SubRequest,
    pub duration: i64,
    pub earliest_start: i64,
    pub start_mode: StartMode,
    pub sizing: SizingMode,
    pub partition: &'a str,
    /// Keep only the operational node whose availability at the earliest start ends first.
    pub want_max_end_range: bool,
    pub ignore_state: bool,
    pub exclusive: bool,
    /// Nodes that must all be available at the selected start.
    pub required_nodes: Option<&'a NodeSet>,
    /// Entries of this reservation are not counted as consumption.
    pub exclude: Option<ReservationKey>,
    pub override_rsv_limit: bool,
}

impl<'a> RangeQuery<'a> {
    pub fn new(object: &'a str, request: &'a SubRequest, duration: i64, earliest_start: i64, partition: &'a str) -> Self {
        RangeQuery {
            object,
            request,
            duration,
            earliest_start,
            start_mode: StartMode::Fixed,
            sizing: SizingMode::Strict,
            partition,
            want_max_end_range: false,
            ignore_state: false,
            exclusive: false,
            required_nodes: None,
            exclude: None,
            override_rsv_limit: false,
        }
    }
    pub fn start_mode(mut self, start_mode: StartMode) -> Self {
        self.start_mode = start_mode;
        self
    }
    pub fn sizing(mut self, sizing: SizingMode) -> Self {
        self.sizing = sizing;
        self
    }
    pub fn want_max_end_range(mut self) -> Self {
        self.want_max_end_range = true;
        self
    }
    pub fn ignore_state(mut self, ignore_state: bool) -> Self {
        self.ignore_state = ignore_state;
        self
    }
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
    pub fn required_nodes(mut self, nodes: &'a NodeSet) -> Self {
        self.required_nodes = Some(nodes);
        self
    }
    pub fn exclude(mut self, reservation: ReservationKey) -> Self {
        self.exclude = Some(reservation);
        self
    }
    pub fn override_rsv_limit(mut self, override_rsv_limit: bool) -> Self {
        self.override_rsv_limit = override_rsv_limit;
        self
    }
}

/// Outcome of a range search.
#[derive(Debug, Clone)]
pub struct FeasibleSet {
    /// Global start-time series: at `t`, the number of tasks available cluster-wide during `[t, t + duration)`.
    pub ranges: RangeList,
    pub start: i64,
    /// Tasks each candidate node can provide over `[start, start + duration)`, in candidate order.
    pub nodes: Vec<NodeTasks>,
    pub task_count: u32,
    pub node_count: u32,
    /// The search only succeeded because of best-effort sizing.
    pub partial: bool,
}

impl FeasibleSet {
    pub fn end(&self, duration: i64) -> i64 {
        self.start + duration
    }
}

/// Computes when and where a sub-request fits, out of the node timelines of a platform.
pub struct FeasibleSetFinder<'p> {
    platform: &'p Platform,
}

impl<'p> FeasibleSetFinder<'p> {
    pub fn new(platform: &'p Platform) -> Self {
        FeasibleSetFinder { platform }
    }

    /// Start-time series of a single node for the query, after per-node constraints.
    /// Returns `None` when the node cannot be used at all.
    fn node_ranges(&self, query: &RangeQuery, id: NodeId) -> Result<Option<RangeList>> {
        let platform = self.platform;
        let config = platform.config();
        let Some(node) = platform.node(id) else {
            return Ok(None);
        };
        if !query.request.matches(node) {
            trace!("Node {} cannot be used for {}: features/arch/os mismatch", node.name, query.object);
            return Ok(None);
        }
        if !query.override_rsv_limit && !node.has_rsv_room(config) {
            debug!("Node {} cannot be used for {}: reservation ceiling reached", node.name, query.object);
            return Ok(None);
        }
        // Fixed starts are searched over the whole horizon too, to tell a busy window from a too small pool.
        let search_end = query.earliest_start + config.scheduling_horizon + query.duration;
        let projection = Projection {
            ignore_state: query.ignore_state,
            exclusive: query.exclusive,
            exclude: query.exclude,
            ..Projection::new(query.request.shape, query.earliest_start, search_end)
        };
        let availability = node.project_availability(&projection, platform.now(), config)?;
        let mut starts = availability.start_windows(query.duration)?;
        starts.reduce(Some(query.earliest_start - 1));
        if let Some(tasks_per_node) = query.request.tasks_per_node {
            starts.limit_task_count(tasks_per_node);
        }
        starts.retain_at_least(query.request.min_tasks_per_node.max(1));
        if starts.is_empty() {
            trace!("Node {} cannot be used for {}: no availability", node.name, query.object);
            return Ok(None);
        }
        Ok(Some(starts))
    }

    /// Searches the candidate pool for a start time and a node set satisfying the query.
    #[auto_bench_fct_hy]
    pub fn find_range(&self, query: &RangeQuery, candidates: &NodeSet) -> Result<FeasibleSet> {
        let request = query.request;
        let capacity = self.platform.config().max_ranges_per_series;
        let needed_tasks = request.required_tasks().max(1);
        let needed_nodes = request.node_count;

        let mut per_node: Vec<(NodeId, RangeList)> = Vec::new();
        for id in candidates.iter() {
            if let Some(starts) = self.node_ranges(query, id)? {
                per_node.push((id, starts));
            }
        }

        if query.want_max_end_range {
            return self.select_max_end_range(query, &per_node);
        }

        let mut global = RangeList::new(capacity);
        let mut node_counts = RangeList::new(capacity);
        for (_, starts) in &per_node {
            global = global.accumulate(starts, needed_tasks)?.0;
            let mut present = starts.clone();
            present.limit_task_count(1);
            node_counts = node_counts.accumulate(&present, needed_nodes)?.0;
        }

        if let Some(required) = query.required_nodes {
            let mut mask: Option<RangeList> = None;
            for id in required.iter() {
                let Some((_, starts)) = per_node.iter().find(|(node, _)| *node == id) else {
                    info!(
                        "required node {} cannot be used for {} in partition {}",
                        self.platform.node_name(id),
                        query.object,
                        query.partition
                    );
                    return Err(self.insufficient(query, "nodes", 0, required.len() as u32));
                };
                mask = Some(match mask {
                    None => starts.clone(),
                    Some(mask) => mask.merge(starts, 1)?.0,
                });
            }
            if let Some(mask) = mask {
                let reference = (query.start_mode == StartMode::Fixed).then_some(query.earliest_start);
                global = global.intersect(&mask, reference)?;
                node_counts = node_counts.intersect(&mask, reference)?;
            }
        }
        if let Some(max_meta_tasks) = self.platform.config().max_meta_tasks {
            global.limit_task_count(max_meta_tasks);
        }

        if global.is_empty() {
            info!("no ranges found for {} in partition {}", query.object, query.partition);
            return Err(self.insufficient(query, "tasks", 0, needed_tasks));
        }

        let fits = |t: i64| global.tasks_at(t) >= needed_tasks && node_counts.tasks_at(t) >= needed_nodes;
        let start = match query.start_mode {
            StartMode::Fixed => query.earliest_start,
            StartMode::Earliest => {
                let mut points: Vec<i64> = global.ranges().iter().chain(node_counts.ranges()).map(|r| r.start).collect();
                points.sort_unstable();
                points.dedup();
                match points.iter().copied().find(|t| fits(*t)) {
                    Some(start) => start,
                    // Best effort: the first time offering the most tasks.
                    None => global
                        .ranges()
                        .iter()
                        .fold(None::<(i64, u32)>, |best, r| match best {
                            Some((_, tasks)) if tasks >= r.tasks => best,
                            _ => Some((r.start, r.tasks)),
                        })
                        .map(|(start, _)| start)
                        .unwrap_or(query.earliest_start),
                }
            }
        };

        let task_count = global.tasks_at(start);
        let node_count = node_counts.tasks_at(start);
        let partial = !fits(start);
        if partial {
            if query.sizing == SizingMode::Strict {
                if query.start_mode == StartMode::Fixed && global.max_tasks() >= needed_tasks {
                    info!(
                        "{} cannot start at {} in partition {}: {} tasks available, {} needed",
                        query.object, start, query.partition, task_count, needed_tasks
                    );
                    return Err(Error::NoFeasibleWindow {
                        object: query.object.into(),
                        partition: query.partition.into(),
                        reason: format!(
                            "inadequate tasks at requested start {} ({} < {}), earliest fit at {}",
                            start,
                            task_count,
                            needed_tasks,
                            global.earliest_start(needed_tasks).unwrap_or(start)
                        ),
                    });
                }
                if task_count < needed_tasks {
                    return Err(self.insufficient_at(query, "tasks", start, task_count, needed_tasks));
                }
                return Err(self.insufficient_at(query, "nodes", start, node_count, needed_nodes));
            }
            if task_count == 0 {
                return Err(self.insufficient_at(query, "tasks", start, 0, needed_tasks));
            }
            debug!(
                "best effort search for {} in partition {}: {} tasks on {} nodes ({} tasks needed)",
                query.object, query.partition, task_count, node_count, needed_tasks
            );
        }

        let nodes: Vec<NodeTasks> = per_node
            .iter()
            .map(|(id, starts)| NodeTasks::new(*id, starts.tasks_at(start)))
            .filter(|n| n.tasks > 0)
            .collect();
        trace!(
            "{} fits in partition {} at {} with {} tasks on {} nodes",
            query.object, query.partition, start, task_count, node_count
        );
        Ok(FeasibleSet {
            ranges: global,
            start,
            nodes,
            task_count,
            node_count,
            partial,
        })
    }

    /// Keeps the single operational node available at the earliest start whose availability ends first.
    fn select_max_end_range(&self, query: &RangeQuery, per_node: &[(NodeId, RangeList)]) -> Result<FeasibleSet> {
        let start = query.earliest_start;
        let best = per_node
            .iter()
            .filter(|(id, _)| self.platform.node(*id).is_some_and(|n| n.state.is_operational()))
            .filter_map(|(id, starts)| {
                let range = starts.ranges().iter().find(|r| r.contains(start))?;
                Some((*id, range.end, range.tasks, starts))
            })
            .min_by_key(|(_, end, _, _)| *end);
        let Some((id, _, tasks, starts)) = best else {
            info!("no node can be added to {} in partition {}", query.object, query.partition);
            return Err(self.insufficient_at(query, "nodes", start, 0, 1));
        };
        let tasks = tasks.min(query.request.required_tasks().max(1));
        Ok(FeasibleSet {
            ranges: starts.clone(),
            start,
            nodes: vec![NodeTasks::new(id, tasks)],
            task_count: tasks,
            node_count: 1,
            partial: false,
        })
    }

    fn insufficient(&self, query: &RangeQuery, what: &'static str, available: u32, required: u32) -> Error {
        self.insufficient_at(query, what, query.earliest_start, available, required)
    }

    fn insufficient_at(&self, query: &RangeQuery, what: &'static str, time: i64, available: u32, required: u32) -> Error {
        info!(
            "inadequate {} located for {} at {} in partition {} ({} < {})",
            what, query.object, time, query.partition, available, required
        );
        Error::InsufficientResources {
            object: query.object.into(),
            what,
            time,
            partition: query.partition.into(),
            available,
            required,
        }
    }
}
