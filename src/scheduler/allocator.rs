use crate::error::{Error, Result};
use crate::hooks::HooksHandler;
use crate::model::node::{NodeId, NodeSet};
use crate::model::request::{HostListMode, PartitionScope, ReservationRequest, SizingMode, StartMode, SubRequest};
use crate::model::reservation::{
    AllocatedNode, NodeTasks, Reservation, ReservationEvent, ReservationEventKind, ReservationFlags, ReservationKey,
    ReservationState,
};
use crate::platform::Platform;
use crate::scheduler::distribution::{distribute, Distribution, HostList};
use crate::scheduler::feasible::{FeasibleSet, FeasibleSetFinder, RangeQuery};
use crate::scheduler::host_expression::expand_host_expression;
use log::{debug, info, warn};

/// Maximum number of rounds spent aligning the start times of the sub-requests of a multi-req request.
const MAX_START_ROUNDS: usize = 16;
const ALL_PARTITIONS: &str = "ALL";
const RESERVATION_PREFIX: &str = "rsv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    Init,
    PartitionSelect,
    RangeSearch,
    Distribute,
    Commit,
    Committed,
    Failed,
}

/// A committed allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub key: ReservationKey,
    pub name: Box<str>,
    pub partition: Box<str>,
    pub start: i64,
    pub end: i64,
    pub allocated_tasks: u32,
    /// Fewer tasks than requested were allocated (best-effort sizing).
    pub partial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modification {
    ExtendTasks(u32),
    ShrinkTasks(u32),
    /// Adds the single node whose availability best fits the remaining reservation window.
    AddNode,
    /// Moves the tasks of a node to another node.
    ReplaceNode(NodeId),
}

/// Search outcome for one partition, before commit.
struct Placement {
    partition: Box<str>,
    start: i64,
    /// Tasks the partition can offer at `start`, summed over the sub-requests.
    feasible_tasks: u32,
    distribution: Distribution,
    partial: bool,
}

/// Host expression resolved for a request.
struct ResolvedHosts {
    nodes: NodeSet,
    mode: HostListMode,
    wanted: Vec<NodeTasks>,
}

/// Turns reservation requests into committed reservations, and modifies or releases them.
/// Nothing is written to the node timelines unless the commit step is reached.
pub struct ReservationAllocator<'a> {
    platform: &'a mut Platform,
    hooks: &'a dyn HooksHandler,
    state: AllocationState,
}

impl<'a> ReservationAllocator<'a> {
    pub fn new(platform: &'a mut Platform, hooks: &'a dyn HooksHandler) -> Self {
        ReservationAllocator {
            platform,
            hooks,
            state: AllocationState::Init,
        }
    }

    pub fn state(&self) -> AllocationState {
        self.state
    }

    fn transition(&mut self, object: &str, state: AllocationState) {
        debug!("{}: {:?} -> {:?}", object, self.state, state);
        self.state = state;
    }

    /// Allocates the request: partition selection, range search, distribution, then commit.
    pub fn allocate(&mut self, request: &ReservationRequest) -> Result<Allocation> {
        self.state = AllocationState::Init;
        let name: Box<str> = match &request.name {
            Some(name) => name.clone(),
            None => self.platform.next_reservation_name(RESERVATION_PREFIX),
        };
        let result = self.try_allocate(request, &name);
        match &result {
            Ok(allocation) => {
                self.transition(&name, AllocationState::Committed);
                info!(
                    "{} allocated in partition {} on [{}, {}) with {} tasks{}",
                    name,
                    allocation.partition,
                    allocation.start,
                    allocation.end,
                    allocation.allocated_tasks,
                    if allocation.partial { " (partial)" } else { "" }
                );
            }
            Err(e) => {
                self.transition(&name, AllocationState::Failed);
                info!("{} cannot be allocated: {}", name, e);
            }
        }
        result
    }

    fn try_allocate(&mut self, request: &ReservationRequest, name: &str) -> Result<Allocation> {
        self.validate(request, name)?;
        let mut request = request.clone();
        let hosts = self.resolve_hosts(&mut request, name)?;

        self.transition(name, AllocationState::PartitionSelect);
        let pools: Vec<(Box<str>, NodeSet)> = match &request.partition {
            PartitionScope::Named(partition) => match self.platform.partition(partition) {
                Some(nodes) => vec![(partition.clone(), nodes.clone())],
                None => return Err(Error::NotFound { what: "partition", name: partition.clone() }),
            },
            PartitionScope::All => vec![(ALL_PARTITIONS.into(), self.platform.all_nodes())],
            PartitionScope::Any => self
                .platform
                .partitions()
                .map(|(partition, nodes)| (Box::from(partition), nodes.clone()))
                .collect(),
        };
        if pools.is_empty() {
            return Err(Error::NotFound { what: "partition", name: "any".into() });
        }

        let mut best: Option<Placement> = None;
        let mut first_error = None;
        for (partition, pool) in &pools {
            match self.place(&request, name, partition, pool, hosts.as_ref()) {
                Ok(placement) => {
                    let better = best.as_ref().is_none_or(|b| placement.feasible_tasks > b.feasible_tasks);
                    if better {
                        best = Some(placement);
                    }
                }
                Err(e) => {
                    debug!("{} cannot be placed in partition {}: {}", name, partition, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        let Some(placement) = best else {
            return Err(first_error.unwrap_or_else(|| Error::NotFound { what: "partition", name: "any".into() }));
        };

        self.transition(name, AllocationState::Commit);
        self.commit(&request, name, placement)
    }

    fn validate(&self, request: &ReservationRequest, name: &str) -> Result<()> {
        let config = self.platform.config();
        if request.requests.is_empty() {
            return Err(Error::InvalidConfig { name: name.into(), reason: "no sub-request".to_string() });
        }
        if request.requests.len() > config.max_req_per_job {
            return Err(Error::CapacityExceeded {
                what: format!("sub-request count of {}", name),
                max: config.max_req_per_job,
            });
        }
        if request.duration <= 0 {
            return Err(Error::InvalidConfig { name: name.into(), reason: format!("invalid duration {}", request.duration) });
        }
        if self.platform.reservation_by_name(name).is_some() {
            return Err(Error::InvalidConfig { name: name.into(), reason: "a reservation with the same name already exists".to_string() });
        }
        if let Some(owner) = &request.owner {
            if !request.acl.is_empty() && !self.hooks.check_access(&request.acl, owner) {
                return Err(Error::PolicyViolation {
                    object: name.into(),
                    reason: format!("access denied to {}", owner),
                });
            }
        }
        Ok(())
    }

    /// Expands the host expression of the request. A host expression without task count reserves the whole hosts.
    /// An exact host list needs at least one task per listed host.
    fn resolve_hosts(&self, request: &mut ReservationRequest, name: &str) -> Result<Option<ResolvedHosts>> {
        let Some(expression) = request.host_expression.clone() else {
            return Ok(None);
        };
        let limit = request.requests.first().and_then(|r| (r.node_count > 0).then_some(r.node_count));
        let nodes = expand_host_expression(self.platform, &expression, limit)?;
        let host_count = nodes.len() as u32;
        let Some(sub_request) = request.requests.first_mut() else {
            return Ok(None);
        };
        if sub_request.task_count == 0 && sub_request.node_count == 0 {
            debug!("{} reserves {} whole hosts", name, host_count);
            sub_request.task_count = host_count;
            sub_request.tasks_per_node = Some(1);
            request.flags.exclusive = true;
            request.flags.ignore_state = true;
        }
        if request.host_list_mode == HostListMode::Exact && sub_request.task_count > 0 && sub_request.task_count < host_count {
            info!("{}: {} hosts listed for {} tasks", name, host_count, sub_request.task_count);
            return Err(Error::HostExpressionInvalid {
                expression: expression.clone(),
                reason: format!("{} hosts > {} tasks", host_count, sub_request.task_count),
            });
        }
        let base = sub_request.task_count / host_count.max(1);
        let extra = sub_request.task_count % host_count.max(1);
        let wanted = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| NodeTasks::new(node, base + u32::from((i as u32) < extra)))
            .collect();
        Ok(Some(ResolvedHosts {
            nodes,
            mode: request.host_list_mode,
            wanted,
        }))
    }

    fn candidates_for(pool: &NodeSet, sub_request: &SubRequest, hosts: Option<&ResolvedHosts>) -> NodeSet {
        match hosts {
            Some(hosts) if sub_request.index == 0 => match hosts.mode {
                HostListMode::Exact | HostListMode::Subset => pool & &hosts.nodes,
                HostListMode::Superset => pool | &hosts.nodes,
            },
            _ => pool.clone(),
        }
    }

    /// Range search and distribution of the request within one node pool.
    fn place(&mut self, request: &ReservationRequest, name: &str, partition: &str, pool: &NodeSet, hosts: Option<&ResolvedHosts>) -> Result<Placement> {
        let earliest = match self.hooks.earliest_start_time(request, partition) {
            Some(policy_start) => request.earliest_start.max(policy_start),
            None => request.earliest_start,
        };
        if request.start_mode == StartMode::Fixed && earliest > request.earliest_start {
            return Err(Error::PolicyViolation {
                object: name.into(),
                reason: format!("cannot start before {} in partition {}", earliest, partition),
            });
        }

        self.transition(name, AllocationState::RangeSearch);
        let candidates: Vec<NodeSet> = request.requests.iter().map(|r| Self::candidates_for(pool, r, hosts)).collect();
        let required = hosts.filter(|h| h.mode == HostListMode::Superset).map(|h| &h.nodes);
        let finder = FeasibleSetFinder::new(self.platform);

        let mut start = earliest;
        let mut sets: Vec<FeasibleSet> = Vec::new();
        for round in 0..MAX_START_ROUNDS {
            sets.clear();
            for (sub_request, candidates) in request.requests.iter().zip(&candidates) {
                let mut query = RangeQuery::new(name, sub_request, request.duration, start, partition)
                    .start_mode(request.start_mode)
                    .sizing(request.sizing)
                    .ignore_state(request.flags.ignore_state)
                    .exclusive(request.flags.exclusive)
                    .override_rsv_limit(request.flags.override_rsv_limit);
                if let Some(required) = required.filter(|_| sub_request.index == 0) {
                    query = query.required_nodes(required);
                }
                sets.push(finder.find_range(&query, candidates)?);
            }
            let latest = sets.iter().map(|s| s.start).max().unwrap_or(start);
            if sets.iter().all(|s| s.start == latest) {
                start = latest;
                break;
            }
            debug!("{}: sub-requests start between {} and {}, round {}", name, start, latest, round);
            start = latest;
            if round + 1 == MAX_START_ROUNDS {
                return Err(Error::NoFeasibleWindow {
                    object: name.into(),
                    partition: partition.into(),
                    reason: "sub-requests cannot be aligned on a common start".to_string(),
                });
            }
        }

        self.transition(name, AllocationState::Distribute);
        let per_request: Vec<Vec<NodeTasks>> = sets.iter().map(|s| s.nodes.clone()).collect();
        let host_list = hosts.filter(|h| h.mode == HostListMode::Exact).map(|h| HostList {
            req_index: 0,
            mode: HostListMode::Exact,
            nodes: h.wanted.clone(),
        });
        let distribution = distribute(request, &per_request, host_list.as_ref(), partition, start)?;
        let partial = distribution.partial || sets.iter().any(|s| s.partial);
        Ok(Placement {
            partition: partition.into(),
            start,
            feasible_tasks: sets.iter().map(|s| s.task_count).sum(),
            distribution,
            partial,
        })
    }

    fn commit(&mut self, request: &ReservationRequest, name: &str, placement: Placement) -> Result<Allocation> {
        let mut reservation = Reservation {
            name: name.into(),
            owner: request.owner.clone(),
            acl: request.acl.clone(),
            partition: placement.partition.clone(),
            start: placement.start,
            end: placement.start + request.duration,
            nodes: Vec::new(),
            shapes: request.requests.iter().map(|r| r.shape).collect(),
            required_tasks: request.total_tasks(),
            allocated_tasks: 0,
            flags: ReservationFlags {
                best_effort: request.sizing == SizingMode::BestEffort,
                space_flex: request.flags.space_flex,
                exclusive: request.flags.exclusive,
                shared: request.flags.shared,
                ignore_state: request.flags.ignore_state,
            },
            state: ReservationState::Idle,
            standing: request.standing.clone(),
            host_expression: request.host_expression.clone(),
            accounting_start: placement.start,
        };
        for (req_index, nodes) in placement.distribution.assignments.iter().enumerate() {
            for node in nodes {
                reservation.add_node_tasks(node.node, req_index, node.tasks);
            }
        }
        if let Err(reason) = self.hooks.check_limits(&reservation) {
            return Err(Error::PolicyViolation { object: name.into(), reason });
        }

        let (start, end, allocated_tasks) = (reservation.start, reservation.end, reservation.allocated_tasks);
        let key = self.platform.commit_reservation(reservation, request.flags.override_rsv_limit)?;
        let now = self.platform.now();
        self.hooks.notify(&ReservationEvent::new(ReservationEventKind::Created, name, now));
        if let Some(reservation) = self.platform.reservation(key) {
            if reservation.state == ReservationState::Active {
                self.hooks.notify(&ReservationEvent::new(ReservationEventKind::Started, name, now));
            }
            self.hooks.persist_reservation(reservation);
        }
        Ok(Allocation {
            key,
            name: name.into(),
            partition: placement.partition,
            start,
            end,
            allocated_tasks,
            partial: placement.partial,
        })
    }

    /// Destroys a reservation and its timeline entries.
    pub fn release(&mut self, key: ReservationKey) -> Result<Reservation> {
        let Some(reservation) = self.platform.remove_reservation(key) else {
            return Err(Error::NotFound { what: "reservation", name: format!("{:?}", key).into() });
        };
        info!("Reservation {} released", reservation.name);
        self.hooks
            .notify(&ReservationEvent::new(ReservationEventKind::Destroyed, &reservation.name, self.platform.now()));
        Ok(reservation)
    }

    /// Modifies the node allocation of a reservation. The reservation is left untouched on failure.
    pub fn modify(&mut self, key: ReservationKey, modification: Modification) -> Result<()> {
        let Some(reservation) = self.platform.reservation(key).cloned() else {
            return Err(Error::NotFound { what: "reservation", name: format!("{:?}", key).into() });
        };
        let name = reservation.name.clone();
        let now = self.platform.now();
        let (nodes, required_tasks) = match modification {
            Modification::ExtendTasks(tasks) => {
                let added = self.search_extension(&reservation, key, SubRequest::new(tasks, reservation.shape(0)), false)?;
                let mut nodes = reservation.nodes.clone();
                for node in added {
                    merge_node_tasks(&mut nodes, node.node, node.tasks);
                }
                (nodes, reservation.required_tasks + tasks)
            }
            Modification::ShrinkTasks(tasks) => {
                if tasks >= reservation.allocated_tasks {
                    return Err(Error::InvalidConfig {
                        name: name.clone(),
                        reason: format!("cannot remove {} of {} tasks", tasks, reservation.allocated_tasks),
                    });
                }
                let mut nodes = reservation.nodes.clone();
                let mut remaining = tasks;
                while remaining > 0 {
                    let Some(last) = nodes.last_mut() else { break };
                    let removed = last.tasks.min(remaining);
                    last.tasks -= removed;
                    remaining -= removed;
                    if last.tasks == 0 {
                        nodes.pop();
                    }
                }
                (nodes, reservation.required_tasks.saturating_sub(tasks))
            }
            Modification::AddNode => {
                let per_node = reservation.nodes.iter().map(|n| n.tasks).max().unwrap_or(1);
                let added = self.search_extension(&reservation, key, SubRequest::new(per_node, reservation.shape(0)), true)?;
                let mut nodes = reservation.nodes.clone();
                let mut tasks = 0;
                for node in added {
                    tasks += node.tasks;
                    merge_node_tasks(&mut nodes, node.node, node.tasks);
                }
                (nodes, reservation.required_tasks + tasks)
            }
            Modification::ReplaceNode(old) => {
                let tasks = reservation.tasks_on(old);
                if tasks == 0 {
                    return Err(Error::NotFound { what: "node of reservation", name: self.platform.node_name(old) });
                }
                let sub_request = SubRequest::new(tasks, reservation.shape(0)).node_count(1).min_tasks_per_node(tasks);
                let added = self.search_extension(&reservation, key, sub_request, false)?;
                let Some(replacement) = added.first() else {
                    return Err(Error::InsufficientResources {
                        object: name.clone(),
                        what: "nodes",
                        time: now,
                        partition: reservation.partition.clone(),
                        available: 0,
                        required: 1,
                    });
                };
                let nodes = reservation
                    .nodes
                    .iter()
                    .map(|n| if n.node == old { AllocatedNode { node: replacement.node, ..*n } } else { *n })
                    .collect();
                (nodes, reservation.required_tasks)
            }
        };

        self.platform.replace_allocation(key, nodes, false)?;
        if reservation.flags.space_flex && reservation.state == ReservationState::Active {
            self.hooks.notify(&ReservationEvent::new(
                ReservationEventKind::SegmentClosed {
                    start: reservation.accounting_start,
                    end: now,
                    tasks: reservation.allocated_tasks,
                },
                &name,
                now,
            ));
        }
        if let Some(updated) = self.platform.reservation_mut(key) {
            updated.required_tasks = required_tasks;
            if updated.flags.space_flex && updated.state == ReservationState::Active {
                updated.accounting_start = now;
            }
        }
        info!("Reservation {} modified ({:?})", name, modification);
        self.hooks.notify(&ReservationEvent::new(ReservationEventKind::Modified, &name, now));
        if let Some(updated) = self.platform.reservation(key) {
            self.hooks.persist_reservation(updated);
        }
        Ok(())
    }

    /// Searches nodes outside the reservation able to hold `sub_request` over the rest of the reservation window.
    fn search_extension(&self, reservation: &Reservation, key: ReservationKey, sub_request: SubRequest, max_end_range: bool) -> Result<Vec<NodeTasks>> {
        let start = reservation.start.max(self.platform.now());
        let duration = reservation.end - start;
        if duration <= 0 {
            return Err(Error::NoFeasibleWindow {
                object: reservation.name.clone(),
                partition: reservation.partition.clone(),
                reason: "the reservation has ended".to_string(),
            });
        }
        let pool = match self.platform.partition(&reservation.partition) {
            Some(nodes) => nodes.clone(),
            None => self.platform.all_nodes(),
        };
        // New nodes only, unless tasks are simply added.
        let candidates = if max_end_range || sub_request.node_count > 0 { &pool - &reservation.node_set() } else { pool };
        let sizing = if reservation.flags.best_effort { SizingMode::BestEffort } else { SizingMode::Strict };
        let mut query = RangeQuery::new(&reservation.name, &sub_request, duration, start, &reservation.partition)
            .sizing(sizing)
            .ignore_state(reservation.flags.ignore_state)
            .exclusive(reservation.flags.exclusive);
        if max_end_range {
            query = query.want_max_end_range();
        }
        let set = FeasibleSetFinder::new(self.platform).find_range(&query, &candidates)?;
        if max_end_range {
            return Ok(set.nodes);
        }
        let request = ReservationRequest {
            name: Some(reservation.name.clone()),
            owner: reservation.owner.clone(),
            acl: Vec::new(),
            requests: vec![sub_request.clone()],
            duration,
            earliest_start: start,
            start_mode: StartMode::Fixed,
            sizing,
            flags: Default::default(),
            partition: PartitionScope::Named(reservation.partition.clone()),
            host_expression: None,
            host_list_mode: HostListMode::Exact,
            standing: None,
        };
        let distribution = distribute(&request, &[set.nodes], None, &reservation.partition, start)?;
        if distribution.partial {
            warn!("Reservation {} only partially extended (key {:?})", reservation.name, key);
        }
        Ok(distribution.assignments.into_iter().next().unwrap_or_default())
    }
}

fn merge_node_tasks(nodes: &mut Vec<AllocatedNode>, node: NodeId, tasks: u32) {
    match nodes.iter_mut().find(|n| n.node == node && n.req_index == 0) {
        Some(allocated) => allocated.tasks += tasks,
        None => nodes.push(AllocatedNode { node, req_index: 0, tasks }),
    }
}
