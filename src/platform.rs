use crate::error::{Error, Result};
use crate::hooks::HooksHandler;
use crate::model::configuration::Configuration;
use crate::model::node::{Node, NodeBuilder, NodeId, NodeSet, ResourceShape};
use crate::model::reservation::{AllocatedNode, Reservation, ReservationEvent, ReservationEventKind, ReservationKey, ReservationState};
use crate::model::standing::StandingReservationState;
use crate::scheduler::range::RangeList;
use crate::scheduler::timeline::{Projection, TimelineEntry};
use indexmap::IndexMap;
use log::{debug, info};
use prettytable::{format, row, Table};
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use std::collections::HashMap;
use std::rc::Rc;

/// Explicit cluster-state context: nodes with their timelines, partitions, and the reservation arena.
/// Every scheduling component works on a `Platform` it is given, so independent contexts can coexist.
pub struct Platform {
    config: Rc<Configuration>,
    nodes: Vec<Node>,
    node_names: HashMap<Box<str>, NodeId>,
    partitions: IndexMap<Box<str>, NodeSet>,
    reservations: SlotMap<ReservationKey, Reservation>,
    reservation_counter: u64,
    now: i64,
}

/// Plain serializable state of the reservations and standing reservations, encoded by the persistence collaborator.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PlatformSnapshot {
    pub time: i64,
    pub reservation_counter: u64,
    pub reservations: Vec<Reservation>,
    pub standing: Vec<StandingReservationState>,
}

impl Platform {
    pub fn new(config: Configuration, now: i64) -> Self {
        Platform {
            config: Rc::new(config),
            nodes: Vec::new(),
            node_names: HashMap::new(),
            partitions: IndexMap::new(),
            reservations: SlotMap::with_key(),
            reservation_counter: 0,
            now,
        }
    }

    pub fn config(&self) -> &Rc<Configuration> {
        &self.config
    }
    pub fn now(&self) -> i64 {
        self.now
    }
    pub fn set_now(&mut self, now: i64) {
        self.now = now;
    }

    // --- Nodes and partitions ---

    pub fn add_partition(&mut self, name: &str) {
        self.partitions.entry(name.into()).or_default();
    }

    /// Adds a node to the cluster model and to its partition. Returns the node index.
    pub fn add_node(&mut self, builder: NodeBuilder) -> Result<NodeId> {
        if self.node_names.contains_key(builder.name()) {
            return Err(Error::InvalidConfig {
                name: builder.name().into(),
                reason: "a node with the same name already exists".to_string(),
            });
        }
        let id = self.nodes.len() as NodeId;
        let node = builder.build(id);
        self.partitions.entry(node.partition.clone()).or_default().insert(id);
        self.node_names.insert(node.name.clone(), id);
        self.nodes.push(node);
        Ok(id)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id as usize)
    }
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id as usize)
    }
    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.node_names.get(name).and_then(|id| self.node(*id))
    }
    pub fn node_name(&self, id: NodeId) -> Box<str> {
        self.node(id).map(|n| n.name.clone()).unwrap_or_else(|| format!("#{}", id).into())
    }

    pub fn partition(&self, name: &str) -> Option<&NodeSet> {
        self.partitions.get(name)
    }
    pub fn partitions(&self) -> impl Iterator<Item = (&str, &NodeSet)> {
        self.partitions.iter().map(|(name, nodes)| (name.as_ref(), nodes))
    }
    pub fn all_nodes(&self) -> NodeSet {
        if self.nodes.is_empty() {
            NodeSet::new()
        } else {
            NodeSet::from_iter([0..=(self.nodes.len() as u32 - 1)])
        }
    }

    // --- Reservations ---

    pub fn reservation(&self, key: ReservationKey) -> Option<&Reservation> {
        self.reservations.get(key)
    }
    pub(crate) fn reservation_mut(&mut self, key: ReservationKey) -> Option<&mut Reservation> {
        self.reservations.get_mut(key)
    }
    pub fn reservations(&self) -> impl Iterator<Item = (ReservationKey, &Reservation)> {
        self.reservations.iter()
    }
    pub fn reservation_by_name(&self, name: &str) -> Option<ReservationKey> {
        self.reservations.iter().find(|(_, r)| r.name.as_ref() == name).map(|(key, _)| key)
    }

    /// Next free reservation name with the given prefix. The counter only moves when a reservation gets committed,
    /// so a failed allocation does not consume a name.
    pub fn next_reservation_name(&self, prefix: &str) -> Box<str> {
        let mut counter = self.reservation_counter + 1;
        loop {
            let name = format!("{}.{}", prefix, counter);
            if self.reservation_by_name(&name).is_none() {
                return name.into();
            }
            counter += 1;
        }
    }

    /// Stores the reservation and inserts its timeline entries on every allocated node.
    /// Nothing is kept if an insertion fails.
    pub(crate) fn commit_reservation(&mut self, reservation: Reservation, override_ceiling: bool) -> Result<ReservationKey> {
        let nodes = reservation.nodes.clone();
        let (start, end) = (reservation.start, reservation.end);
        let key = self.reservations.insert(reservation);
        if let Err(e) = self.insert_entries(key, &nodes, start, end, override_ceiling) {
            self.reservations.remove(key);
            return Err(e);
        }
        self.reservation_counter += 1;
        if let Some(reservation) = self.reservations.get(key) {
            if reservation.is_active_at(self.now) {
                self.activate(key);
            }
        }
        Ok(key)
    }

    /// Inserts the timeline entries of `nodes` for an existing reservation. On failure, the entries inserted by this
    /// call are removed again.
    pub(crate) fn insert_entries(&mut self, key: ReservationKey, nodes: &[AllocatedNode], start: i64, end: i64, override_ceiling: bool) -> Result<()> {
        let Some(reservation) = self.reservations.get(key) else {
            return Err(Error::NotFound { what: "reservation", name: format!("{:?}", key).into() });
        };
        let occupancy = reservation.occupancy();
        let shapes = reservation.shapes.clone();
        let config = Rc::clone(&self.config);
        let mut inserted: Vec<NodeId> = Vec::new();
        for allocated in nodes {
            let entry = TimelineEntry {
                reservation: key,
                start,
                end,
                tasks: allocated.tasks,
                shape: shapes.get(allocated.req_index).copied().unwrap_or_default(),
                occupancy,
            };
            let result = match self.nodes.get_mut(allocated.node as usize) {
                Some(node) => node.insert_entry(&config, entry, override_ceiling),
                None => Err(Error::NotFound { what: "node", name: format!("#{}", allocated.node).into() }),
            };
            if let Err(e) = result {
                for id in inserted {
                    if let Some(node) = self.nodes.get_mut(id as usize) {
                        node.remove_last_entry(key);
                    }
                }
                return Err(e);
            }
            inserted.push(allocated.node);
        }
        Ok(())
    }

    /// Removes the reservation from the arena and its entries from every node timeline.
    pub(crate) fn remove_reservation(&mut self, key: ReservationKey) -> Option<Reservation> {
        if self.reservations.get(key).is_some_and(|r| r.state == ReservationState::Active) {
            self.deactivate(key);
        }
        let reservation = self.reservations.remove(key)?;
        for node in reservation.node_set().iter() {
            if let Some(node) = self.nodes.get_mut(node as usize) {
                node.remove_entries(key);
            }
        }
        Some(reservation)
    }

    /// Replaces the node allocation of a reservation and its timeline entries.
    /// The previous allocation is restored if the new one cannot be inserted.
    pub(crate) fn replace_allocation(&mut self, key: ReservationKey, nodes: Vec<AllocatedNode>, override_ceiling: bool) -> Result<()> {
        let Some(reservation) = self.reservations.get(key) else {
            return Err(Error::NotFound { what: "reservation", name: format!("{:?}", key).into() });
        };
        let active = reservation.state == ReservationState::Active;
        let (start, end) = (reservation.start, reservation.end);
        let previous = reservation.nodes.clone();
        if active {
            self.hold_capacity(key, false);
        }
        for allocated in &previous {
            if let Some(node) = self.nodes.get_mut(allocated.node as usize) {
                node.remove_entries(key);
            }
        }
        let result = self.insert_entries(key, &nodes, start, end, override_ceiling);
        let kept = if result.is_ok() { nodes } else { previous };
        if result.is_err() {
            self.insert_entries(key, &kept, start, end, true)?;
        }
        if let Some(reservation) = self.reservations.get_mut(key) {
            reservation.allocated_tasks = kept.iter().map(|n| n.tasks).sum();
            reservation.nodes = kept;
        }
        if active {
            self.hold_capacity(key, true);
        }
        result
    }

    fn activate(&mut self, key: ReservationKey) {
        if let Some(reservation) = self.reservations.get_mut(key) {
            reservation.state = ReservationState::Active;
            self.hold_capacity(key, true);
        }
    }

    fn deactivate(&mut self, key: ReservationKey) {
        if let Some(reservation) = self.reservations.get_mut(key) {
            reservation.state = ReservationState::Ended;
            self.hold_capacity(key, false);
        }
    }

    /// Dedicates (or releases) the node capacity consumed by the timeline entries of a reservation.
    fn hold_capacity(&mut self, key: ReservationKey, hold: bool) {
        let Some(reservation) = self.reservations.get(key) else { return };
        for id in reservation.node_set().iter() {
            if let Some(node) = self.nodes.get_mut(id as usize) {
                let consumed = node.timeline.consumption_of(key, &node.capacity.configured);
                if hold {
                    node.capacity.dedicate(&consumed);
                } else {
                    node.capacity.release(&consumed);
                }
            }
        }
    }

    /// Moves the clock to `now` and applies the reservation transitions it implies.
    /// Started reservations dedicate their node capacity. Ended reservations release it and lose their timeline
    /// entries; ended standing reservation instances stay in the arena until their template rolls them out.
    pub fn update_states(&mut self, now: i64, hooks: &dyn HooksHandler) {
        self.now = now;
        let keys: Vec<ReservationKey> = self.reservations.keys().collect();
        for key in keys {
            let Some(reservation) = self.reservations.get(key) else { continue };
            let (state, start, end) = (reservation.state, reservation.start, reservation.end);
            if state == ReservationState::Idle && start <= now && now < end {
                self.activate(key);
                hooks.notify(&ReservationEvent::new(ReservationEventKind::Started, &self.reservations[key].name, now));
            } else if state != ReservationState::Ended && end <= now {
                if state == ReservationState::Active {
                    self.deactivate(key);
                }
                let reservation = &mut self.reservations[key];
                reservation.state = ReservationState::Ended;
                let name = reservation.name.clone();
                let standing = reservation.standing.is_some();
                info!("Reservation {} ended at {}", name, end);
                hooks.notify(&ReservationEvent::new(ReservationEventKind::Ended, &name, now));
                if standing {
                    for id in self.reservations[key].node_set().iter() {
                        if let Some(node) = self.nodes.get_mut(id as usize) {
                            node.remove_entries(key);
                        }
                    }
                } else {
                    self.remove_reservation(key);
                }
            }
        }
    }

    /// Number of tasks of `shape` available over `[start, end)`, summed over `candidates`.
    /// Used to decide when a job could run without reserving anything.
    pub fn query_availability(&self, shape: &ResourceShape, start: i64, end: i64, candidates: &NodeSet) -> Result<RangeList> {
        let mut total = RangeList::new(self.config.max_ranges_per_series);
        let projection = Projection::new(*shape, start, end);
        for id in candidates.iter() {
            let Some(node) = self.node(id) else { continue };
            let series = node.project_availability(&projection, self.now, &self.config)?;
            total = total.accumulate(&series, 0)?.0;
        }
        Ok(total)
    }

    // --- Persistence ---

    pub fn snapshot(&self, standing: Vec<StandingReservationState>) -> PlatformSnapshot {
        PlatformSnapshot {
            time: self.now,
            reservation_counter: self.reservation_counter,
            reservations: self.reservations.values().cloned().collect(),
            standing,
        }
    }

    /// Replaces every reservation by the ones of the snapshot and rebuilds the node timelines.
    /// Returns the new key of each restored reservation by name.
    pub fn restore_reservations(&mut self, snapshot: &PlatformSnapshot) -> Result<HashMap<Box<str>, ReservationKey>> {
        let keys: Vec<ReservationKey> = self.reservations.keys().collect();
        for key in keys {
            self.remove_reservation(key);
        }
        let mut restored = HashMap::new();
        for reservation in &snapshot.reservations {
            if let Some(missing) = reservation.nodes.iter().find(|n| self.node(n.node).is_none()) {
                return Err(Error::NotFound { what: "node", name: format!("#{}", missing.node).into() });
            }
            let mut reservation = reservation.clone();
            let was_active = reservation.state == ReservationState::Active;
            if reservation.state != ReservationState::Ended {
                reservation.state = ReservationState::Idle;
            }
            let nodes = if reservation.state == ReservationState::Ended { Vec::new() } else { reservation.nodes.clone() };
            let name = reservation.name.clone();
            let (start, end) = (reservation.start, reservation.end);
            let key = self.reservations.insert(reservation);
            self.insert_entries(key, &nodes, start, end, true)?;
            if was_active {
                self.activate(key);
            }
            restored.insert(name, key);
        }
        self.reservation_counter = snapshot.reservation_counter;
        debug!("{} reservations restored", restored.len());
        Ok(restored)
    }

    // --- Diagnostics ---

    /// Builds a `Table` listing the nodes, their state and their reservation count.
    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_CLEAN);
        table.add_row(row![
            buFc->"Id",
            buFc->"Name",
            buFc->"Partition",
            buFc->"State",
            buFc->"Procs",
            buFc->"Memory",
            buFc->"Reservations"
        ]);
        for node in &self.nodes {
            table.add_row(row![
                node.id,
                node.name,
                node.partition,
                format!("{:?}", node.state),
                format!("{}/{}", node.capacity.available.procs, node.capacity.configured.procs),
                format!("{}/{}", node.capacity.available.memory, node.capacity.configured.memory),
                node.timeline.reservation_count()
            ]);
        }
        table
    }
}
