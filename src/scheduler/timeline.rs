/*
 * Copyright (c) 2025 Clément GRENNERAT
 *
 * This program is free software: you can redistribute it and/or modify it under the terms of the
 * GNU General Public License as published by the Free Software Foundation, version 3.
 * This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
 * even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
 * See the GNU General Public License for more details.
 * You should have received a copy of the GNU General Public License along with this program.
 * If not, see https://www.gnu.org/licenses/.
 *
 */

use crate::error::{Error, Result};
use crate::model::configuration::Configuration;
use crate::model::node::{Node, ResourceShape};
use crate::model::reservation::{Reservation, ReservationKey};
use crate::scheduler::range::{RangeList, TimeRange};
use auto_bench_fct::auto_bench_fct_hy;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

/// How a timeline entry consumes the node capacity.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Occupancy {
    /// Consumes `tasks` times the entry shape.
    Dedicated,
    /// Consumes the whole node.
    Exclusive,
    /// Overlay entry, consumes nothing.
    Shared,
}

/// A committed reservation interval on one node. The interval is `[start, end)`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub reservation: ReservationKey,
    pub start: i64,
    pub end: i64,
    pub tasks: u32,
    pub shape: ResourceShape,
    pub occupancy: Occupancy,
}

impl TimelineEntry {
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start < end && start < self.end
    }
    pub fn consumption(&self, configured: &ResourceShape) -> ResourceShape {
        match self.occupancy {
            Occupancy::Dedicated => self.shape.scaled(self.tasks),
            Occupancy::Exclusive => *configured,
            Occupancy::Shared => ResourceShape::default(),
        }
    }
}

/// Committed reservation intervals of a node. Insertion order is irrelevant, entries are sorted on demand.
#[derive(Debug, Clone, Default)]
pub struct NodeTimeline {
    entries: Vec<TimelineEntry>,
}

impl NodeTimeline {
    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }
    pub fn sorted_entries(&self) -> Vec<&TimelineEntry> {
        let mut entries: Vec<&TimelineEntry> = self.entries.iter().collect();
        entries.sort_by_key(|e| (e.start, e.end));
        entries
    }
    pub fn contains(&self, reservation: ReservationKey) -> bool {
        self.entries.iter().any(|e| e.reservation == reservation)
    }
    /// Number of distinct reservations holding an entry.
    pub fn reservation_count(&self) -> usize {
        let mut keys: Vec<ReservationKey> = self.entries.iter().map(|e| e.reservation).collect();
        keys.sort_unstable();
        keys.dedup();
        keys.len()
    }
    pub fn tasks_of(&self, reservation: ReservationKey) -> u32 {
        self.entries.iter().filter(|e| e.reservation == reservation).map(|e| e.tasks).sum()
    }

    /// Capacity consumed by the entries of `reservation`.
    pub fn consumption_of(&self, reservation: ReservationKey, configured: &ResourceShape) -> ResourceShape {
        self.entries
            .iter()
            .filter(|e| e.reservation == reservation)
            .fold(ResourceShape::default(), |acc, e| acc.saturating_add(&e.consumption(configured)))
    }

    /// Capacity consumed at `time`, ignoring the entries of `exclude`.
    pub fn consumed_at(&self, time: i64, configured: &ResourceShape, exclude: Option<ReservationKey>) -> ResourceShape {
        self.entries
            .iter()
            .filter(|e| Some(e.reservation) != exclude && e.start <= time && time < e.end)
            .fold(ResourceShape::default(), |acc, e| acc.saturating_add(&e.consumption(configured)))
    }
}

/// Result of the consistency check of a reservation on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeConsistency {
    /// The node is in a usable state and holds `tasks` tasks for the reservation.
    Valid { tasks: u32 },
    /// The node holds `tasks` tasks for the reservation but is not usable for it anymore.
    Invalid { tasks: u32 },
    /// The node holds no entry for the reservation.
    Missing,
}

/// Parameters of an availability projection.
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    pub shape: ResourceShape,
    pub start: i64,
    pub end: i64,
    pub ignore_state: bool,
    /// Only count time where the node carries no other consumption.
    pub exclusive: bool,
    /// Entries of this reservation are ignored.
    pub exclude: Option<ReservationKey>,
}

impl Projection {
    pub fn new(shape: ResourceShape, start: i64, end: i64) -> Self {
        Projection {
            shape,
            start,
            end,
            ignore_state: false,
            exclusive: false,
            exclude: None,
        }
    }
}

impl Node {
    /// Reservation count ceiling of this node.
    pub fn rsv_ceiling(&self, config: &Configuration) -> usize {
        config.rsv_ceiling(&self.partition)
    }

    /// Returns true if a new reservation can still be inserted on the node.
    pub fn has_rsv_room(&self, config: &Configuration) -> bool {
        self.timeline.reservation_count() < self.rsv_ceiling(config)
    }

    /// Appends a timeline entry. Fails if the node already holds its maximum number of reservations,
    /// unless `override_ceiling` is set or the reservation is already present on the node.
    pub fn insert_entry(&mut self, config: &Configuration, entry: TimelineEntry, override_ceiling: bool) -> Result<()> {
        if !override_ceiling && !self.timeline.contains(entry.reservation) && !self.has_rsv_room(config) {
            debug!(
                "Node {} cannot hold more reservations ({} max)",
                self.name,
                self.rsv_ceiling(config)
            );
            return Err(Error::CapacityExceeded {
                what: format!("reservation count of node {}", self.name),
                max: self.rsv_ceiling(config),
            });
        }
        trace!(
            "Node {}: entry [{}, {}) x{} inserted",
            self.name, entry.start, entry.end, entry.tasks
        );
        self.timeline.entries.push(entry);
        Ok(())
    }

    /// Deletes every entry owned by `reservation`. Returns the number of removed entries.
    pub fn remove_entries(&mut self, reservation: ReservationKey) -> usize {
        let before = self.timeline.entries.len();
        self.timeline.entries.retain(|e| e.reservation != reservation);
        before - self.timeline.entries.len()
    }

    /// Deletes the most recently inserted entry of `reservation`.
    pub fn remove_last_entry(&mut self, reservation: ReservationKey) -> Option<TimelineEntry> {
        let index = self.timeline.entries.iter().rposition(|e| e.reservation == reservation)?;
        Some(self.timeline.entries.remove(index))
    }

    /// Time until which the node is assumed unusable because of its state.
    /// `Some(i64::MAX)` means forever, `None` means the node is usable.
    pub fn unavailable_until(&self, now: i64, config: &Configuration) -> Option<i64> {
        let delay = if self.state.is_down() {
            config.node_down_state_delay_time
        } else if self.state.is_drained() {
            config.node_drain_state_delay_time
        } else {
            return None;
        };
        if delay < 0 { Some(i64::MAX) } else { Some(now.saturating_add(delay)) }
    }

    /// Projects the number of tasks of `projection.shape` the node can offer over `[projection.start, projection.end)`,
    /// taking into account the committed entries and the node state.
    #[auto_bench_fct_hy]
    pub fn project_availability(&self, projection: &Projection, now: i64, config: &Configuration) -> Result<RangeList> {
        let mut result = RangeList::new(config.max_ranges_per_series);
        let mut begin = projection.start;
        if !projection.ignore_state {
            if let Some(until) = self.unavailable_until(now, config) {
                begin = begin.max(until);
            }
        }
        let end = projection.end;
        if begin >= end {
            return Ok(result);
        }

        let configured = self.capacity.configured;
        let entries: Vec<&TimelineEntry> = self
            .timeline
            .entries
            .iter()
            .filter(|e| Some(e.reservation) != projection.exclude && e.overlaps(begin, end))
            .collect();
        let mut points: Vec<i64> = entries
            .iter()
            .flat_map(|e| [e.start, e.end])
            .filter(|t| *t > begin && *t < end)
            .chain([begin, end])
            .collect();
        points.sort_unstable();
        points.dedup();

        for window in points.windows(2) {
            let (start, stop) = (window[0], window[1]);
            let used = entries
                .iter()
                .filter(|e| e.overlaps(start, stop))
                .fold(ResourceShape::default(), |acc, e| acc.saturating_add(&e.consumption(&configured)));
            let tasks = if projection.exclusive && !used.is_empty() {
                0
            } else {
                configured.saturating_sub(&used).tasks_for(&projection.shape)
            };
            result.push(TimeRange::new(start, stop, tasks))?;
        }
        Ok(result)
    }

    /// Checks whether the entries of `reservation` on this node still reflect a usable node.
    /// A node that is not operational invalidates the reservation if the reservation has started, or if it starts
    /// while the node is assumed down or drained.
    /// A started reservation gets no grace, even with a zero delay for which projection treats the node as usable.
    pub fn check_consistency(&self, reservation: ReservationKey, rsv: &Reservation, now: i64, config: &Configuration) -> NodeConsistency {
        if !self.timeline.contains(reservation) {
            return NodeConsistency::Missing;
        }
        let tasks = self.timeline.tasks_of(reservation);
        if self.state.is_operational() {
            return NodeConsistency::Valid { tasks };
        }
        let within_delay = |delay: i64| delay < 0 || (delay > 0 && rsv.start <= now + delay);
        let invalid = rsv.start <= now
            || (self.state.is_down() && within_delay(config.node_down_state_delay_time))
            || (self.state.is_drained() && within_delay(config.node_drain_state_delay_time));
        if invalid {
            NodeConsistency::Invalid { tasks }
        } else {
            NodeConsistency::Valid { tasks }
        }
    }
}
