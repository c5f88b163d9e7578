use crate::error::{Error, Result};
use crate::hooks::HooksHandler;
use crate::model::configuration::{Configuration, StandingReservationConfig};
use crate::model::request::{HostListMode, PartitionScope, ReservationRequestBuilder, SizingMode, StartMode, SubRequest};
use crate::model::reservation::{ReservationEvent, ReservationEventKind, ReservationKey, ReservationState, StandingLink};
use crate::model::standing::{Period, RefreshMode, StandingReservation};
use crate::platform::Platform;
use crate::scheduler::allocator::ReservationAllocator;
use crate::scheduler::calendar::{next_period_begin, period_begin, period_length, slot_window};
use crate::scheduler::feasible::{FeasibleSetFinder, RangeQuery};
use crate::scheduler::host_expression::{expand_host_expression, HostExpression};
use crate::scheduler::timeline::NodeConsistency;
use log::{debug, info, trace, warn};

/// Keeps the instances of standing reservations materialized ahead of the current time.
pub struct StandingReservationScheduler<'a> {
    platform: &'a mut Platform,
    hooks: &'a dyn HooksHandler,
}

impl<'a> StandingReservationScheduler<'a> {
    pub fn new(platform: &'a mut Platform, hooks: &'a dyn HooksHandler) -> Self {
        StandingReservationScheduler { platform, hooks }
    }

    pub fn refresh(&mut self, standing: &mut StandingReservation, mode: RefreshMode) -> Result<()> {
        match mode {
            RefreshMode::Period => self.period_refresh(standing),
            RefreshMode::Iteration => self.iteration_refresh(standing),
        }
    }

    /// Rolls the elapsed periods out of the instance array, then allocates every empty slot.
    /// Returns the last allocation error, if any. Slots that could not be allocated stay empty.
    pub fn period_refresh(&mut self, standing: &mut StandingReservation) -> Result<()> {
        if standing.disabled {
            debug!("Standing reservation {} is disabled", standing.name);
            return Ok(());
        }
        let now = self.platform.now();
        let period = standing.config.period;
        let mut period_start = *standing.period_start.get_or_insert_with(|| period_begin(period, now));

        while period != Period::Infinity && next_period_begin(period, period_start) <= now {
            debug!("Standing reservation {}: period {} elapsed", standing.name, period_start);
            self.retire_instance(standing, 0);
            standing.instances.remove(0);
            standing.instances.push(None);
            period_start = next_period_begin(period, period_start);
        }
        standing.period_start = Some(period_start);
        standing.instances.resize(standing.depth(), None);

        let mut last_error = None;
        for index in 0..standing.depth() {
            if let Some(key) = standing.instances[index] {
                if self.platform.reservation(key).is_some() {
                    continue;
                }
                standing.instances[index] = None;
            }
            match self.configure_slot(standing, index) {
                Ok(key) => standing.instances[index] = key,
                Err(e) => {
                    warn!("Standing reservation {} slot {} cannot be created: {}", standing.name, index, e);
                    last_error = Some(e);
                }
            }
        }
        self.hooks.persist_standing(standing);
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Validates the live instances against the node states, healing the corrupted or incomplete ones.
    /// Corruption is handled here and never returned.
    pub fn iteration_refresh(&mut self, standing: &mut StandingReservation) -> Result<()> {
        if standing.disabled {
            return Ok(());
        }
        let now = self.platform.now();
        let mut last_error = None;
        for index in 0..standing.instances.len() {
            let Some(key) = standing.instances[index] else {
                if standing.period_start.is_some() {
                    if let Err(e) = self.reconfigure(standing, index) {
                        last_error = Some(e);
                    }
                }
                continue;
            };
            let Some(reservation) = self.platform.reservation(key) else {
                standing.instances[index] = None;
                if let Err(e) = self.reconfigure(standing, index) {
                    last_error = Some(e);
                }
                continue;
            };
            if reservation.state == ReservationState::Ended {
                continue;
            }

            if let Err(e) = self.check_reservation(key) {
                let name = reservation.name.clone();
                warn!("RESERVATIONCORRUPTION:  {}", e);
                self.hooks.notify(&ReservationEvent::new(ReservationEventKind::Corrupted, &name, now));
                self.destroy_instance(standing, index);
                if let Err(e) = self.reconfigure(standing, index) {
                    info!("Standing reservation {} slot {} cannot be recreated yet: {}", standing.name, index, e);
                }
                continue;
            }

            let rolled_back = index == 0
                && reservation.state == ReservationState::Idle
                && standing.config.rollback_offset.is_some_and(|offset| reservation.start < now + offset);
            if rolled_back {
                debug!("Standing reservation {}: rollback offset overlaps {}", standing.name, reservation.name);
                self.destroy_instance(standing, index);
                if let Err(e) = self.reconfigure(standing, index) {
                    last_error = Some(e);
                }
                continue;
            }

            if reservation.allocated_tasks < reservation.required_tasks {
                let needed = reservation.required_tasks - reservation.allocated_tasks;
                if self.preempt_for(key, needed) {
                    debug!("Standing reservation {}: room made for slot {}", standing.name, index);
                }
                if self.can_grow(standing, key) {
                    info!("Standing reservation {}: partial slot {} can get more tasks", standing.name, index);
                    self.destroy_instance(standing, index);
                    if let Err(e) = self.reconfigure(standing, index) {
                        last_error = Some(e);
                    }
                }
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Counts the tasks of the reservation still held by usable nodes.
    /// Fails with `Corruption` when they are fewer than the allocated ones.
    pub fn check_reservation(&self, key: ReservationKey) -> Result<u32> {
        let Some(reservation) = self.platform.reservation(key) else {
            return Err(Error::NotFound { what: "reservation", name: format!("{:?}", key).into() });
        };
        let now = self.platform.now();
        let config = self.platform.config();
        let mut detected = 0;
        for id in reservation.node_set().iter() {
            let Some(node) = self.platform.node(id) else { continue };
            match node.check_consistency(key, reservation, now, config) {
                NodeConsistency::Valid { tasks } => detected += tasks,
                NodeConsistency::Invalid { tasks } => {
                    debug!("Node {} is not usable anymore for {} ({} tasks)", node.name, reservation.name, tasks)
                }
                NodeConsistency::Missing => debug!("Node {} holds no entry for {}", node.name, reservation.name),
            }
        }
        if detected < reservation.allocated_tasks {
            return Err(Error::Corruption {
                reservation: reservation.name.clone(),
                required: reservation.required_tasks,
                detected,
            });
        }
        Ok(detected)
    }

    /// Destroys every instance and stops creating new ones until enabled again.
    pub fn disable(&mut self, standing: &mut StandingReservation) {
        info!("Standing reservation {} disabled", standing.name);
        standing.disabled = true;
        for index in 0..standing.instances.len() {
            self.destroy_instance(standing, index);
        }
        self.hooks.persist_standing(standing);
    }

    pub fn enable(&mut self, standing: &mut StandingReservation) -> Result<()> {
        info!("Standing reservation {} enabled", standing.name);
        standing.disabled = false;
        self.period_refresh(standing)
    }

    fn reconfigure(&mut self, standing: &mut StandingReservation, index: usize) -> Result<()> {
        let key = self.configure_slot(standing, index)?;
        standing.instances[index] = key;
        Ok(())
    }

    /// Allocates the instance of a slot. Returns `None` when the template does not apply to the slot period.
    fn configure_slot(&mut self, standing: &StandingReservation, index: usize) -> Result<Option<ReservationKey>> {
        let config = &standing.config;
        let now = self.platform.now();
        let Some(period_start) = standing.period_start else {
            return Ok(None);
        };
        let Some((mut start, end)) = slot_window(config, period_start, index, now) else {
            trace!("Standing reservation {} slot {} has no window", standing.name, index);
            return Ok(None);
        };
        if let Some(offset) = config.rollback_offset {
            start = start.max(now + offset);
            if start >= end {
                debug!("Standing reservation {} slot {} is rolled back past its end", standing.name, index);
                return Ok(None);
            }
        }
        if config.task_count == 0 && config.node_count == 0 && config.host_expression.is_none() {
            return Ok(None);
        }

        let name = self.platform.next_reservation_name(&standing.name);
        let mut sub_request = SubRequest::new(config.task_count, config.resources).node_count(config.node_count);
        for feature in &config.features {
            sub_request = sub_request.feature(feature);
        }
        let mut builder = ReservationRequestBuilder::new(end - start, start)
            .name(&name)
            .acl(config.acl.clone())
            .sub_request(sub_request)
            .start_mode(StartMode::Fixed)
            .sizing(if config.best_effort { SizingMode::BestEffort } else { SizingMode::Strict })
            .partition(match &config.partition {
                Some(partition) => PartitionScope::Named(partition.clone()),
                None => PartitionScope::Any,
            })
            .standing(StandingLink {
                template: standing.name.clone(),
                depth_index: index,
            });
        if let Some(owner) = &config.owner {
            builder = builder.owner(owner);
        }
        if config.exclusive {
            builder = builder.exclusive();
        }
        if config.ignore_state {
            builder = builder.ignore_state();
        }
        if let Some(expression) = &config.host_expression {
            builder = builder.host_expression(expression, HostListMode::Exact);
        }
        let request = builder.build();

        let allocation = ReservationAllocator::new(self.platform, self.hooks).allocate(&request)?;
        info!(
            "Standing reservation {} slot {} materialized as {} on [{}, {})",
            standing.name, index, allocation.name, allocation.start, allocation.end
        );
        Ok(Some(allocation.key))
    }

    /// Asks the preemption collaborator for room for `needed` more tasks. Returns true if something got preempted.
    fn preempt_for(&mut self, key: ReservationKey, needed: u32) -> bool {
        let Some(reservation) = self.platform.reservation(key) else { return false };
        let victims = self.hooks.select_preemptees(self.platform, reservation, needed);
        let mut preempted = false;
        for victim in victims.into_iter().filter(|v| *v != key) {
            let Some(victim_reservation) = self.platform.reservation(victim) else { continue };
            if !self.hooks.preempt(victim_reservation) {
                continue;
            }
            if let Some(removed) = self.platform.remove_reservation(victim) {
                info!("Reservation {} preempted", removed.name);
                self.hooks
                    .notify(&ReservationEvent::new(ReservationEventKind::Destroyed, &removed.name, self.platform.now()));
                preempted = true;
            }
        }
        preempted
    }

    /// Returns true if the window of a partial instance now offers more tasks than the instance holds,
    /// not counting its own entries.
    fn can_grow(&self, standing: &StandingReservation, key: ReservationKey) -> bool {
        let Some(reservation) = self.platform.reservation(key) else { return false };
        let start = reservation.start.max(self.platform.now());
        if start >= reservation.end {
            return false;
        }
        let pool = match &standing.config.host_expression {
            Some(expression) => match expand_host_expression(self.platform, expression, None) {
                Ok(nodes) => nodes,
                Err(_) => return false,
            },
            None => match self.platform.partition(&reservation.partition) {
                Some(nodes) => nodes.clone(),
                None => self.platform.all_nodes(),
            },
        };
        let sub_request = SubRequest::new(reservation.required_tasks, reservation.shape(0));
        let query = RangeQuery::new(&reservation.name, &sub_request, reservation.end - start, start, &reservation.partition)
            .sizing(SizingMode::BestEffort)
            .ignore_state(reservation.flags.ignore_state)
            .exclusive(reservation.flags.exclusive)
            .exclude(key);
        match FeasibleSetFinder::new(self.platform).find_range(&query, &pool) {
            Ok(set) => set.task_count > reservation.allocated_tasks,
            Err(e) => {
                trace!("Standing reservation {} instance {} cannot grow: {}", standing.name, reservation.name, e);
                false
            }
        }
    }

    fn destroy_instance(&mut self, standing: &mut StandingReservation, index: usize) {
        let Some(key) = standing.instances.get_mut(index).and_then(Option::take) else { return };
        if let Some(removed) = self.platform.remove_reservation(key) {
            debug!("Standing reservation {} instance {} destroyed", standing.name, removed.name);
            self.hooks
                .notify(&ReservationEvent::new(ReservationEventKind::Destroyed, &removed.name, self.platform.now()));
        }
    }

    /// Rolls a slot out. An instance still running is detached from the template and ends on its own.
    fn retire_instance(&mut self, standing: &mut StandingReservation, index: usize) {
        let Some(key) = standing.instances.get(index).copied().flatten() else { return };
        let now = self.platform.now();
        let running = self
            .platform
            .reservation(key)
            .is_some_and(|r| r.state != ReservationState::Ended && r.end > now);
        if running {
            if let Some(reservation) = self.platform.reservation_mut(key) {
                reservation.standing = None;
            }
            standing.instances[index] = None;
        } else {
            self.destroy_instance(standing, index);
        }
    }
}

/// Validates a standing reservation template.
pub fn check_config(name: &str, config: &StandingReservationConfig, global: &Configuration, platform: &Platform) -> Result<()> {
    let invalid = |reason: String| Err(Error::InvalidConfig { name: name.into(), reason });
    if config.depth == 0 || config.depth > global.max_srsv_depth {
        return invalid(format!("depth {} not in 1..={}", config.depth, global.max_srsv_depth));
    }
    if config.task_count == 0 && config.node_count == 0 && config.host_expression.is_none() {
        return invalid("a task count, node count or host expression is required".to_string());
    }
    if config.period != Period::Infinity {
        let length = period_length(config.period);
        let start = config.start_time.unwrap_or(0);
        if !(0..length).contains(&start) {
            return invalid(format!("start time {} outside of the {:?} period", start, config.period));
        }
        if let Some(end) = config.end_time {
            if end <= start || end > length {
                return invalid(format!("end time {} outside of ({}, {}]", end, start, length));
            }
        }
    }
    if config.duration.is_some_and(|d| d <= 0) {
        return invalid("duration must be positive".to_string());
    }
    if config.days.is_some() && config.period != Period::Day {
        return invalid("a day mask requires a daily period".to_string());
    }
    if let Some(expression) = &config.host_expression {
        HostExpression::parse(expression)?;
    }
    if let Some(partition) = &config.partition {
        if platform.partition(partition).is_none() {
            return invalid(format!("unknown partition {}", partition));
        }
    }
    if let (Some(enable), Some(disable)) = (config.enable_time, config.disable_time) {
        if enable >= disable {
            return invalid(format!("enable time {} is not before disable time {}", enable, disable));
        }
    }
    if config.period == Period::Infinity && config.depth > 1 {
        debug!("Standing reservation {}: infinite period, depth forced to 1", name);
    }
    Ok(())
}
