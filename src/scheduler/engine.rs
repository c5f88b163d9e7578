use crate::error::{Error, Result};
use crate::hooks::{DefaultHooks, HooksHandler};
use crate::model::configuration::StandingReservationConfig;
use crate::model::node::{NodeSet, ResourceShape};
use crate::model::request::ReservationRequest;
use crate::model::reservation::{Reservation, ReservationKey};
use crate::model::standing::{RefreshMode, StandingReservation, StandingReservationState};
use crate::platform::{Platform, PlatformSnapshot};
use crate::scheduler::allocator::{Allocation, Modification, ReservationAllocator};
use crate::scheduler::range::RangeList;
use crate::scheduler::standing::{check_config, StandingReservationScheduler};
use indexmap::IndexMap;
use log::{info, warn};

/// Entry point of the allocation core: owns the platform, the collaborator hooks and the standing reservations.
pub struct Scheduler {
    platform: Platform,
    hooks: Box<dyn HooksHandler>,
    standing: IndexMap<Box<str>, StandingReservation>,
}

impl Scheduler {
    pub fn new(platform: Platform) -> Self {
        Scheduler {
            platform,
            hooks: Box::new(DefaultHooks),
            standing: IndexMap::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: Box<dyn HooksHandler>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }
    pub fn platform_mut(&mut self) -> &mut Platform {
        &mut self.platform
    }
    pub fn hooks(&self) -> &dyn HooksHandler {
        self.hooks.as_ref()
    }

    // --- Reservations ---

    pub fn allocate(&mut self, request: &ReservationRequest) -> Result<Allocation> {
        ReservationAllocator::new(&mut self.platform, self.hooks.as_ref()).allocate(request)
    }

    pub fn modify(&mut self, key: ReservationKey, modification: Modification) -> Result<()> {
        ReservationAllocator::new(&mut self.platform, self.hooks.as_ref()).modify(key, modification)
    }

    /// Destroys a reservation, clearing the standing reservation slot holding it, if any.
    pub fn release(&mut self, key: ReservationKey) -> Result<Reservation> {
        let reservation = ReservationAllocator::new(&mut self.platform, self.hooks.as_ref()).release(key)?;
        if let Some(link) = &reservation.standing {
            if let Some(standing) = self.standing.get_mut(&link.template) {
                if let Some(index) = standing.slot_of(key) {
                    standing.instances[index] = None;
                }
            }
        }
        Ok(reservation)
    }

    pub fn query_availability(&self, shape: &ResourceShape, start: i64, end: i64, candidates: &NodeSet) -> Result<RangeList> {
        self.platform.query_availability(shape, start, end, candidates)
    }

    /// Moves the clock and applies the reservation state transitions it implies.
    pub fn update_states(&mut self, now: i64) {
        self.platform.update_states(now, self.hooks.as_ref());
    }

    // --- Standing reservations ---

    /// Creates the standing reservations declared in the platform configuration.
    /// Invalid templates are reported and skipped; the first error is returned once all are loaded.
    pub fn load_standing_reservations(&mut self) -> Result<()> {
        let templates = self.platform.config().standing_reservations.clone();
        let mut first_error = None;
        for (name, config) in templates {
            if let Err(e) = self.add_standing_reservation(&name, config) {
                warn!("Standing reservation {} ignored: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn add_standing_reservation(&mut self, name: &str, config: StandingReservationConfig) -> Result<()> {
        check_config(name, &config, self.platform.config(), &self.platform)?;
        if self.standing.contains_key(name) {
            return Err(Error::InvalidConfig {
                name: name.into(),
                reason: "a standing reservation with the same name already exists".to_string(),
            });
        }
        info!("Standing reservation {} added ({:?}, depth {})", name, config.period, config.depth);
        self.standing.insert(name.into(), StandingReservation::new(name, config));
        Ok(())
    }

    /// Removes a standing reservation and destroys its instances.
    pub fn remove_standing_reservation(&mut self, name: &str) -> Result<()> {
        let Some(mut standing) = self.standing.shift_remove(name) else {
            return Err(Error::NotFound { what: "standing reservation", name: name.into() });
        };
        StandingReservationScheduler::new(&mut self.platform, self.hooks.as_ref()).disable(&mut standing);
        info!("Standing reservation {} removed", name);
        Ok(())
    }

    pub fn standing_reservation(&self, name: &str) -> Option<&StandingReservation> {
        self.standing.get(name)
    }
    pub fn standing_reservations(&self) -> impl Iterator<Item = &StandingReservation> {
        self.standing.values()
    }

    fn with_standing<T>(&mut self, name: &str, f: impl FnOnce(&mut StandingReservationScheduler<'_>, &mut StandingReservation) -> T) -> Result<T> {
        let Some(standing) = self.standing.get_mut(name) else {
            return Err(Error::NotFound { what: "standing reservation", name: name.into() });
        };
        let mut scheduler = StandingReservationScheduler::new(&mut self.platform, self.hooks.as_ref());
        Ok(f(&mut scheduler, standing))
    }

    pub fn refresh(&mut self, name: &str, mode: RefreshMode) -> Result<()> {
        self.with_standing(name, |scheduler, standing| scheduler.refresh(standing, mode))?
    }

    /// Refreshes every standing reservation. Returns the last error, once all are refreshed.
    pub fn refresh_all(&mut self, mode: RefreshMode) -> Result<()> {
        let names: Vec<Box<str>> = self.standing.keys().cloned().collect();
        let mut last_error = None;
        for name in names {
            if let Err(e) = self.refresh(&name, mode) {
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn disable(&mut self, name: &str) -> Result<()> {
        self.with_standing(name, |scheduler, standing| scheduler.disable(standing))
    }

    pub fn enable(&mut self, name: &str) -> Result<()> {
        self.with_standing(name, |scheduler, standing| scheduler.enable(standing))?
    }

    // --- Persistence ---

    pub fn snapshot(&self) -> PlatformSnapshot {
        let standing = self
            .standing
            .values()
            .map(|s| StandingReservationState {
                name: s.name.clone(),
                period_start: s.period_start,
                disabled: s.disabled,
                instances: s
                    .instances
                    .iter()
                    .map(|key| key.and_then(|k| self.platform.reservation(k)).map(|r| r.name.clone()))
                    .collect(),
            })
            .collect();
        self.platform.snapshot(standing)
    }

    /// Restores the reservations of a snapshot and reattaches them to the standing reservations already loaded.
    pub fn restore(&mut self, snapshot: &PlatformSnapshot) -> Result<()> {
        let keys = self.platform.restore_reservations(snapshot)?;
        for state in &snapshot.standing {
            let Some(standing) = self.standing.get_mut(&state.name) else {
                warn!("Standing reservation {} of the snapshot is not configured anymore", state.name);
                continue;
            };
            standing.period_start = state.period_start;
            standing.disabled = state.disabled;
            let depth = standing.depth();
            standing.instances = state
                .instances
                .iter()
                .map(|name| name.as_ref().and_then(|n| keys.get(n).copied()))
                .chain(std::iter::repeat(None))
                .take(depth)
                .collect();
        }
        info!("Snapshot of {} restored", snapshot.time);
        Ok(())
    }
}
