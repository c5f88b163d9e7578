use crate::model::request::ReservationRequest;
use crate::model::reservation::{Reservation, ReservationEvent, ReservationKey};
use crate::model::standing::StandingReservation;
use crate::platform::Platform;

/// Seam towards the collaborators of the scheduling core: policy and limit engine, ACL engine,
/// preemption selector, event notifier and persistence.
/// Every hook has a permissive default so an implementation only overrides what it handles.
pub trait HooksHandler {
    /// Policy/limit engine. Returns the reason of the violation if the candidate reservation breaks a limit.
    fn check_limits(&self, _reservation: &Reservation) -> Result<(), String> {
        Ok(())
    }

    /// Policy/limit engine. Earliest time the request may start in the given partition, if constrained.
    fn earliest_start_time(&self, _request: &ReservationRequest, _partition: &str) -> Option<i64> {
        None
    }

    /// ACL engine. Returns true if `requester` is granted by `acl`.
    fn check_access(&self, _acl: &[Box<str>], _requester: &str) -> bool {
        true
    }

    /// Preemption selector. Returns the reservations that should be preempted so that `occupying` can gain `needed` tasks.
    fn select_preemptees(&self, _platform: &Platform, _occupying: &Reservation, _needed: u32) -> Vec<ReservationKey> {
        Vec::new()
    }

    /// Preempts the workload behind `victim`. Returns true if the victim's resources can be reclaimed.
    fn preempt(&self, _victim: &Reservation) -> bool {
        false
    }

    /// Event notifier. Informed of every reservation lifecycle transition.
    fn notify(&self, _event: &ReservationEvent) {}

    /// Persistence. Called after each successful commit or modification of a reservation.
    fn persist_reservation(&self, _reservation: &Reservation) {}

    /// Persistence. Called after each roll-over of a standing reservation.
    fn persist_standing(&self, _standing: &StandingReservation) {}
}

/// Hooks handler accepting everything and recording nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl HooksHandler for DefaultHooks {}
