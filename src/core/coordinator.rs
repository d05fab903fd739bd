//! Reservation matching with compensating rollback.
//!
//! [`reserve`] drives a single reservation against three stores:
//!
//! 1. validate the request;
//! 2. list candidate caregivers for the date in ascending order;
//! 3. claim the first candidate whose slot can still be consumed, moving on
//!    to the next one when another request got there first;
//! 4. take one dose, restoring the claimed slot if none can be taken;
//! 5. record the appointment, restoring dose and slot if that fails.
//!
//! The function owns no locks. Callers make the whole sequence atomic by
//! holding exclusive access to all three stores for its duration, which is
//! what [`crate::core::store::SchedulerStore`] and the single-writer runtime
//! do.

use tracing::{debug, info, warn};

use crate::{
    model::{Appointment, ReservationRequest},
    types::{CaregiverId, ScheduleDate},
};

use super::store::StoreError;

/// Outcome of [`DoseStore::try_consume_one`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoseConsume {
    /// One dose was taken.
    Consumed,
    /// The vaccine has never been stocked.
    UnknownVaccine,
    /// The vaccine is known but has no doses left.
    Exhausted,
}

/// Slot side of a reservation.
pub trait SlotStore {
    /// Caregivers with an open slot on `date`, ascending.
    fn list_available(&self, date: ScheduleDate) -> Vec<CaregiverId>;
    /// Removes the slot; true only for the caller that removed it.
    fn consume(&mut self, caregiver_id: &str, date: ScheduleDate) -> bool;
    /// Re-opens a slot taken by [`SlotStore::consume`].
    fn restore(&mut self, caregiver_id: &str, date: ScheduleDate);
}

/// Dose side of a reservation.
pub trait DoseStore {
    /// Check-and-decrement as one step.
    fn try_consume_one(&mut self, vaccine: &str) -> DoseConsume;
    /// Gives back a dose taken by [`DoseStore::try_consume_one`].
    fn restore_one(&mut self, vaccine: &str);
}

/// Appointment side of a reservation.
pub trait AppointmentStore {
    /// Appends the appointment for `request` in the slot of `caregiver_id`.
    fn record(&mut self, request: &ReservationRequest, caregiver_id: &str) -> Result<Appointment, StoreError>;
}

/// Runs one reservation. On any error, the stores are left as they were.
pub fn reserve<S, D, A>(
    slots: &mut S,
    doses: &mut D,
    ledger: &mut A,
    request: &ReservationRequest,
) -> Result<Appointment, StoreError>
where
    S: SlotStore + ?Sized,
    D: DoseStore + ?Sized,
    A: AppointmentStore + ?Sized,
{
    request.validate()?;
    let date = request.date;
    let vaccine = request.vaccine_name.as_str();

    let candidates = slots.list_available(date);
    debug!(%date, candidates = candidates.len(), "reservation candidates");
    let Some(caregiver_id) = claim_slot(slots, &candidates, date) else {
        return Err(StoreError::NoAvailability { date });
    };

    match doses.try_consume_one(vaccine) {
        DoseConsume::Consumed => {}
        DoseConsume::UnknownVaccine => {
            slots.restore(&caregiver_id, date);
            warn!(caregiver = %caregiver_id, %date, vaccine, "unknown vaccine; slot restored");
            return Err(StoreError::UnknownVaccine {
                name: vaccine.to_string(),
            });
        }
        DoseConsume::Exhausted => {
            slots.restore(&caregiver_id, date);
            warn!(caregiver = %caregiver_id, %date, vaccine, "no doses left; slot restored");
            return Err(StoreError::InsufficientDoses {
                name: vaccine.to_string(),
            });
        }
    }

    match ledger.record(request, &caregiver_id) {
        Ok(appointment) => {
            info!(
                id = appointment.id,
                patient = %appointment.patient_id,
                caregiver = %appointment.caregiver_id,
                %date,
                vaccine,
                "appointment reserved"
            );
            Ok(appointment)
        }
        Err(err) => {
            doses.restore_one(vaccine);
            slots.restore(&caregiver_id, date);
            warn!(caregiver = %caregiver_id, %date, vaccine, error = %err, "recording failed; dose and slot restored");
            Err(err)
        }
    }
}

/// Consumes the first candidate slot still open. Each failed attempt drops
/// one candidate, so the loop ends after at most `candidates.len()` tries.
fn claim_slot<S>(slots: &mut S, candidates: &[CaregiverId], date: ScheduleDate) -> Option<CaregiverId>
where
    S: SlotStore + ?Sized,
{
    for candidate in candidates {
        if slots.consume(candidate, date) {
            return Some(candidate.clone());
        }
        debug!(caregiver = %candidate, %date, "slot taken by another request; trying next");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{appointments::AppointmentLedger, availability::AvailabilityStore, doses::DoseLedger},
        types::parse_date,
    };

    /// Lets a competing request consume the first `steal` slots right after
    /// the candidate list was read.
    struct RacingSlots {
        inner: AvailabilityStore,
        steal: usize,
    }

    impl SlotStore for RacingSlots {
        fn list_available(&self, date: ScheduleDate) -> Vec<CaregiverId> {
            self.inner.list_available(date)
        }

        fn consume(&mut self, caregiver_id: &str, date: ScheduleDate) -> bool {
            if self.steal > 0 {
                self.steal -= 1;
                assert!(self.inner.consume(caregiver_id, date));
            }
            self.inner.consume(caregiver_id, date)
        }

        fn restore(&mut self, caregiver_id: &str, date: ScheduleDate) {
            self.inner.upload(caregiver_id, date);
        }
    }

    struct BrokenLedger;

    impl AppointmentStore for BrokenLedger {
        fn record(&mut self, _request: &ReservationRequest, _caregiver_id: &str) -> Result<Appointment, StoreError> {
            Err(StoreError::Storage("disk full".to_string()))
        }
    }

    fn request(date: &str, vaccine: &str) -> ReservationRequest {
        ReservationRequest::new("bob", parse_date(date).expect("date"), vaccine)
    }

    #[test]
    fn lost_race_moves_on_to_next_candidate() {
        let req = request("2024-03-01", "moderna");
        let mut inner = AvailabilityStore::new();
        inner.upload("alice", req.date);
        inner.upload("carol", req.date);
        let mut slots = RacingSlots { inner, steal: 1 };
        let mut doses = DoseLedger::new();
        doses.add_doses("moderna", 1).expect("doses");
        let mut ledger = AppointmentLedger::new();

        let appt = reserve(&mut slots, &mut doses, &mut ledger, &req).expect("reserve");
        assert_eq!(appt.caregiver_id, "carol");
        assert!(slots.inner.is_empty());
        assert_eq!(doses.doses("moderna"), Some(0));
    }

    #[test]
    fn losing_every_race_is_no_availability() {
        let req = request("2024-03-01", "moderna");
        let mut inner = AvailabilityStore::new();
        inner.upload("alice", req.date);
        inner.upload("carol", req.date);
        let mut slots = RacingSlots { inner, steal: 2 };
        let mut doses = DoseLedger::new();
        doses.add_doses("moderna", 1).expect("doses");
        let mut ledger = AppointmentLedger::new();

        let err = reserve(&mut slots, &mut doses, &mut ledger, &req).expect_err("no slot");
        assert_eq!(err, StoreError::NoAvailability { date: req.date });
        assert_eq!(doses.doses("moderna"), Some(1));
        assert!(ledger.is_empty());
    }

    #[test]
    fn recording_failure_restores_dose_and_slot() {
        let req = request("2024-03-01", "moderna");
        let mut slots = AvailabilityStore::new();
        slots.upload("alice", req.date);
        let mut doses = DoseLedger::new();
        doses.add_doses("moderna", 2).expect("doses");

        let err = reserve(&mut slots, &mut doses, &mut BrokenLedger, &req).expect_err("broken");
        assert!(err.is_storage());
        assert_eq!(slots.list_available(req.date), vec!["alice".to_string()]);
        assert_eq!(doses.doses("moderna"), Some(2));
    }

    #[test]
    fn empty_vaccine_name_is_rejected_before_touching_stores() {
        let req = request("2024-03-01", "  ");
        let mut slots = AvailabilityStore::new();
        slots.upload("alice", req.date);
        let mut doses = DoseLedger::new();
        let mut ledger = AppointmentLedger::new();

        let err = reserve(&mut slots, &mut doses, &mut ledger, &req).expect_err("invalid");
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(slots.len(), 1);
    }
}
