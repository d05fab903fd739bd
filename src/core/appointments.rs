use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::{
    model::{Appointment, AvailabilitySlot, ReservationRequest},
    types::{AppointmentId, CaregiverId, PatientId, ScheduleDate},
};

use super::{coordinator::AppointmentStore, indices::VecIndex, store::StoreError};

/// Append-only appointment records with patient, caregiver, and slot indices.
#[derive(Debug, Clone)]
pub struct AppointmentLedger {
    records: BTreeMap<AppointmentId, Appointment>,
    by_patient: VecIndex<PatientId>,
    by_caregiver: VecIndex<CaregiverId>,
    by_slot: HashMap<AvailabilitySlot, AppointmentId>,
    next_id: AppointmentId,
}

impl Default for AppointmentLedger {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            by_patient: VecIndex::new(),
            by_caregiver: VecIndex::new(),
            by_slot: HashMap::new(),
            next_id: 1,
        }
    }
}

impl AppointmentLedger {
    /// Creates an empty ledger starting at id 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new appointment and assigns its id.
    pub fn record(
        &mut self,
        date: ScheduleDate,
        vaccine_name: &str,
        caregiver_id: &str,
        patient_id: &str,
    ) -> Result<Appointment, StoreError> {
        let appointment = Appointment {
            id: self.next_id,
            date,
            vaccine_name: vaccine_name.to_string(),
            caregiver_id: caregiver_id.to_string(),
            patient_id: patient_id.to_string(),
        };
        self.insert_existing(appointment.clone())?;
        Ok(appointment)
    }

    /// Inserts an appointment that already carries an id, e.g. during replay.
    pub fn insert_existing(&mut self, appointment: Appointment) -> Result<(), StoreError> {
        if self.records.contains_key(&appointment.id) {
            return Err(StoreError::AlreadyExists(appointment.id));
        }
        let slot = appointment.slot();
        if self.by_slot.contains_key(&slot) {
            return Err(StoreError::SlotAlreadyBooked {
                caregiver_id: slot.caregiver_id,
                date: slot.date,
            });
        }

        let id = appointment.id;
        self.next_id = self.next_id.max(id.saturating_add(1));
        self.by_patient
            .entry(appointment.patient_id.clone())
            .or_default()
            .push(id);
        self.by_caregiver
            .entry(appointment.caregiver_id.clone())
            .or_default()
            .push(id);
        self.by_slot.insert(slot, id);
        self.records.insert(id, appointment);
        Ok(())
    }

    /// Appointment by id.
    pub fn get(&self, id: AppointmentId) -> Option<&Appointment> {
        self.records.get(&id)
    }

    /// Appointment that consumed the given slot, if any.
    pub fn booking_for(&self, caregiver_id: &str, date: ScheduleDate) -> Option<&Appointment> {
        let slot = AvailabilitySlot {
            date,
            caregiver_id: caregiver_id.to_string(),
        };
        self.by_slot.get(&slot).and_then(|id| self.records.get(id))
    }

    /// Appointments of a patient, ascending by id.
    pub fn list_by_patient(&self, patient_id: &str) -> Vec<Appointment> {
        Self::collect_sorted(&self.records, self.by_patient.get(patient_id))
    }

    /// Appointments in a caregiver's slots, ascending by id.
    pub fn list_by_caregiver(&self, caregiver_id: &str) -> Vec<Appointment> {
        Self::collect_sorted(&self.records, self.by_caregiver.get(caregiver_id))
    }

    /// Every appointment ordered by id.
    pub fn all(&self) -> Vec<Appointment> {
        self.records.values().cloned().collect()
    }

    /// Number of appointments.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing was booked.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Id the next recorded appointment receives.
    pub fn next_id(&self) -> AppointmentId {
        self.next_id
    }

    /// Moves the id counter forward to at least `next_id`.
    pub fn advance_next_id(&mut self, next_id: AppointmentId) {
        self.next_id = self.next_id.max(next_id);
    }

    /// Drops the most recently recorded appointment and hands its id back.
    /// Any other id is refused.
    pub fn remove_latest(&mut self, id: AppointmentId) -> Option<Appointment> {
        if id.saturating_add(1) != self.next_id {
            return None;
        }
        let appointment = self.records.remove(&id)?;
        Self::remove_from_vec_index(&mut self.by_patient, &appointment.patient_id, id);
        Self::remove_from_vec_index(&mut self.by_caregiver, &appointment.caregiver_id, id);
        self.by_slot.remove(&appointment.slot());
        self.next_id = id;
        Some(appointment)
    }

    fn remove_from_vec_index(index: &mut VecIndex<String>, key: &str, id: AppointmentId) {
        if let Some(ids) = index.get_mut(key) {
            ids.retain(|x| *x != id);
            if ids.is_empty() {
                index.remove(key);
            }
        }
    }

    fn collect_sorted(
        records: &BTreeMap<AppointmentId, Appointment>,
        ids: Option<&Vec<AppointmentId>>,
    ) -> Vec<Appointment> {
        let mut ids: Vec<AppointmentId> = ids.cloned().unwrap_or_default();
        ids.sort_unstable();
        ids.iter().filter_map(|id| records.get(id).cloned()).collect()
    }
}

impl AppointmentStore for AppointmentLedger {
    fn record(&mut self, request: &ReservationRequest, caregiver_id: &str) -> Result<Appointment, StoreError> {
        AppointmentLedger::record(
            self,
            request.date,
            &request.vaccine_name,
            caregiver_id,
            &request.patient_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_date;

    #[test]
    fn ids_are_monotonic_and_listings_are_ordered() {
        let d1 = parse_date("2024-03-01").expect("date");
        let d2 = parse_date("2024-03-02").expect("date");
        let mut ledger = AppointmentLedger::new();

        let a = ledger.record(d1, "moderna", "alice", "bob").expect("a");
        let b = ledger.record(d2, "pfizer", "carol", "bob").expect("b");
        let c = ledger.record(d2, "moderna", "alice", "dave").expect("c");

        assert_eq!((a.id, b.id, c.id), (1, 2, 3));
        let bob: Vec<_> = ledger.list_by_patient("bob").into_iter().map(|x| x.id).collect();
        assert_eq!(bob, vec![1, 2]);
        let alice: Vec<_> = ledger.list_by_caregiver("alice").into_iter().map(|x| x.id).collect();
        assert_eq!(alice, vec![1, 3]);
        assert!(ledger.list_by_patient("nobody").is_empty());
    }

    #[test]
    fn a_slot_is_booked_at_most_once() {
        let d = parse_date("2024-03-01").expect("date");
        let mut ledger = AppointmentLedger::new();
        ledger.record(d, "moderna", "alice", "bob").expect("first");

        let err = ledger.record(d, "moderna", "alice", "dave").expect_err("second");
        assert!(matches!(err, StoreError::SlotAlreadyBooked { .. }));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.booking_for("alice", d).map(|a| a.patient_id.as_str()), Some("bob"));
    }

    #[test]
    fn only_the_latest_appointment_can_be_removed() {
        let d = parse_date("2024-03-01").expect("date");
        let mut ledger = AppointmentLedger::new();
        let a = ledger.record(d, "moderna", "alice", "bob").expect("a");
        let b = ledger.record(d, "moderna", "carol", "bob").expect("b");

        assert_eq!(ledger.remove_latest(a.id), None);
        assert_eq!(ledger.remove_latest(b.id), Some(b.clone()));
        assert_eq!(ledger.next_id(), b.id);
        assert!(ledger.booking_for("carol", d).is_none());
        assert_eq!(ledger.list_by_patient("bob"), vec![a]);
        assert!(ledger.list_by_caregiver("carol").is_empty());

        let again = ledger.record(d, "moderna", "carol", "dave").expect("rebook");
        assert_eq!(again.id, b.id);
    }

    #[test]
    fn advancing_next_id_never_moves_it_back() {
        let mut ledger = AppointmentLedger::new();
        ledger.advance_next_id(10);
        ledger.advance_next_id(4);
        assert_eq!(ledger.next_id(), 10);
    }
}
