//! Scheduling domain records.

use serde::{Deserialize, Serialize};

use crate::{
    core::store::StoreError,
    types::{AppointmentId, CaregiverId, PatientId, ScheduleDate},
};

/// One caregiver's openness to take one appointment on one date.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    /// Date the caregiver is available.
    pub date: ScheduleDate,
    /// Caregiver offering the slot.
    pub caregiver_id: CaregiverId,
}

/// Remaining inventory for one vaccine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaccineStock {
    /// Unique vaccine name.
    pub name: String,
    /// Doses left; never negative.
    pub doses: u32,
}

/// Completed reservation binding a patient, a slot, and a dose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    /// Store-assigned identifier.
    pub id: AppointmentId,
    /// Appointment date.
    pub date: ScheduleDate,
    /// Vaccine administered.
    pub vaccine_name: String,
    /// Caregiver whose slot was consumed.
    pub caregiver_id: CaregiverId,
    /// Patient who reserved.
    pub patient_id: PatientId,
}

impl Appointment {
    /// Slot this appointment consumed.
    pub fn slot(&self) -> AvailabilitySlot {
        AvailabilitySlot {
            date: self.date,
            caregiver_id: self.caregiver_id.clone(),
        }
    }
}

/// Payload of a reservation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    /// Patient asking for the appointment.
    pub patient_id: PatientId,
    /// Requested date.
    pub date: ScheduleDate,
    /// Requested vaccine.
    pub vaccine_name: String,
}

impl ReservationRequest {
    /// Builds a request from already-typed parts.
    pub fn new(patient_id: impl Into<String>, date: ScheduleDate, vaccine_name: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            date,
            vaccine_name: vaccine_name.into(),
        }
    }

    /// Rejects empty identifiers.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.patient_id.trim().is_empty() {
            return Err(StoreError::Validation("patient id must not be empty".to_string()));
        }
        if self.vaccine_name.trim().is_empty() {
            return Err(StoreError::Validation("vaccine name must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Result of uploading a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadOutcome {
    /// A new slot was created.
    Created,
    /// The slot was already open; nothing changed.
    AlreadyAvailable,
    /// The slot was already consumed by an appointment; nothing changed.
    AlreadyBooked,
}

/// Availability and stock as seen for one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleView {
    /// Date searched.
    pub date: ScheduleDate,
    /// Caregivers with an open slot, ascending.
    pub caregivers: Vec<CaregiverId>,
    /// Vaccines with at least one dose, ascending by name.
    pub vaccines: Vec<VaccineStock>,
}
