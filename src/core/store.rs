use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    model::{Appointment, AvailabilitySlot, ReservationRequest, ScheduleView, UploadOutcome, VaccineStock},
    op::{Op, StoredOp},
    types::{AppointmentId, CaregiverId, OpSeq, ScheduleDate},
};

use super::{
    appointments::AppointmentLedger,
    availability::AvailabilityStore,
    coordinator::{self, DoseConsume},
    doses::DoseLedger,
};

/// Failures of scheduling operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Malformed input; nothing changed.
    #[error("invalid request: {0}")]
    Validation(String),
    /// No caregiver slot could be claimed on the date; nothing changed.
    #[error("no caregiver available on {date}")]
    NoAvailability {
        /// Requested date.
        date: ScheduleDate,
    },
    /// The vaccine was never stocked; nothing changed.
    #[error("unknown vaccine: {name}")]
    UnknownVaccine {
        /// Requested vaccine.
        name: String,
    },
    /// The vaccine is out of doses; nothing changed.
    #[error("no doses left for {name}")]
    InsufficientDoses {
        /// Requested vaccine.
        name: String,
    },
    /// An appointment already holds this slot.
    #[error("slot of {caregiver_id} on {date} is already booked")]
    SlotAlreadyBooked {
        /// Caregiver of the slot.
        caregiver_id: CaregiverId,
        /// Date of the slot.
        date: ScheduleDate,
    },
    /// An appointment with this id already exists.
    #[error("appointment {0} already exists")]
    AlreadyExists(AppointmentId),
    /// The backing state is inconsistent or unreachable.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl StoreError {
    /// True for failures of the backing state rather than of the request.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::SlotAlreadyBooked { .. } | Self::AlreadyExists(_)
        )
    }
}

/// Serializable copy of the whole scheduling state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshotV1 {
    /// Id the next appointment will receive.
    pub next_appointment_id: AppointmentId,
    /// Sequence the next op receives.
    pub next_op_seq: OpSeq,
    /// Open slots ordered by date, then caregiver.
    pub slots: Vec<AvailabilitySlot>,
    /// Every known vaccine ordered by name.
    pub vaccines: Vec<VaccineStock>,
    /// Every appointment ordered by id.
    pub appointments: Vec<Appointment>,
}

/// Inverse of the most recent mutation.
#[derive(Debug, Clone)]
enum Undo {
    CloseSlot(AvailabilitySlot),
    TakeBackDoses { vaccine: String, added: u32, created: bool },
    Unbook(Appointment),
}

/// Authoritative slots, doses, and appointments plus the ops that changed them.
#[derive(Debug, Default)]
pub struct SchedulerStore {
    slots: AvailabilityStore,
    doses: DoseLedger,
    appointments: AppointmentLedger,
    pending_ops: Vec<StoredOp>,
    next_op_seq: OpSeq,
    last: Option<(OpSeq, Undo)>,
}

impl SchedulerStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            next_op_seq: 1,
            ..Self::default()
        }
    }

    /// Rebuilds a store from a snapshot, rejecting snapshots whose slots,
    /// appointments, and counters contradict each other.
    pub fn from_snapshot(snapshot: StoreSnapshotV1) -> Result<Self, StoreError> {
        let mut store = Self {
            next_op_seq: snapshot.next_op_seq.max(1),
            ..Self::default()
        };

        for stock in snapshot.vaccines {
            store.doses.add_doses(&stock.name, i64::from(stock.doses))?;
        }
        for appointment in snapshot.appointments {
            store.appointments.insert_existing(appointment)?;
        }
        for slot in snapshot.slots {
            if store.appointments.booking_for(&slot.caregiver_id, slot.date).is_some() {
                return Err(StoreError::Storage(format!(
                    "slot of {} on {} is both open and booked",
                    slot.caregiver_id, slot.date
                )));
            }
            store.slots.upload(&slot.caregiver_id, slot.date);
        }
        if snapshot.next_appointment_id < store.appointments.next_id() {
            return Err(StoreError::Storage(format!(
                "next appointment id {} is behind recorded appointments",
                snapshot.next_appointment_id
            )));
        }
        store.appointments.advance_next_id(snapshot.next_appointment_id);

        Ok(store)
    }

    /// Copies the current state into a snapshot.
    pub fn export_snapshot(&self) -> StoreSnapshotV1 {
        StoreSnapshotV1 {
            next_appointment_id: self.appointments.next_id(),
            next_op_seq: self.next_op_seq,
            slots: self.slots.slots(),
            vaccines: self.doses.stocks(),
            appointments: self.appointments.all(),
        }
    }

    /// Opens a slot for `caregiver_id` on `date`. Emits an op only when a slot
    /// was created.
    pub fn upload(
        &mut self,
        caregiver_id: &str,
        date: ScheduleDate,
    ) -> Result<(UploadOutcome, Option<StoredOp>), StoreError> {
        if caregiver_id.trim().is_empty() {
            return Err(StoreError::Validation("caregiver id must not be empty".to_string()));
        }
        if self.appointments.booking_for(caregiver_id, date).is_some() {
            return Ok((UploadOutcome::AlreadyBooked, None));
        }
        if !self.slots.upload(caregiver_id, date) {
            return Ok((UploadOutcome::AlreadyAvailable, None));
        }

        info!(caregiver = caregiver_id, %date, "availability uploaded");
        let slot = AvailabilitySlot {
            date,
            caregiver_id: caregiver_id.to_string(),
        };
        let stored = self.push_op(Op::SlotUploaded { slot: slot.clone() }, Undo::CloseSlot(slot));
        Ok((UploadOutcome::Created, Some(stored)))
    }

    /// Adds `n` doses to `vaccine`, creating it when absent. Returns the new count.
    pub fn add_doses(&mut self, vaccine: &str, n: i64) -> Result<(u32, StoredOp), StoreError> {
        let created = self.doses.doses(vaccine).is_none();
        let doses = self.doses.add_doses(vaccine, n)?;
        let added = u32::try_from(n)
            .map_err(|_| StoreError::Validation(format!("dose count too large: {n}")))?;

        info!(vaccine, added, doses, "doses added");
        let stored = self.push_op(
            Op::DosesAdded {
                vaccine: vaccine.to_string(),
                added,
            },
            Undo::TakeBackDoses {
                vaccine: vaccine.to_string(),
                added,
                created,
            },
        );
        Ok((doses, stored))
    }

    /// Books one slot and one dose for the request, or changes nothing.
    pub fn reserve(&mut self, request: &ReservationRequest) -> Result<(Appointment, StoredOp), StoreError> {
        let appointment = coordinator::reserve(
            &mut self.slots,
            &mut self.doses,
            &mut self.appointments,
            request,
        )?;
        let stored = self.push_op(
            Op::Reserved {
                appointment: appointment.clone(),
            },
            Undo::Unbook(appointment.clone()),
        );
        Ok((appointment, stored))
    }

    /// Undoes `stored`, which must be the last op this store emitted. The
    /// runtime calls this when the op could not be written durably, so the
    /// slot, dose, and appointment id it took become available again.
    pub fn revert(&mut self, stored: &StoredOp) -> Result<(), StoreError> {
        let latest = self.latest_op_seq();
        let undo = match self.last.take() {
            Some((seq, undo)) if seq == stored.seq && seq == latest => undo,
            other => {
                self.last = other;
                return Err(StoreError::Storage(format!(
                    "op {} is not the latest op and cannot be reverted",
                    stored.seq
                )));
            }
        };

        match undo {
            Undo::CloseSlot(slot) => {
                self.slots.consume(&slot.caregiver_id, slot.date);
            }
            Undo::TakeBackDoses {
                vaccine,
                added,
                created,
            } => self.doses.take_back(&vaccine, added, created),
            Undo::Unbook(appointment) => {
                if self.appointments.remove_latest(appointment.id).is_none() {
                    return Err(StoreError::Storage(format!(
                        "appointment {} is not the latest appointment",
                        appointment.id
                    )));
                }
                self.doses.restore_one(&appointment.vaccine_name);
                self.slots.upload(&appointment.caregiver_id, appointment.date);
            }
        }

        if self.pending_ops.last().is_some_and(|op| op.seq == stored.seq) {
            self.pending_ops.pop();
        }
        self.next_op_seq = stored.seq;
        warn!(seq = stored.seq, kind = stored.op.kind(), "op reverted");
        Ok(())
    }

    /// Applies a journaled op without emitting a new one.
    pub fn apply_replayed_op(&mut self, stored: StoredOp) -> Result<(), StoreError> {
        let seq = stored.seq;
        match stored.op {
            Op::SlotUploaded { slot } => {
                self.slots.upload(&slot.caregiver_id, slot.date);
            }
            Op::DosesAdded { vaccine, added } => {
                self.doses.add_doses(&vaccine, i64::from(added))?;
            }
            Op::Reserved { appointment } => {
                self.replay_reservation(appointment)?;
            }
        }
        self.bump_next_seq_from(seq);
        self.last = None;
        Ok(())
    }

    /// Caregivers open on `date`, ascending.
    pub fn list_available(&self, date: ScheduleDate) -> Vec<CaregiverId> {
        self.slots.list_available(date)
    }

    /// True when the slot is open.
    pub fn has_slot(&self, caregiver_id: &str, date: ScheduleDate) -> bool {
        self.slots.contains(caregiver_id, date)
    }

    /// Current count, or `None` for a vaccine never stocked.
    pub fn doses(&self, vaccine: &str) -> Option<u32> {
        self.doses.doses(vaccine)
    }

    /// Caregivers open on `date` and vaccines with doses left.
    pub fn search_schedule(&self, date: ScheduleDate) -> ScheduleView {
        ScheduleView {
            date,
            caregivers: self.slots.list_available(date),
            vaccines: self.doses.in_stock(),
        }
    }

    /// Appointment by id.
    pub fn appointment(&self, id: AppointmentId) -> Option<&Appointment> {
        self.appointments.get(id)
    }

    /// Appointments of a patient, ascending by id.
    pub fn appointments_for_patient(&self, patient_id: &str) -> Vec<Appointment> {
        self.appointments.list_by_patient(patient_id)
    }

    /// Appointments in a caregiver's slots, ascending by id.
    pub fn appointments_for_caregiver(&self, caregiver_id: &str) -> Vec<Appointment> {
        self.appointments.list_by_caregiver(caregiver_id)
    }

    /// Every appointment ordered by id.
    pub fn appointments(&self) -> Vec<Appointment> {
        self.appointments.all()
    }

    /// Takes ops emitted since the last drain.
    pub fn drain_pending_ops(&mut self) -> Vec<StoredOp> {
        std::mem::take(&mut self.pending_ops)
    }

    /// Sequence of the last op emitted or replayed, 0 when none.
    pub fn latest_op_seq(&self) -> OpSeq {
        self.next_op_seq.saturating_sub(1)
    }

    fn replay_reservation(&mut self, appointment: Appointment) -> Result<(), StoreError> {
        let date = appointment.date;
        if !self.slots.consume(&appointment.caregiver_id, date) {
            return Err(StoreError::Storage(format!(
                "replayed appointment {} has no open slot",
                appointment.id
            )));
        }
        if self.doses.try_consume_one(&appointment.vaccine_name) != DoseConsume::Consumed {
            self.slots.upload(&appointment.caregiver_id, date);
            return Err(StoreError::Storage(format!(
                "replayed appointment {} has no dose",
                appointment.id
            )));
        }
        if let Err(err) = self.appointments.insert_existing(appointment.clone()) {
            self.doses.restore_one(&appointment.vaccine_name);
            self.slots.upload(&appointment.caregiver_id, date);
            return Err(err);
        }
        Ok(())
    }

    fn push_op(&mut self, op: Op, undo: Undo) -> StoredOp {
        let seq = self.take_next_op_seq();
        let stored = StoredOp {
            seq,
            ts_ms: now_ms(),
            op,
        };
        self.pending_ops.push(stored.clone());
        self.last = Some((seq, undo));
        stored
    }

    fn take_next_op_seq(&mut self) -> OpSeq {
        let seq = self.next_op_seq;
        self.next_op_seq += 1;
        seq
    }

    fn bump_next_seq_from(&mut self, seq: OpSeq) {
        self.next_op_seq = self.next_op_seq.max(seq.saturating_add(1));
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
