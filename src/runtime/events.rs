//! Runtime event stream payloads.

use crate::{
    model::AvailabilitySlot,
    types::{AppointmentId, OpSeq},
};

/// Events emitted from the single-writer runtime loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleEvent {
    /// A caregiver opened a new slot.
    SlotUploaded {
        /// Slot created.
        slot: AvailabilitySlot,
    },
    /// A vaccine's stock changed by an addition.
    DosesAdded {
        /// Vaccine name.
        vaccine: String,
        /// Dose count after the addition.
        doses: u32,
    },
    /// A reservation committed.
    Reserved {
        /// Recorded appointment id.
        id: AppointmentId,
    },
    /// Persistence has reached at least this op sequence.
    DurableUpTo {
        /// Highest sequence known durable.
        op_seq: OpSeq,
    },
}
