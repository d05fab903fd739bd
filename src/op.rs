//! Mutation operation model and persistence wrappers.

use serde::{Deserialize, Serialize};

use crate::{
    model::{Appointment, AvailabilitySlot},
    types::OpSeq,
};

/// Version number for serialized [`StoredOpEnvelope`] payloads.
pub const OP_FORMAT_VERSION: u16 = 1;

/// Immutable operation appended to the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// A caregiver opened a slot.
    SlotUploaded {
        /// Slot created.
        slot: AvailabilitySlot,
    },
    /// Doses were added to a vaccine, creating it when absent.
    DosesAdded {
        /// Vaccine name.
        vaccine: String,
        /// Doses added.
        added: u32,
    },
    /// A reservation committed: the slot is gone, one dose is gone, and the
    /// appointment exists.
    Reserved {
        /// Recorded appointment.
        appointment: Appointment,
    },
}

impl Op {
    /// Short journal tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SlotUploaded { .. } => "slot_uploaded",
            Self::DosesAdded { .. } => "doses_added",
            Self::Reserved { .. } => "reserved",
        }
    }
}

/// Journal row metadata plus operation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOp {
    /// Monotonic operation sequence.
    pub seq: OpSeq,
    /// Operation timestamp in milliseconds.
    pub ts_ms: u64,
    /// Operation body.
    pub op: Op,
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOpEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped operation.
    pub stored: StoredOp,
}

impl StoredOpEnvelope {
    /// Constructs an envelope using [`OP_FORMAT_VERSION`].
    pub fn new(stored: StoredOp) -> Self {
        Self {
            format_version: OP_FORMAT_VERSION,
            stored,
        }
    }
}
