use hashbrown::HashMap;

use crate::types::AppointmentId;

/// Secondary index from a key to appointment ids, in insertion order.
pub type VecIndex<K> = HashMap<K, Vec<AppointmentId>>;
