use std::collections::{BTreeMap, BTreeSet};

use crate::{
    model::AvailabilitySlot,
    types::{CaregiverId, ScheduleDate},
};

use super::coordinator::SlotStore;

/// Open caregiver slots keyed by date, caregivers kept in ascending order.
#[derive(Debug, Default, Clone)]
pub struct AvailabilityStore {
    by_date: BTreeMap<ScheduleDate, BTreeSet<CaregiverId>>,
    len: usize,
}

impl AvailabilityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a slot. Returns false when it was already open.
    pub fn upload(&mut self, caregiver_id: &str, date: ScheduleDate) -> bool {
        let inserted = self
            .by_date
            .entry(date)
            .or_default()
            .insert(caregiver_id.to_string());
        if inserted {
            self.len += 1;
        }
        inserted
    }

    /// True when the slot is open.
    pub fn contains(&self, caregiver_id: &str, date: ScheduleDate) -> bool {
        self.by_date
            .get(&date)
            .is_some_and(|set| set.contains(caregiver_id))
    }

    /// Caregivers open on `date`, ascending.
    pub fn list_available(&self, date: ScheduleDate) -> Vec<CaregiverId> {
        self.by_date
            .get(&date)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes the slot if present. Only the first caller for a pair sees true.
    pub fn consume(&mut self, caregiver_id: &str, date: ScheduleDate) -> bool {
        let Some(set) = self.by_date.get_mut(&date) else {
            return false;
        };
        let removed = set.remove(caregiver_id);
        if set.is_empty() {
            self.by_date.remove(&date);
        }
        if removed {
            self.len -= 1;
        }
        removed
    }

    /// All open slots ordered by date, then caregiver.
    pub fn slots(&self) -> Vec<AvailabilitySlot> {
        self.by_date
            .iter()
            .flat_map(|(date, set)| {
                set.iter().map(move |caregiver_id| AvailabilitySlot {
                    date: *date,
                    caregiver_id: caregiver_id.clone(),
                })
            })
            .collect()
    }

    /// Number of open slots.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no slot is open.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl SlotStore for AvailabilityStore {
    fn list_available(&self, date: ScheduleDate) -> Vec<CaregiverId> {
        AvailabilityStore::list_available(self, date)
    }

    fn consume(&mut self, caregiver_id: &str, date: ScheduleDate) -> bool {
        AvailabilityStore::consume(self, caregiver_id, date)
    }

    fn restore(&mut self, caregiver_id: &str, date: ScheduleDate) {
        self.upload(caregiver_id, date);
    }
}
