use std::collections::{BTreeMap, BTreeSet};

use chrono::{Days, NaiveDate};
use proptest::prelude::*;

use vaxsched::{
    core::store::{SchedulerStore, StoreError},
    model::ReservationRequest,
    types::ScheduleDate,
};

const VACCINES: [&str; 3] = ["moderna", "pfizer", "janssen"];

#[derive(Debug, Clone)]
enum Action {
    Upload { caregiver: u8, day: u8 },
    AddDoses { vaccine: u8, n: i64 },
    Reserve { patient: u8, day: u8, vaccine: u8 },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0u8..6, 0u8..4).prop_map(|(caregiver, day)| Action::Upload { caregiver, day }),
        (0u8..3, -2i64..4).prop_map(|(vaccine, n)| Action::AddDoses { vaccine, n }),
        (0u8..8, 0u8..5, 0u8..4).prop_map(|(patient, day, vaccine)| Action::Reserve { patient, day, vaccine }),
    ]
}

fn date(day: u8) -> ScheduleDate {
    NaiveDate::from_ymd_opt(2024, 3, 1)
        .and_then(|d| d.checked_add_days(Days::new(u64::from(day))))
        .expect("date")
}

/// Index 3 is a vaccine that is never stocked.
fn vaccine(idx: u8) -> &'static str {
    VACCINES.get(usize::from(idx)).copied().unwrap_or("novavax")
}

proptest! {
    #[test]
    fn random_sequences_preserve_booking_and_stock_invariants(actions in prop::collection::vec(action_strategy(), 1..200)) {
        let mut store = SchedulerStore::new();
        let mut added: BTreeMap<&'static str, u64> = BTreeMap::new();

        for action in actions {
            match action {
                Action::Upload { caregiver, day } => {
                    let _ = store.upload(&format!("cg{caregiver}"), date(day));
                }
                Action::AddDoses { vaccine: v, n } => {
                    let name = vaccine(v);
                    match store.add_doses(name, n) {
                        Ok(_) => *added.entry(name).or_default() += n as u64,
                        Err(err) => prop_assert!(n < 0 && matches!(err, StoreError::Validation(_))),
                    }
                }
                Action::Reserve { patient, day, vaccine: v } => {
                    let name = vaccine(v);
                    let before = store.export_snapshot();
                    let req = ReservationRequest::new(format!("pt{patient}"), date(day), name);
                    match store.reserve(&req) {
                        Ok((appt, _)) => {
                            prop_assert_eq!(appt.caregiver_id.clone(), before_first_candidate(&before.slots, date(day)));
                        }
                        Err(_) => {
                            let after = store.export_snapshot();
                            prop_assert_eq!(&after.slots, &before.slots);
                            prop_assert_eq!(&after.vaccines, &before.vaccines);
                            prop_assert_eq!(&after.appointments, &before.appointments);
                        }
                    }
                }
            }

            let snapshot = store.export_snapshot();

            let mut booked = BTreeSet::new();
            for appt in &snapshot.appointments {
                prop_assert!(booked.insert((appt.date, appt.caregiver_id.clone())), "slot booked twice");
                prop_assert!(!store.has_slot(&appt.caregiver_id, appt.date), "booked slot still open");
            }

            for stock in &snapshot.vaccines {
                let name = stock.name.as_str();
                let used = snapshot
                    .appointments
                    .iter()
                    .filter(|a| a.vaccine_name == name)
                    .count() as u64;
                let total = added.get(name).copied().unwrap_or(0);
                prop_assert_eq!(u64::from(stock.doses) + used, total);
            }
        }
    }
}

fn before_first_candidate(slots: &[vaxsched::model::AvailabilitySlot], day: ScheduleDate) -> String {
    slots
        .iter()
        .filter(|s| s.date == day)
        .map(|s| s.caregiver_id.clone())
        .min()
        .unwrap_or_default()
}
