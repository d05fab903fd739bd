use vaxsched::{
    core::store::{SchedulerStore, StoreError},
    model::{ReservationRequest, UploadOutcome, VaccineStock},
    op::Op,
    types::{ScheduleDate, parse_date},
};

fn day(raw: &str) -> ScheduleDate {
    parse_date(raw).expect("date")
}

fn request(patient: &str, date: &str, vaccine: &str) -> ReservationRequest {
    ReservationRequest::new(patient, day(date), vaccine)
}

#[test]
fn adding_doses_creates_then_accumulates() {
    let mut store = SchedulerStore::new();
    let (after_first, _) = store.add_doses("moderna", 5).expect("first");
    assert_eq!(after_first, 5);
    let (after_second, op) = store.add_doses("moderna", 3).expect("second");
    assert_eq!(after_second, 8);
    assert_eq!(store.doses("moderna"), Some(8));
    assert_eq!(
        op.op,
        Op::DosesAdded {
            vaccine: "moderna".to_string(),
            added: 3
        }
    );
}

#[test]
fn negative_doses_are_rejected_without_creating_the_vaccine() {
    let mut store = SchedulerStore::new();
    let err = store.add_doses("moderna", -2).expect_err("negative");
    assert!(matches!(err, StoreError::Validation(_)));
    assert_eq!(store.doses("moderna"), None);
    assert!(store.drain_pending_ops().is_empty());
}

#[test]
fn reservation_consumes_slot_and_dose() {
    let mut store = SchedulerStore::new();
    store.upload("alice", day("2024-03-01")).expect("upload");
    store.add_doses("moderna", 2).expect("doses");

    let (appt, op) = store
        .reserve(&request("bob", "2024-03-01", "moderna"))
        .expect("reserve");

    assert_eq!(appt.date, day("2024-03-01"));
    assert_eq!(appt.vaccine_name, "moderna");
    assert_eq!(appt.caregiver_id, "alice");
    assert_eq!(appt.patient_id, "bob");
    assert!(store.list_available(day("2024-03-01")).is_empty());
    assert_eq!(store.doses("moderna"), Some(1));
    assert_eq!(op.op, Op::Reserved { appointment: appt.clone() });
    assert_eq!(store.appointments_for_patient("bob"), vec![appt.clone()]);
    assert_eq!(store.appointments_for_caregiver("alice"), vec![appt]);
}

#[test]
fn no_slot_on_date_changes_nothing() {
    let mut store = SchedulerStore::new();
    store.upload("alice", day("2024-03-01")).expect("upload");
    store.add_doses("moderna", 2).expect("doses");
    let before = store.export_snapshot();

    let err = store
        .reserve(&request("bob", "2024-03-02", "moderna"))
        .expect_err("no slot");

    assert_eq!(err, StoreError::NoAvailability { date: day("2024-03-02") });
    assert!(store.appointments().is_empty());
    assert_eq!(store.export_snapshot(), before);
}

#[test]
fn unknown_vaccine_restores_the_claimed_slot() {
    let mut store = SchedulerStore::new();
    store.upload("alice", day("2024-03-01")).expect("upload");
    let before = store.export_snapshot();

    let err = store
        .reserve(&request("bob", "2024-03-01", "novavax"))
        .expect_err("unknown");

    assert_eq!(
        err,
        StoreError::UnknownVaccine {
            name: "novavax".to_string()
        }
    );
    assert_eq!(store.export_snapshot(), before);
    assert!(store.has_slot("alice", day("2024-03-01")));
}

#[test]
fn exhausted_vaccine_restores_the_claimed_slot() {
    let mut store = SchedulerStore::new();
    store.upload("alice", day("2024-03-01")).expect("upload");
    store.add_doses("moderna", 0).expect("doses");

    let err = store
        .reserve(&request("bob", "2024-03-01", "moderna"))
        .expect_err("exhausted");

    assert_eq!(
        err,
        StoreError::InsufficientDoses {
            name: "moderna".to_string()
        }
    );
    assert_eq!(store.list_available(day("2024-03-01")), vec!["alice".to_string()]);
    assert_eq!(store.doses("moderna"), Some(0));
}

#[test]
fn candidates_are_taken_in_ascending_order() {
    let mut store = SchedulerStore::new();
    let d = day("2024-03-01");
    for caregiver in ["zoe", "carol", "alice", "mike"] {
        store.upload(caregiver, d).expect("upload");
    }
    store.add_doses("pfizer", 10).expect("doses");

    let mut booked = Vec::new();
    for patient in ["p1", "p2", "p3", "p4"] {
        let (appt, _) = store
            .reserve(&ReservationRequest::new(patient, d, "pfizer"))
            .expect("reserve");
        booked.push(appt.caregiver_id);
    }
    assert_eq!(booked, vec!["alice", "carol", "mike", "zoe"]);

    let err = store
        .reserve(&ReservationRequest::new("p5", d, "pfizer"))
        .expect_err("none left");
    assert_eq!(err, StoreError::NoAvailability { date: d });
    assert_eq!(store.doses("pfizer"), Some(6));
}

#[test]
fn upload_twice_leaves_one_slot() {
    let mut store = SchedulerStore::new();
    let d = day("2024-03-01");
    let (first, op) = store.upload("alice", d).expect("first");
    let (second, none) = store.upload("alice", d).expect("second");

    assert_eq!(first, UploadOutcome::Created);
    assert!(op.is_some());
    assert_eq!(second, UploadOutcome::AlreadyAvailable);
    assert!(none.is_none());
    assert_eq!(store.list_available(d), vec!["alice".to_string()]);
    assert_eq!(store.export_snapshot().slots.len(), 1);
}

#[test]
fn booked_slot_cannot_be_reopened() {
    let mut store = SchedulerStore::new();
    let d = day("2024-03-01");
    store.upload("alice", d).expect("upload");
    store.add_doses("moderna", 5).expect("doses");
    store
        .reserve(&ReservationRequest::new("bob", d, "moderna"))
        .expect("reserve");

    let (outcome, op) = store.upload("alice", d).expect("re-upload");
    assert_eq!(outcome, UploadOutcome::AlreadyBooked);
    assert!(op.is_none());
    assert!(store.list_available(d).is_empty());
}

#[test]
fn empty_identifiers_are_validation_errors() {
    let mut store = SchedulerStore::new();
    let d = day("2024-03-01");
    assert!(matches!(store.upload("", d), Err(StoreError::Validation(_))));
    assert!(matches!(
        store.reserve(&ReservationRequest::new("", d, "moderna")),
        Err(StoreError::Validation(_))
    ));
    assert!(matches!(
        store.reserve(&ReservationRequest::new("bob", d, "")),
        Err(StoreError::Validation(_))
    ));
}

#[test]
fn search_lists_open_caregivers_and_vaccines_in_stock() {
    let mut store = SchedulerStore::new();
    let d = day("2024-03-01");
    store.upload("carol", d).expect("upload");
    store.upload("alice", d).expect("upload");
    store.upload("bert", day("2024-03-02")).expect("upload");
    store.add_doses("pfizer", 2).expect("doses");
    store.add_doses("janssen", 0).expect("doses");
    store.add_doses("moderna", 1).expect("doses");

    let view = store.search_schedule(d);
    assert_eq!(view.caregivers, vec!["alice".to_string(), "carol".to_string()]);
    assert_eq!(
        view.vaccines,
        vec![
            VaccineStock {
                name: "moderna".to_string(),
                doses: 1
            },
            VaccineStock {
                name: "pfizer".to_string(),
                doses: 2
            },
        ]
    );
}

#[test]
fn snapshot_restores_equivalent_store() {
    let mut store = SchedulerStore::new();
    let d = day("2024-03-01");
    store.upload("alice", d).expect("upload");
    store.upload("carol", d).expect("upload");
    store.add_doses("moderna", 3).expect("doses");
    store
        .reserve(&ReservationRequest::new("bob", d, "moderna"))
        .expect("reserve");

    let snapshot = store.export_snapshot();
    let mut restored = SchedulerStore::from_snapshot(snapshot.clone()).expect("restore");
    assert_eq!(restored.export_snapshot(), snapshot);

    let (appt, op) = restored
        .reserve(&ReservationRequest::new("dave", d, "moderna"))
        .expect("reserve after restore");
    assert_eq!(appt.id, 2);
    assert_eq!(appt.caregiver_id, "carol");
    assert_eq!(op.seq, snapshot.next_op_seq);
}

#[test]
fn snapshot_keeps_a_larger_next_appointment_id() {
    let mut store = SchedulerStore::new();
    store.upload("alice", day("2024-03-01")).expect("upload");
    store.add_doses("moderna", 1).expect("doses");

    let mut snapshot = store.export_snapshot();
    snapshot.next_appointment_id = 10;
    let mut restored = SchedulerStore::from_snapshot(snapshot).expect("restore");
    assert_eq!(restored.export_snapshot().next_appointment_id, 10);

    let (appt, _) = restored
        .reserve(&request("bob", "2024-03-01", "moderna"))
        .expect("reserve");
    assert_eq!(appt.id, 10);
}

#[test]
fn reverting_a_reservation_returns_slot_dose_and_id() {
    let mut store = SchedulerStore::new();
    store.upload("alice", day("2024-03-01")).expect("upload");
    store.add_doses("moderna", 1).expect("doses");
    let before = store.export_snapshot();

    let (appt, op) = store
        .reserve(&request("bob", "2024-03-01", "moderna"))
        .expect("reserve");
    store.revert(&op).expect("revert");

    assert_eq!(store.export_snapshot(), before);
    assert!(store.appointments_for_patient("bob").is_empty());
    assert_eq!(store.drain_pending_ops().len(), 2);

    let (again, again_op) = store
        .reserve(&request("dave", "2024-03-01", "moderna"))
        .expect("reserve again");
    assert_eq!(again.id, appt.id);
    assert_eq!(again_op.seq, op.seq);
}

#[test]
fn reverting_doses_and_uploads_undoes_them() {
    let mut store = SchedulerStore::new();
    let (_, created) = store.add_doses("moderna", 0).expect("create");
    store.revert(&created).expect("revert create");
    assert_eq!(store.doses("moderna"), None);

    store.add_doses("pfizer", 2).expect("doses");
    let (_, added) = store.add_doses("pfizer", 3).expect("more");
    store.revert(&added).expect("revert add");
    assert_eq!(store.doses("pfizer"), Some(2));

    let (_, uploaded) = store.upload("alice", day("2024-03-01")).expect("upload");
    let uploaded = uploaded.expect("new slot");
    store.revert(&uploaded).expect("revert upload");
    assert!(!store.has_slot("alice", day("2024-03-01")));
}

#[test]
fn only_the_latest_op_can_be_reverted() {
    let mut store = SchedulerStore::new();
    let (_, first) = store.add_doses("moderna", 2).expect("first");
    store.add_doses("moderna", 3).expect("second");

    let err = store.revert(&first).expect_err("older op");
    assert!(err.is_storage());
    assert_eq!(store.doses("moderna"), Some(5));
    assert_eq!(store.latest_op_seq(), 2);
}
