//! Vaccination slot reservation with atomic dose accounting and SQLite
//! journaling.
//!
//! # Examples
//!
//! In-memory usage with [`core::store::SchedulerStore`]:
//! ```
//! use vaxsched::{
//!     core::store::SchedulerStore,
//!     model::ReservationRequest,
//!     types::parse_date,
//! };
//!
//! let date = parse_date("2024-03-01").expect("date");
//! let mut store = SchedulerStore::new();
//! store.upload("alice", date).expect("upload");
//! store.add_doses("moderna", 5).expect("doses");
//!
//! let (appt, _op) = store
//!     .reserve(&ReservationRequest::new("bob", date, "moderna"))
//!     .expect("reserve");
//! assert_eq!(appt.caregiver_id, "alice");
//! assert_eq!(store.doses("moderna"), Some(4));
//! assert!(store.list_available(date).is_empty());
//! ```
//!
//! Runtime usage with SQLite sink:
//! ```no_run
//! use vaxsched::{
//!     core::store::SchedulerStore,
//!     persist::sqlite::SqliteOpSink,
//!     runtime::handle::{spawn_scheduler, AckMode, RuntimeConfig},
//!     session::Session,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sink = SqliteOpSink::open("schedule.db").expect("open sqlite");
//! let store = sink.load_store().unwrap_or_else(|_| SchedulerStore::new());
//! let cfg = RuntimeConfig { ack_mode: AckMode::Durable, ..RuntimeConfig::default() };
//! let handle = spawn_scheduler(store, Some(Box::new(sink)), cfg);
//!
//! let alice = Session::caregiver("alice");
//! handle.upload_availability(&alice, "2024-03-01").await.expect("upload");
//! handle.restock(&alice, "moderna", 10).await.expect("doses");
//!
//! let bob = Session::patient("bob");
//! let appt = handle.book(&bob, "2024-03-01", "moderna").await.expect("reserve");
//! println!("appointment {} with {}", appt.id, appt.caregiver_id);
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```
#![deny(missing_docs)]

/// In-memory stores and the reservation coordinator.
pub mod core;
/// Scheduling domain records.
pub mod model;
/// Mutation op model and persistence wrapper types.
pub mod op;
/// Persistence abstraction and SQLite implementation.
pub mod persist;
/// Single-writer runtime handle and events.
pub mod runtime;
/// Caller identity and role checks.
pub mod session;
/// Shared primitive types and date helpers.
pub mod types;
