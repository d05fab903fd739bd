//! In-memory authoritative stores and the reservation coordinator.

/// Appointment ledger.
pub mod appointments;
/// Caregiver availability slots.
pub mod availability;
/// Reservation algorithm and the store seams it runs against.
pub mod coordinator;
/// Per-vaccine dose ledger.
pub mod doses;
/// Helper index aliases.
pub mod indices;
/// Combined scheduling store, snapshots, and replay.
pub mod store;
