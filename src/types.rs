//! Shared primitive IDs and date parsing.

use chrono::NaiveDate;

use crate::core::store::StoreError;

/// Store-assigned appointment identifier.
pub type AppointmentId = u64;
/// Monotonic operation sequence number.
pub type OpSeq = u64;
/// Caregiver username.
pub type CaregiverId = String;
/// Patient username.
pub type PatientId = String;
/// Calendar date of a slot or appointment.
pub type ScheduleDate = NaiveDate;

/// Accepted textual date layout.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parses a `YYYY-MM-DD` date.
pub fn parse_date(raw: &str) -> Result<ScheduleDate, StoreError> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .map_err(|_| StoreError::Validation(format!("malformed date: {raw:?}")))
}

/// Formats a date the way [`parse_date`] reads it.
pub fn format_date(date: ScheduleDate) -> String {
    date.format(DATE_FORMAT).to_string()
}
