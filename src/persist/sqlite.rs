//! SQLite-backed op journal that also keeps the availability, vaccine, and
//! appointment relations current.
//!
//! Each batch of ops is written in one transaction: the journal rows plus
//! their effect on the relations. A reservation deletes exactly one slot row
//! and decrements exactly one dose, or the whole batch rolls back.

use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Transaction, params, types::Type};

use crate::{
    core::store::{SchedulerStore, StoreSnapshotV1},
    model::{Appointment, AvailabilitySlot, VaccineStock},
    op::{Op, StoredOp, StoredOpEnvelope},
    types::{AppointmentId, DATE_FORMAT, OpSeq, format_date},
};

use super::{OpSink, PersistError, PersistResult};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite implementation of [`crate::persist::OpSink`].
pub struct SqliteOpSink {
    conn: Connection,
}

impl SqliteOpSink {
    /// Opens or creates a SQLite-backed sink at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory SQLite sink.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    /// Loads store state from the relation tables.
    pub fn load_store(&self) -> PersistResult<SchedulerStore> {
        let snapshot = self.load_snapshot()?;
        Ok(SchedulerStore::from_snapshot(snapshot)?)
    }

    /// Rebuilds store state from the journal alone.
    pub fn replay_events(&self) -> PersistResult<SchedulerStore> {
        let mut store = SchedulerStore::new();
        for event in self.load_events_after(0)? {
            store.apply_replayed_op(event)?;
        }
        Ok(store)
    }

    /// Reads the relation tables into a snapshot.
    pub fn load_snapshot(&self) -> PersistResult<StoreSnapshotV1> {
        let slots = self.load_slots()?;
        let vaccines = self.load_vaccines()?;
        let appointments = self.load_appointments()?;
        let next_appointment_id = appointments
            .last()
            .map(|a| a.id.saturating_add(1))
            .unwrap_or(1);

        Ok(StoreSnapshotV1 {
            next_appointment_id,
            next_op_seq: self.latest_seq()?.saturating_add(1),
            slots,
            vaccines,
            appointments,
        })
    }

    /// Loads events strictly after `seq`.
    pub fn load_events_after(&self, seq: OpSeq) -> PersistResult<Vec<StoredOp>> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq, ts_ms, payload FROM events WHERE seq > ?1 ORDER BY seq ASC")?;

        let rows = stmt.query_map(params![seq as i64], |row| {
            let seq: i64 = row.get(0)?;
            let ts_ms: i64 = row.get(1)?;
            let payload: Vec<u8> = row.get(2)?;
            let mut op = decode_stored_op_payload(&payload).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    Type::Blob,
                    Box::new(std::io::Error::other(err)),
                )
            })?;
            op.seq = seq as OpSeq;
            op.ts_ms = ts_ms as u64;
            Ok(op)
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Returns the latest sequence persisted in the events table.
    pub fn latest_seq(&self) -> PersistResult<OpSeq> {
        let seq: Option<i64> = self
            .conn
            .query_row("SELECT MAX(seq) FROM events", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(seq.unwrap_or(0) as OpSeq)
    }

    /// Current dose count of `vaccine` as stored.
    pub fn doses(&self, vaccine: &str) -> PersistResult<Option<u32>> {
        let doses: Option<i64> = self
            .conn
            .query_row(
                "SELECT doses FROM vaccines WHERE name = ?1",
                params![vaccine],
                |row| row.get(0),
            )
            .optional()?;
        doses
            .map(|d| u32::try_from(d).map_err(|_| PersistError::Message(format!("negative doses for {vaccine}"))))
            .transpose()
    }

    fn load_slots(&self) -> PersistResult<Vec<AvailabilitySlot>> {
        let mut stmt = self
            .conn
            .prepare("SELECT date, caregiver FROM availabilities ORDER BY date ASC, caregiver ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(AvailabilitySlot {
                date: date_column(row, 0)?,
                caregiver_id: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn load_vaccines(&self) -> PersistResult<Vec<VaccineStock>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, doses FROM vaccines ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| {
            let doses: i64 = row.get(1)?;
            let doses = u32::try_from(doses)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Integer, Box::new(e)))?;
            Ok(VaccineStock {
                name: row.get(0)?,
                doses,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn load_appointments(&self) -> PersistResult<Vec<Appointment>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, date, vaccine, caregiver, patient FROM appointments ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            Ok(Appointment {
                id: id as AppointmentId,
                date: date_column(row, 1)?,
                vaccine_name: row.get(2)?,
                caregiver_id: row.get(3)?,
                patient_id: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl OpSink for SqliteOpSink {
    fn append_ops(&mut self, ops: &[StoredOp]) -> PersistResult<OpSeq> {
        if ops.is_empty() {
            return self.latest_seq();
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO events(seq, ts_ms, kind, payload) VALUES (?1, ?2, ?3, ?4)")?;
            for stored in ops {
                let payload = serde_json::to_vec(&StoredOpEnvelope::new(stored.clone()))?;
                stmt.execute(params![
                    stored.seq as i64,
                    stored.ts_ms as i64,
                    stored.op.kind(),
                    payload,
                ])?;
                apply_to_relations(&tx, &stored.op)?;
            }
        }
        tx.commit()?;

        Ok(ops.last().map(|o| o.seq).unwrap_or(0))
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }
}

fn apply_to_relations(tx: &Transaction<'_>, op: &Op) -> PersistResult<()> {
    match op {
        Op::SlotUploaded { slot } => {
            tx.execute(
                "INSERT OR IGNORE INTO availabilities(date, caregiver) VALUES (?1, ?2)",
                params![format_date(slot.date), slot.caregiver_id],
            )?;
        }
        Op::DosesAdded { vaccine, added } => {
            tx.execute(
                "INSERT INTO vaccines(name, doses) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET doses = doses + excluded.doses",
                params![vaccine, i64::from(*added)],
            )?;
        }
        Op::Reserved { appointment } => {
            let date = format_date(appointment.date);
            let removed = tx.execute(
                "DELETE FROM availabilities WHERE date = ?1 AND caregiver = ?2",
                params![date, appointment.caregiver_id],
            )?;
            if removed != 1 {
                return Err(PersistError::Message(format!(
                    "appointment {} consumed a slot that is not stored",
                    appointment.id
                )));
            }
            let taken = tx.execute(
                "UPDATE vaccines SET doses = doses - 1 WHERE name = ?1 AND doses > 0",
                params![appointment.vaccine_name],
            )?;
            if taken != 1 {
                return Err(PersistError::Message(format!(
                    "appointment {} consumed a dose that is not stored",
                    appointment.id
                )));
            }
            tx.execute(
                "INSERT INTO appointments(id, date, vaccine, caregiver, patient) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    appointment.id as i64,
                    date,
                    appointment.vaccine_name,
                    appointment.caregiver_id,
                    appointment.patient_id,
                ],
            )?;
        }
    }
    Ok(())
}

fn date_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn decode_stored_op_payload(payload: &[u8]) -> Result<StoredOp, String> {
    let envelope = serde_json::from_slice::<StoredOpEnvelope>(payload)
        .map_err(|e| format!("op payload decode failed: {e}"))?;
    if envelope.format_version != crate::op::OP_FORMAT_VERSION {
        return Err(format!(
            "unsupported op format version: {}",
            envelope.format_version
        ));
    }
    Ok(envelope.stored)
}
