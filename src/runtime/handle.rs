use std::{collections::BTreeSet, sync::Arc};

use serde::Deserialize;
use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot},
    time::{Duration, Instant},
};
use tracing::{debug, warn};

use crate::{
    core::store::{SchedulerStore, StoreError, StoreSnapshotV1},
    model::{Appointment, AvailabilitySlot, ReservationRequest, ScheduleView, UploadOutcome},
    op::{Op, StoredOp},
    persist::{OpSink, PersistError},
    session::{Forbidden, Role, Session},
    types::{CaregiverId, OpSeq, ScheduleDate, parse_date},
};

use super::events::ScheduleEvent;

/// Failures surfaced by [`SchedulerHandle`].
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The store rejected the operation; nothing changed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The persistence queue or sink failed.
    #[error("persistence: {0}")]
    Persist(#[from] PersistError),
    /// The session's role does not allow the operation.
    #[error(transparent)]
    Forbidden(#[from] Forbidden),
    /// The runtime task stopped.
    #[error("scheduler runtime is gone")]
    ChannelClosed,
}

/// When a mutating call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// As soon as the in-memory store committed.
    #[default]
    InMemory,
    /// After the sink has written the op.
    Durable,
}

/// Runtime tuning. Deserializes from JSON with every field optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// When mutating calls return.
    pub ack_mode: AckMode,
    /// Write a batch as soon as it holds a reservation.
    pub flush_on_reserve: bool,
    /// Ops per sink batch.
    pub batch_max_ops: usize,
    /// Longest an op waits in a partial batch.
    pub batch_max_latency_ms: u64,
    /// Ops waiting for the sink; mutations are rejected once it is full.
    pub persist_queue_bound: usize,
    /// Pending calls before senders wait.
    pub command_queue_bound: usize,
    /// Broadcast buffer per subscriber.
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::InMemory,
            flush_on_reserve: true,
            batch_max_ops: 32,
            batch_max_latency_ms: 75,
            persist_queue_bound: 64,
            command_queue_bound: 256,
            event_capacity: 1024,
        }
    }
}

impl RuntimeConfig {
    /// Reads a JSON object; missing fields keep their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Cloneable front end of the scheduler task.
pub struct SchedulerHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<ScheduleEvent>,
}

impl Clone for SchedulerHandle {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            events_tx: self.events_tx.clone(),
        }
    }
}

enum Command {
    Upload {
        caregiver_id: CaregiverId,
        date: ScheduleDate,
        resp: oneshot::Sender<Result<UploadOutcome, RuntimeError>>,
    },
    AddDoses {
        vaccine: String,
        n: i64,
        resp: oneshot::Sender<Result<u32, RuntimeError>>,
    },
    Reserve {
        request: ReservationRequest,
        resp: oneshot::Sender<Result<Appointment, RuntimeError>>,
    },
    ListAvailable {
        date: ScheduleDate,
        resp: oneshot::Sender<Vec<CaregiverId>>,
    },
    Search {
        date: ScheduleDate,
        resp: oneshot::Sender<ScheduleView>,
    },
    Doses {
        vaccine: String,
        resp: oneshot::Sender<Option<u32>>,
    },
    ByPatient {
        patient_id: String,
        resp: oneshot::Sender<Vec<Appointment>>,
    },
    ByCaregiver {
        caregiver_id: String,
        resp: oneshot::Sender<Vec<Appointment>>,
    },
    Snapshot {
        resp: oneshot::Sender<StoreSnapshotV1>,
    },
    Flush {
        resp: oneshot::Sender<Result<OpSeq, RuntimeError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

enum PersistMsg {
    Op(StoredOp),
    /// Writes the buffer, then answers whether every op up to `up_to` is durable.
    Flush {
        up_to: OpSeq,
        resp: oneshot::Sender<Result<OpSeq, PersistError>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Starts the single writer that owns `store`. Every mutation runs to
/// completion inside this task, so no caller sees a half-applied reservation.
pub fn spawn_scheduler(
    store: SchedulerStore,
    sink: Option<Box<dyn OpSink>>,
    config: RuntimeConfig,
) -> SchedulerHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(config.command_queue_bound.max(1));
    let (events_tx, _) = broadcast::channel::<ScheduleEvent>(config.event_capacity.max(1));

    let (persist_tx_opt, mut durable_rx) = if let Some(sink) = sink {
        let (persist_tx, persist_rx) = mpsc::channel::<PersistMsg>(config.persist_queue_bound.max(1));
        let (durable_tx, durable_rx) = mpsc::unbounded_channel::<Result<OpSeq, PersistError>>();
        spawn_persistence_worker(sink, persist_rx, durable_tx, config.clone());
        (Some(persist_tx), Some(durable_rx))
    } else {
        (None, None)
    };

    let events_tx_loop = events_tx.clone();

    tokio::spawn(async move {
        let mut store = store;

        loop {
            if let Some(rx) = durable_rx.as_mut() {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        let Some(cmd) = cmd else { break; };
                        let done = handle_command(
                            cmd,
                            &mut store,
                            &events_tx_loop,
                            persist_tx_opt.as_ref(),
                            &config,
                        ).await;

                        if done {
                            break;
                        }
                    }
                    durable = rx.recv() => {
                        if let Some(Ok(op_seq)) = durable {
                            let _ = events_tx_loop.send(ScheduleEvent::DurableUpTo { op_seq });
                        }
                    }
                }
            } else {
                let Some(cmd) = cmd_rx.recv().await else { break; };
                let done = handle_command(
                    cmd,
                    &mut store,
                    &events_tx_loop,
                    persist_tx_opt.as_ref(),
                    &config,
                ).await;
                if done {
                    break;
                }
            }
        }
    });

    SchedulerHandle { cmd_tx, events_tx }
}

impl SchedulerHandle {
    /// Receives events for every committed mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<ScheduleEvent> {
        self.events_tx.subscribe()
    }

    /// Opens a slot for `caregiver_id` on `date`.
    pub async fn upload(&self, caregiver_id: impl Into<String>, date: ScheduleDate) -> Result<UploadOutcome, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Upload {
            caregiver_id: caregiver_id.into(),
            date,
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Adds `n` doses to `vaccine`; returns the new count.
    pub async fn add_doses(&self, vaccine: impl Into<String>, n: i64) -> Result<u32, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::AddDoses {
            vaccine: vaccine.into(),
            n,
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Books a slot and a dose, or changes nothing.
    pub async fn reserve(&self, request: ReservationRequest) -> Result<Appointment, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Reserve { request, resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Caregivers open on `date`, ascending.
    pub async fn list_available(&self, date: ScheduleDate) -> Result<Vec<CaregiverId>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ListAvailable { date, resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Open caregivers and vaccines in stock for `date`.
    pub async fn search(&self, date: ScheduleDate) -> Result<ScheduleView, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Search { date, resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Current dose count of `vaccine`.
    pub async fn doses(&self, vaccine: impl Into<String>) -> Result<Option<u32>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Doses {
            vaccine: vaccine.into(),
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Appointments of a patient.
    pub async fn appointments_for_patient(&self, patient_id: impl Into<String>) -> Result<Vec<Appointment>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ByPatient {
            patient_id: patient_id.into(),
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Appointments in a caregiver's slots.
    pub async fn appointments_for_caregiver(&self, caregiver_id: impl Into<String>) -> Result<Vec<Appointment>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ByCaregiver {
            caregiver_id: caregiver_id.into(),
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Copy of the whole in-memory state.
    pub async fn snapshot(&self) -> Result<StoreSnapshotV1, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot { resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Writes buffered ops and returns the durable sequence. Fails when an
    /// op up to the current sequence could not be written.
    pub async fn flush(&self) -> Result<OpSeq, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush { resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Flushes pending ops and stops the runtime.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown { resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    async fn send(&self, cmd: Command) -> Result<(), RuntimeError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| RuntimeError::ChannelClosed)
    }
}

/// Role-checked entry points for an authenticated caller.
impl SchedulerHandle {
    /// Caregiver opens a slot on `date` (`YYYY-MM-DD`).
    pub async fn upload_availability(&self, session: &Session, date: &str) -> Result<UploadOutcome, RuntimeError> {
        let caregiver_id = session.require(Role::Caregiver, "upload_availability")?;
        let date = parse_date(date)?;
        self.upload(caregiver_id, date).await
    }

    /// Caregiver adds `n` doses of `vaccine`.
    pub async fn restock(&self, session: &Session, vaccine: &str, n: i64) -> Result<u32, RuntimeError> {
        session.require(Role::Caregiver, "add_doses")?;
        self.add_doses(vaccine, n).await
    }

    /// Patient reserves `vaccine` on `date` (`YYYY-MM-DD`).
    pub async fn book(&self, session: &Session, date: &str, vaccine: &str) -> Result<Appointment, RuntimeError> {
        let patient_id = session.require(Role::Patient, "reserve")?;
        let date = parse_date(date)?;
        self.reserve(ReservationRequest::new(patient_id, date, vaccine))
            .await
    }

    /// Either role lists open caregivers and vaccines in stock for `date`.
    pub async fn search_schedule(&self, _session: &Session, date: &str) -> Result<ScheduleView, RuntimeError> {
        let date = parse_date(date)?;
        self.search(date).await
    }

    /// The caller's own appointments, by patient or by caregiver per role.
    pub async fn show_appointments(&self, session: &Session) -> Result<Vec<Appointment>, RuntimeError> {
        match session.role {
            Role::Patient => self.appointments_for_patient(session.username.as_str()).await,
            Role::Caregiver => self.appointments_for_caregiver(session.username.as_str()).await,
        }
    }
}

async fn handle_command(
    cmd: Command,
    store: &mut SchedulerStore,
    events_tx: &broadcast::Sender<ScheduleEvent>,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
    config: &RuntimeConfig,
) -> bool {
    match cmd {
        Command::Upload {
            caregiver_id,
            date,
            resp,
        } => {
            let res = match persist_permit(persist_tx) {
                Ok(permit) => match store.upload(&caregiver_id, date) {
                    Ok((outcome, Some(stored))) => commit(permit, stored, store, persist_tx, events_tx, config)
                        .await
                        .map(|()| {
                            let _ = events_tx.send(ScheduleEvent::SlotUploaded {
                                slot: AvailabilitySlot { date, caregiver_id },
                            });
                            outcome
                        }),
                    Ok((outcome, None)) => Ok(outcome),
                    Err(err) => Err(err.into()),
                },
                Err(err) => Err(err),
            };
            let _ = resp.send(res);
        }
        Command::AddDoses { vaccine, n, resp } => {
            let res = match persist_permit(persist_tx) {
                Ok(permit) => match store.add_doses(&vaccine, n) {
                    Ok((doses, stored)) => commit(permit, stored, store, persist_tx, events_tx, config)
                        .await
                        .map(|()| {
                            let _ = events_tx.send(ScheduleEvent::DosesAdded { vaccine, doses });
                            doses
                        }),
                    Err(err) => Err(err.into()),
                },
                Err(err) => Err(err),
            };
            let _ = resp.send(res);
        }
        Command::Reserve { request, resp } => {
            let res = match persist_permit(persist_tx) {
                Ok(permit) => match store.reserve(&request) {
                    Ok((appointment, stored)) => commit(permit, stored, store, persist_tx, events_tx, config)
                        .await
                        .map(|()| {
                            let _ = events_tx.send(ScheduleEvent::Reserved { id: appointment.id });
                            appointment
                        }),
                    Err(err) => Err(err.into()),
                },
                Err(err) => Err(err),
            };
            let _ = resp.send(res);
        }
        Command::ListAvailable { date, resp } => {
            let _ = resp.send(store.list_available(date));
        }
        Command::Search { date, resp } => {
            let _ = resp.send(store.search_schedule(date));
        }
        Command::Doses { vaccine, resp } => {
            let _ = resp.send(store.doses(&vaccine));
        }
        Command::ByPatient { patient_id, resp } => {
            let _ = resp.send(store.appointments_for_patient(&patient_id));
        }
        Command::ByCaregiver { caregiver_id, resp } => {
            let _ = resp.send(store.appointments_for_caregiver(&caregiver_id));
        }
        Command::Snapshot { resp } => {
            let _ = resp.send(store.export_snapshot());
        }
        Command::Flush { resp } => {
            let out = if let Some(tx) = persist_tx {
                request_flush(tx, store.latest_op_seq()).await
            } else {
                Ok(store.latest_op_seq())
            };
            let _ = resp.send(out);
        }
        Command::Shutdown { resp } => {
            let out = if let Some(tx) = persist_tx {
                let (done_tx, done_rx) = oneshot::channel();
                let send_res = tx.send(PersistMsg::Shutdown { resp: done_tx }).await;
                if send_res.is_err() {
                    Err(RuntimeError::ChannelClosed)
                } else {
                    done_rx.await.map_err(|_| RuntimeError::ChannelClosed)
                }
            } else {
                Ok(())
            };
            let _ = resp.send(out);
            return true;
        }
    }

    false
}

/// Claims room in the persistence queue before the store is touched, so a
/// full queue rejects the call without changing state.
fn persist_permit(
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
) -> Result<Option<mpsc::Permit<'_, PersistMsg>>, RuntimeError> {
    let Some(tx) = persist_tx else {
        return Ok(None);
    };
    tx.try_reserve().map(Some).map_err(|err| {
        RuntimeError::Persist(PersistError::Message(format!("persist queue error: {err}")))
    })
}

/// Hands a committed op to the sink. In durable mode the call waits until
/// the op is written; if that fails the op is reverted in `store` and the
/// caller sees the persistence error with nothing changed.
async fn commit(
    permit: Option<mpsc::Permit<'_, PersistMsg>>,
    stored: StoredOp,
    store: &mut SchedulerStore,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
    events_tx: &broadcast::Sender<ScheduleEvent>,
    config: &RuntimeConfig,
) -> Result<(), RuntimeError> {
    let (Some(permit), Some(tx)) = (permit, persist_tx) else {
        let _ = events_tx.send(ScheduleEvent::DurableUpTo {
            op_seq: store.latest_op_seq(),
        });
        return Ok(());
    };

    let seq = stored.seq;
    if config.ack_mode != AckMode::Durable {
        permit.send(PersistMsg::Op(stored));
        return Ok(());
    }

    permit.send(PersistMsg::Op(stored.clone()));
    match request_flush(tx, seq).await {
        Ok(_) => Ok(()),
        Err(err) => {
            warn!(seq, error = %err, "durable write failed; reverting op");
            store.revert(&stored)?;
            Err(err)
        }
    }
}

async fn request_flush(tx: &mpsc::Sender<PersistMsg>, up_to: OpSeq) -> Result<OpSeq, RuntimeError> {
    let (flush_tx, flush_rx) = oneshot::channel();
    tx.send(PersistMsg::Flush { up_to, resp: flush_tx })
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?;
    flush_rx
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?
        .map_err(RuntimeError::from)
}

fn spawn_persistence_worker(
    sink: Box<dyn OpSink>,
    mut rx: mpsc::Receiver<PersistMsg>,
    durable_tx: mpsc::UnboundedSender<Result<OpSeq, PersistError>>,
    config: RuntimeConfig,
) {
    let sink = Arc::new(Mutex::new(sink));
    tokio::spawn(async move {
        let mut buf = Vec::<StoredOp>::new();
        let mut deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
        let mut progress = Durability::default();

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        let _ = flush_buf(&sink, &mut buf, &mut progress, &durable_tx, true).await;
                        break;
                    };

                    match msg {
                        PersistMsg::Op(stored) => {
                            let is_reservation = matches!(stored.op, Op::Reserved { .. });
                            buf.push(stored);

                            if buf.len() >= config.batch_max_ops || (config.flush_on_reserve && is_reservation) {
                                let _ = flush_buf(&sink, &mut buf, &mut progress, &durable_tx, true).await;
                                deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
                            }
                        }
                        PersistMsg::Flush { up_to, resp } => {
                            let _ = flush_buf(&sink, &mut buf, &mut progress, &durable_tx, true).await;
                            let _ = resp.send(progress.check(up_to));
                            deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
                        }
                        PersistMsg::Shutdown { resp } => {
                            let _ = flush_buf(&sink, &mut buf, &mut progress, &durable_tx, true).await;
                            let _ = resp.send(());
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !buf.is_empty() => {
                    let _ = flush_buf(&sink, &mut buf, &mut progress, &durable_tx, false).await;
                    deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
                }
            }
        }
    });
}

/// What the sink has accepted so far. A failed batch is remembered until a
/// later batch writes the same sequences, so no flush can report it durable.
#[derive(Debug, Default)]
struct Durability {
    last_durable: OpSeq,
    lost: BTreeSet<OpSeq>,
    last_error: Option<String>,
}

impl Durability {
    fn written(&mut self, seqs: &[OpSeq], seq: OpSeq) {
        for s in seqs {
            self.lost.remove(s);
        }
        self.last_durable = self.last_durable.max(seq);
    }

    fn failed(&mut self, seqs: &[OpSeq], err: &PersistError) {
        self.lost.extend(seqs.iter().copied());
        self.last_error = Some(err.to_string());
    }

    fn check(&self, up_to: OpSeq) -> Result<OpSeq, PersistError> {
        let lost = self.lost.range(..=up_to).next().copied();
        if lost.is_none() && self.last_durable >= up_to {
            return Ok(self.last_durable);
        }
        let seq = lost.unwrap_or(up_to);
        let reason = self.last_error.as_deref().unwrap_or("not written");
        Err(PersistError::Message(format!("op {seq} is not durable: {reason}")))
    }
}

/// Appends the buffered ops as one batch. A failed checkpoint after a
/// successful append is logged but leaves the ops durable.
async fn flush_buf(
    sink: &Arc<Mutex<Box<dyn OpSink>>>,
    buf: &mut Vec<StoredOp>,
    progress: &mut Durability,
    durable_tx: &mpsc::UnboundedSender<Result<OpSeq, PersistError>>,
    call_flush: bool,
) -> Result<(), PersistError> {
    let ops = std::mem::take(buf);
    let seqs: Vec<OpSeq> = ops.iter().map(|op| op.seq).collect();
    let sink_ref = Arc::clone(sink);
    let joined = tokio::task::spawn_blocking(move || {
        let mut sink = sink_ref.blocking_lock();
        let appended = if ops.is_empty() {
            Ok(None)
        } else {
            sink.append_ops(&ops).map(Some)
        };
        let checkpoint = match (&appended, call_flush) {
            (Ok(_), true) => sink.flush(),
            _ => Ok(()),
        };
        (appended, checkpoint)
    })
    .await;

    let (appended, checkpoint) = match joined {
        Ok(out) => out,
        Err(e) => (Err(PersistError::Message(format!("join error: {e}"))), Ok(())),
    };
    if let Err(err) = &checkpoint {
        warn!(error = %err, "sink flush failed");
    }

    match appended {
        Ok(None) => Ok(()),
        Ok(Some(seq)) => {
            progress.written(&seqs, seq);
            debug!(ops = seqs.len(), durable_up_to = progress.last_durable, "ops persisted");
            let _ = durable_tx.send(Ok(progress.last_durable));
            Ok(())
        }
        Err(err) => {
            progress.failed(&seqs, &err);
            warn!(ops = seqs.len(), error = %err, "persisting ops failed");
            let _ = durable_tx.send(Err(PersistError::Message(format!("append failed: {err}"))));
            Err(err)
        }
    }
}
