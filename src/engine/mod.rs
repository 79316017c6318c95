mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use error::EngineError;
pub use mutations::BookingRequest;
pub use store::Registry;

pub(crate) use conflict::now_ms;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use ulid::Ulid;

use crate::hours::BusinessHours;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedDayState = Arc<RwLock<DayState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// Every append that is already queued when the first one arrives shares
/// its fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so buffered bytes never leak into the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// One tenant's scheduling state.
///
/// Appointments live in per-day `DayState`s behind their own lock; the day
/// lock is the transaction boundary for every booking check. Everything
/// else lives in the `Registry`. Every mutation first takes `commit_gate`
/// for reading, so compaction (which takes it for writing) sees a state
/// that matches the log exactly.
pub struct Engine {
    pub(super) days: DashMap<NaiveDate, SharedDayState>,
    pub(super) registry: Registry,
    pub(super) hours: BusinessHours,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) commit_gate: RwLock<()>,
    /// Serializes read-modify-write on registry records.
    pub(super) registry_lock: tokio::sync::Mutex<()>,
    pub notify: Arc<NotifyHub>,
}

/// Apply the day-scoped part of an event. Caller holds the day's write lock.
fn apply_to_day(ds: &mut DayState, event: &Event) {
    match event {
        Event::AppointmentBooked { appointment } => {
            if ds.get(appointment.id).is_none() {
                ds.insert(appointment.clone());
            }
        }
        Event::AppointmentMoved { id, from, to, span } if from == to => {
            if let Some(mut a) = ds.remove(*id) {
                a.span = *span;
                ds.insert(a);
            }
        }
        Event::StatusChanged {
            id,
            status,
            cancel_reason,
            ..
        } => {
            if let Some(a) = ds.get_mut(*id) {
                a.status = *status;
                if cancel_reason.is_some() {
                    a.cancel_reason = cancel_reason.clone();
                }
            }
        }
        Event::ReminderSent { id, kind, .. } => {
            if let Some(a) = ds.get_mut(*id) {
                a.mark_reminder(*kind);
            }
        }
        Event::RemindersQueued { message, .. } => {
            let kind = message.category.reminder();
            for id in &message.appointment_ids {
                if let Some(a) = ds.get_mut(*id) {
                    a.mark_reminder(kind);
                }
            }
        }
        Event::NoShowSwept { id, .. } => {
            if let Some(a) = ds.get_mut(*id) {
                a.status = crate::lifecycle::AppointmentStatus::NoShow;
            }
        }
        _ => {}
    }
}

/// Move an appointment between two different days. Caller holds both locks.
fn apply_cross_day_move(src: &mut DayState, dst: &mut DayState, id: Ulid, span: Span) {
    if let Some(mut a) = src.remove(id) {
        a.date = dst.date;
        a.span = span;
        dst.insert(a);
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, hours: BusinessHours, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            days: DashMap::new(),
            registry: Registry::new(),
            hours,
            wal_tx,
            commit_gate: RwLock::new(()),
            registry_lock: tokio::sync::Mutex::new(()),
            notify,
        };

        // Sole owner of every day lock here, so try_write always succeeds.
        // Never block: this may run inside an async context (lazy tenant creation).
        for event in &events {
            engine.registry.apply_event(event);
            match event {
                Event::AppointmentMoved { id, from, to, span } if from != to => {
                    let src = engine.day(*from);
                    let dst = engine.day(*to);
                    if let (Ok(mut s), Ok(mut d)) = (src.try_write(), dst.try_write()) {
                        apply_cross_day_move(&mut s, &mut d, *id, *span);
                    }
                }
                other => {
                    if let Some(date) = other.date()
                        && let Ok(mut guard) = engine.day(date).try_write()
                    {
                        apply_to_day(&mut guard, other);
                    }
                }
            }
        }
        if !events.is_empty() {
            tracing::info!("replayed {} events from {}", events.len(), wal_path.display());
        }

        Ok(engine)
    }

    pub fn hours(&self) -> &BusinessHours {
        &self.hours
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Get or create the lock for a calendar day.
    pub(super) fn day(&self, date: NaiveDate) -> SharedDayState {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(date))))
            .value()
            .clone()
    }

    /// The lock for a calendar day, without creating an empty one.
    pub(super) fn existing_day(&self, date: NaiveDate) -> Option<SharedDayState> {
        self.days.get(&date).map(|e| e.value().clone())
    }

    /// Days sorted ascending. Arcs are cloned out so no map shard stays
    /// locked across an await.
    pub(super) fn days_sorted(&self) -> Vec<(NaiveDate, SharedDayState)> {
        let mut all: Vec<_> = self
            .days
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        all.sort_by_key(|(d, _)| *d);
        all
    }

    pub(super) async fn gate(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate.read().await
    }

    /// WAL-append, apply to the registry and the locked day, then notify.
    pub(super) async fn persist_and_apply(
        &self,
        ds: &mut DayState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.registry.apply_event(event);
        apply_to_day(ds, event);
        self.notify.send(ds.date, event);
        Ok(())
    }

    /// WAL-append and apply an event that touches no day.
    pub(super) async fn persist_registry(&self, event: &Event) -> Result<(), EngineError> {
        debug_assert!(event.date().is_none());
        self.wal_append(event).await?;
        self.registry.apply_event(event);
        Ok(())
    }

    /// Persist a move between two different days. Caller holds both locks.
    pub(super) async fn persist_cross_day_move(
        &self,
        src: &mut DayState,
        dst: &mut DayState,
        event: &Event,
    ) -> Result<(), EngineError> {
        let Event::AppointmentMoved { id, span, .. } = event else {
            return Err(EngineError::Invalid("not a move event".into()));
        };
        self.wal_append(event).await?;
        self.registry.apply_event(event);
        apply_cross_day_move(src, dst, *id, *span);
        self.notify.send(src.date, event);
        self.notify.send(dst.date, event);
        Ok(())
    }

    /// Look up an appointment's day and take its write lock. Re-checks the
    /// day after locking, since a concurrent move may have relocated it.
    pub(super) async fn resolve_appointment_write(
        &self,
        id: &Ulid,
    ) -> Result<(NaiveDate, OwnedRwLockWriteGuard<DayState>), EngineError> {
        for _ in 0..3 {
            let date = self
                .registry
                .appointment_date(id)
                .ok_or(EngineError::NotFound(*id))?;
            let guard = self.day(date).write_owned().await;
            if guard.get(*id).is_some() {
                return Ok((date, guard));
            }
        }
        Err(EngineError::NotFound(*id))
    }
}
