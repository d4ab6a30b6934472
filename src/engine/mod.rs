mod availability;
mod conflict;
mod error;
mod mutations;
mod normalize;
mod queries;
mod store;
mod timetable;
#[cfg(test)]
mod tests;

pub use availability::{end_times, max_durations, max_end_from, merge_best, slot_starts};
pub use error::{Clash, EngineError, Entity, ErrorKind};
pub use mutations::TimetableEdit;
pub use normalize::{parse_clock, parse_date, parse_timestamp, AppointmentRequest, BookingRequest};
pub use store::{Roster, SharedEmployeeState};
pub use timetable::{plan_placement, Placement};

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard};

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

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
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
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
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} records: {e}", batch.len());
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
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so no half-batch lingers in the buffer.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Per-tenant knobs that shape scheduling and locking.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub policy: SchedulePolicy,
    /// Upper bound on waiting for an employee's lock before giving up.
    pub lock_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            policy: SchedulePolicy::default(),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

pub type EmployeeWriteGuard = OwnedRwLockWriteGuard<EmployeeState>;
pub type EmployeeReadGuard = OwnedRwLockReadGuard<EmployeeState>;

pub struct Engine {
    pub store: Roster,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub settings: EngineSettings,
    /// Serializes directory writes against compaction, which has no employee lock to hold.
    pub(super) directory: Mutex<()>,
    next_timetable_id: AtomicI64,
    next_appointment_id: AtomicI64,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, settings: EngineSettings) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Roster::new();
        let mut max_timetable = 0;
        let mut max_appointment = 0;
        for event in &events {
            store.replay_event(event)?;
            match event {
                Event::TimetableCreated { timetable, .. } | Event::TimetableUpdated { timetable, .. } => {
                    max_timetable = max_timetable.max(timetable.id);
                }
                Event::AppointmentsBooked { appointments } => {
                    for a in appointments {
                        max_appointment = max_appointment.max(a.id);
                    }
                }
                _ => {}
            }
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} WAL records from {}: {} employees, {} members",
                events.len(),
                wal_path.display(),
                store.employee_count(),
                store.member_count()
            );
        }

        Ok(Self {
            store,
            wal_tx,
            notify,
            settings,
            directory: Mutex::new(()),
            next_timetable_id: AtomicI64::new(max_timetable + 1),
            next_appointment_id: AtomicI64::new(max_appointment + 1),
        })
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.settings.policy
    }

    pub(super) fn allocate_timetable_id(&self) -> TimetableId {
        self.next_timetable_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserve `n` consecutive appointment ids, returning the first.
    pub(super) fn allocate_appointment_ids(&self, n: usize) -> AppointmentId {
        self.next_appointment_id.fetch_add(n as i64, Ordering::Relaxed)
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

    /// WAL-append, apply to every locked employee, then notify.
    /// `guards` must cover every employee the event touches.
    pub(super) async fn persist_and_apply(
        &self,
        guards: &mut [EmployeeWriteGuard],
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        for guard in guards.iter_mut() {
            self.store.apply_to_employee(guard, event);
        }
        for id in event.employee_ids() {
            self.notify.send(id, event);
        }
        Ok(())
    }

    /// WAL-append and apply a directory event (no per-employee lock involved).
    pub(super) async fn persist_directory(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_directory_event(event);
        for id in event.employee_ids() {
            self.notify.send(id, event);
        }
        Ok(())
    }

    fn shared_employee(&self, id: EmployeeId) -> Result<SharedEmployeeState, EngineError> {
        self.store
            .get_employee(id)
            .ok_or(EngineError::NotFound(Entity::Employee(id)))
    }

    fn lock_timed_out(&self, id: EmployeeId) -> EngineError {
        EngineError::ConcurrencyConflict(format!(
            "employee {id} stayed locked for more than {} ms",
            self.settings.lock_timeout.as_millis()
        ))
    }

    pub(super) async fn write_employee(&self, id: EmployeeId) -> Result<EmployeeWriteGuard, EngineError> {
        let shared = self.shared_employee(id)?;
        tokio::time::timeout(self.settings.lock_timeout, shared.write_owned())
            .await
            .map_err(|_| self.lock_timed_out(id))
    }

    pub(super) async fn read_employee(&self, id: EmployeeId) -> Result<EmployeeReadGuard, EngineError> {
        let shared = self.shared_employee(id)?;
        tokio::time::timeout(self.settings.lock_timeout, shared.read_owned())
            .await
            .map_err(|_| self.lock_timed_out(id))
    }

    /// Write-lock several employees in ascending id order. `ids` must be sorted and deduplicated.
    pub(super) async fn write_employees(&self, ids: &[EmployeeId]) -> Result<Vec<EmployeeWriteGuard>, EngineError> {
        let mut guards = Vec::with_capacity(ids.len());
        for &id in ids {
            guards.push(self.write_employee(id).await?);
        }
        Ok(guards)
    }

    /// Read-lock every employee in ascending id order, for "any available staff" queries.
    pub(super) async fn read_all_employees(&self) -> Result<Vec<EmployeeReadGuard>, EngineError> {
        let mut guards = Vec::new();
        for id in self.store.employee_ids() {
            guards.push(self.read_employee(id).await?);
        }
        Ok(guards)
    }
}
