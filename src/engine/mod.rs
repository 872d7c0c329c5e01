mod availability;
mod conflict;
mod error;
mod lifecycle;
mod queries;

pub use availability::{
    busy_spans, classify_period, day_free_intervals, day_open_intervals, merge_overlapping,
    slice_slots, subtract_spans,
};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedCalendarState = Arc<RwLock<CalendarState>>;

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

/// Background task that owns the WAL and batches appends for group
/// commit: buffer the first append, drain everything immediately
/// available, flush once, answer everyone.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the batch before the non-append command.
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &[(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub state: DashMap<Ulid, SharedCalendarState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(crate) clock: Arc<dyn Clock>,
    /// Reverse lookup: entity (staff/rule/booking) id → location id.
    pub(super) entity_to_location: DashMap<Ulid, Ulid>,
}

/// Apply an event directly to a CalendarState (no locking — caller
/// holds the lock).
fn apply_to_calendar(cal: &mut CalendarState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::StaffAdded { id, location_id, name } => {
            cal.staff.push(StaffMember {
                id: *id,
                name: name.clone(),
            });
            entity_map.insert(*id, *location_id);
        }
        Event::StaffRemoved { id, .. } => {
            cal.staff.retain(|s| s.id != *id);
            entity_map.remove(id);
        }
        Event::RuleAdded {
            id,
            location_id,
            staff_id,
            kind,
            window,
            start_minute,
            end_minute,
        } => {
            cal.rules.push(ScheduleRule {
                id: *id,
                staff_id: *staff_id,
                kind: *kind,
                window: *window,
                start_minute: *start_minute,
                end_minute: *end_minute,
            });
            entity_map.insert(*id, *location_id);
        }
        Event::RuleUpdated {
            id,
            kind,
            window,
            start_minute,
            end_minute,
            ..
        } => {
            if let Some(rule) = cal.rules.iter_mut().find(|r| r.id == *id) {
                rule.kind = *kind;
                rule.window = *window;
                rule.start_minute = *start_minute;
                rule.end_minute = *end_minute;
            }
        }
        Event::RuleRemoved { id, .. } => {
            cal.rules.retain(|r| r.id != *id);
            entity_map.remove(id);
        }
        Event::BookingCreated {
            id,
            location_id,
            staff_id,
            customer_id,
            items,
            start,
            duration_minutes,
            status,
        } => {
            cal.insert_booking(BookingState {
                id: *id,
                staff_id: *staff_id,
                customer_id: *customer_id,
                items: items.clone(),
                start: *start,
                duration_minutes: *duration_minutes,
                status: *status,
                cancelled_at: None,
                cancellation_reason: None,
                reminder_sent_at: None,
            });
            entity_map.insert(*id, *location_id);
        }
        Event::BookingConfirmed { id, .. } => {
            if let Some(b) = cal.booking_mut(id) {
                b.status = BookingStatus::Confirmed;
            }
        }
        Event::BookingCancelled {
            id,
            cancelled_at,
            reason,
            ..
        } => {
            if let Some(b) = cal.booking_mut(id) {
                b.status = BookingStatus::Cancelled;
                b.cancelled_at = Some(*cancelled_at);
                b.cancellation_reason = reason.clone();
            }
        }
        Event::BookingRescheduled { id, start, .. } => {
            if let Some(b) = cal.booking_mut(id) {
                b.start = *start;
            }
            cal.reposition_booking(*id);
        }
        Event::BookingCompleted { id, .. } => {
            if let Some(b) = cal.booking_mut(id) {
                b.status = BookingStatus::Completed;
            }
        }
        Event::BookingNoShow { id, .. } => {
            if let Some(b) = cal.booking_mut(id) {
                b.status = BookingStatus::NoShow;
            }
        }
        Event::BookingReminderSent { id, sent_at, .. } => {
            if let Some(b) = cal.booking_mut(id) {
                b.reminder_sent_at = Some(*sent_at);
            }
        }
        Event::LocationUpdated {
            name,
            auto_confirm,
            slot_granularity_min,
            ..
        } => {
            cal.name = name.clone();
            cal.auto_confirm = *auto_confirm;
            cal.slot_granularity_min = *slot_granularity_min;
        }
        // Created/Deleted are handled at the DashMap level, not here.
        Event::LocationCreated { .. } | Event::LocationDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_clock(wal_path, notify, Arc::new(SystemClock))
    }

    pub fn with_clock(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            clock,
            entity_to_location: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so
        // try_write always succeeds instantly. Never use blocking_write
        // here because this may run inside an async context (lazy
        // tenant creation).
        for event in &events {
            match event {
                Event::LocationCreated {
                    id,
                    name,
                    auto_confirm,
                    slot_granularity_min,
                } => {
                    let cal =
                        CalendarState::new(*id, name.clone(), *auto_confirm, *slot_granularity_min);
                    engine.state.insert(*id, Arc::new(RwLock::new(cal)));
                }
                Event::LocationDeleted { id } => {
                    engine.state.remove(id);
                }
                other => {
                    if let Some(location_id) = event_location_id(other)
                        && let Some(entry) = engine.state.get(&location_id) {
                            let cal_arc = entry.clone();
                            let mut guard =
                                cal_arc.try_write().expect("replay: uncontended write");
                            apply_to_calendar(&mut guard, other, &engine.entity_to_location);
                        }
                }
            }
        }

        Ok(engine)
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

    pub fn get_location(&self, id: &Ulid) -> Option<SharedCalendarState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn location_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_location.get(entity_id).map(|e| *e.value())
    }

    pub(crate) fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// WAL-append + apply + notify in one call. The WAL append comes
    /// first: if it fails the operation aborts with no state change.
    /// Notification failures never surface to the caller.
    pub(super) async fn persist_and_apply(
        &self,
        location_id: Ulid,
        cal: &mut CalendarState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_calendar(cal, event, &self.entity_to_location);
        self.notify.send(location_id, event);
        Ok(())
    }

    /// Lookup entity → location, get location, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<CalendarState>), EngineError> {
        let location_id = self
            .location_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let cal = self
            .get_location(&location_id)
            .ok_or(EngineError::NotFound(location_id))?;
        let guard = cal.write_owned().await;
        Ok((location_id, guard))
    }
}
