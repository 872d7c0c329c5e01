use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_slot_free, validate_rule_minutes, validate_window};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    // ── Locations and staff ──────────────────────────────

    pub async fn create_location(
        &self,
        id: Ulid,
        name: String,
        auto_confirm: bool,
        slot_granularity_min: u16,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_LOCATIONS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many locations"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("location name too long"));
        }
        if slot_granularity_min == 0 || slot_granularity_min > MINUTES_PER_DAY {
            return Err(EngineError::InvalidScheduleRange("slot granularity out of range"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::LocationCreated {
            id,
            name: name.clone(),
            auto_confirm,
            slot_granularity_min,
        };
        self.wal_append(&event).await?;
        let cal = CalendarState::new(id, name, auto_confirm, slot_granularity_min);
        self.state
            .insert(id, std::sync::Arc::new(tokio::sync::RwLock::new(cal)));
        self.notify.send(id, &event);
        Ok(())
    }

    /// Partial update: None keeps the current value. The persisted
    /// event always carries the full merged settings.
    pub async fn update_location(
        &self,
        id: Ulid,
        name: Option<String>,
        auto_confirm: Option<bool>,
        slot_granularity_min: Option<u16>,
    ) -> Result<(), EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("location name too long"));
            }
        if let Some(g) = slot_granularity_min
            && (g == 0 || g > MINUTES_PER_DAY) {
                return Err(EngineError::InvalidScheduleRange("slot granularity out of range"));
            }
        let cal = self.get_location(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = cal.write().await;

        let event = Event::LocationUpdated {
            id,
            name: name.unwrap_or_else(|| guard.name.clone()),
            auto_confirm: auto_confirm.unwrap_or(guard.auto_confirm),
            slot_granularity_min: slot_granularity_min.unwrap_or(guard.slot_granularity_min),
        };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    pub async fn delete_location(&self, id: Ulid) -> Result<(), EngineError> {
        let cal = self.get_location(&id).ok_or(EngineError::NotFound(id))?;
        {
            let guard = cal.read().await;
            if !guard.staff.is_empty() {
                return Err(EngineError::HasStaff(id));
            }
        }

        let event = Event::LocationDeleted { id };
        self.wal_append(&event).await?;
        self.state.remove(&id);
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn add_staff(
        &self,
        id: Ulid,
        location_id: Ulid,
        name: String,
    ) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("staff name too long"));
        }
        if self.entity_to_location.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let cal = self
            .get_location(&location_id)
            .ok_or(EngineError::NotFound(location_id))?;
        let mut guard = cal.write().await;
        if guard.staff.len() >= MAX_STAFF_PER_LOCATION {
            return Err(EngineError::LimitExceeded("too many staff at location"));
        }

        let event = Event::StaffAdded { id, location_id, name };
        self.persist_and_apply(location_id, &mut guard, &event).await
    }

    pub async fn remove_staff(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (location_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.staff_exists(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::StaffRemoved { id, location_id };
        self.persist_and_apply(location_id, &mut guard, &event).await?;
        Ok(location_id)
    }

    // ── Schedule rules ───────────────────────────────────

    pub async fn add_rule(
        &self,
        id: Ulid,
        location_id: Ulid,
        staff_id: Option<Ulid>,
        kind: RuleKind,
        window: RuleWindow,
        start_minute: u16,
        end_minute: u16,
    ) -> Result<(), EngineError> {
        validate_rule_minutes(start_minute, end_minute)?;
        if self.entity_to_location.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let cal = self
            .get_location(&location_id)
            .ok_or(EngineError::NotFound(location_id))?;
        let mut guard = cal.write().await;
        if guard.rules.len() >= MAX_RULES_PER_LOCATION {
            return Err(EngineError::LimitExceeded("too many rules at location"));
        }
        if let Some(sid) = staff_id
            && !guard.staff_exists(&sid) {
                return Err(EngineError::NotFound(sid));
            }

        let event = Event::RuleAdded {
            id,
            location_id,
            staff_id,
            kind,
            window,
            start_minute,
            end_minute,
        };
        self.persist_and_apply(location_id, &mut guard, &event).await
    }

    /// Partial update: None keeps the current value; a new window
    /// replaces the old one entirely (weekly and one-off windows stay
    /// mutually exclusive by construction).
    pub async fn update_rule(
        &self,
        id: Ulid,
        kind: Option<RuleKind>,
        window: Option<RuleWindow>,
        start_minute: Option<u16>,
        end_minute: Option<u16>,
    ) -> Result<Ulid, EngineError> {
        let (location_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.rule(&id).ok_or(EngineError::NotFound(id))?;

        let start_minute = start_minute.unwrap_or(current.start_minute);
        let end_minute = end_minute.unwrap_or(current.end_minute);
        validate_rule_minutes(start_minute, end_minute)?;

        let event = Event::RuleUpdated {
            id,
            location_id,
            kind: kind.unwrap_or(current.kind),
            window: window.unwrap_or(current.window),
            start_minute,
            end_minute,
        };
        self.persist_and_apply(location_id, &mut guard, &event).await?;
        Ok(location_id)
    }

    pub async fn remove_rule(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (location_id, mut guard) = self.resolve_entity_write(&id).await?;
        if guard.rule(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::RuleRemoved { id, location_id };
        self.persist_and_apply(location_id, &mut guard, &event).await?;
        Ok(location_id)
    }

    // ── Booking lifecycle ────────────────────────────────

    /// Create a booking. The slot freedom re-check, the WAL append and
    /// the state mutation happen under the location's write lock: of
    /// two concurrent requests for the same window, exactly one wins.
    ///
    /// Returns the assigned status: manual entries and auto-confirming
    /// locations start Confirmed, otherwise Pending.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_booking(
        &self,
        id: Ulid,
        location_id: Ulid,
        staff_id: Option<Ulid>,
        customer_id: Ulid,
        items: Vec<ServiceItem>,
        start: Ms,
        channel: BookingChannel,
    ) -> Result<BookingStatus, EngineError> {
        if items.is_empty() {
            return Err(EngineError::LimitExceeded("booking needs at least one service item"));
        }
        if items.len() > MAX_ITEMS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many service items"));
        }
        if items.iter().any(|i| i.duration_minutes == 0) {
            return Err(EngineError::InvalidScheduleRange("service duration must be positive"));
        }
        if items.iter().any(|i| i.name.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("service name too long"));
        }
        let duration_minutes: u32 = items.iter().map(|i| i.duration_minutes).sum();
        if duration_minutes > MAX_BOOKING_DURATION_MIN {
            return Err(EngineError::LimitExceeded("booking too long"));
        }
        if self.entity_to_location.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let span = Span::new(start, start + duration_minutes as Ms * MINUTE_MS);
        validate_window(&span)?;

        let cal = self
            .get_location(&location_id)
            .ok_or(EngineError::NotFound(location_id))?;
        let mut guard = cal.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_LOCATION {
            return Err(EngineError::LimitExceeded("too many bookings at location"));
        }
        if let Some(sid) = staff_id
            && !guard.staff_exists(&sid) {
                return Err(EngineError::NotFound(sid));
            }

        check_slot_free(&guard, staff_id, &span, None)?;

        let status = match channel {
            BookingChannel::Manual => BookingStatus::Confirmed,
            BookingChannel::Online if guard.auto_confirm => BookingStatus::Confirmed,
            BookingChannel::Online => BookingStatus::Pending,
        };

        let event = Event::BookingCreated {
            id,
            location_id,
            staff_id,
            customer_id,
            items,
            start,
            duration_minutes,
            status,
        };
        self.persist_and_apply(location_id, &mut guard, &event).await?;
        Ok(status)
    }

    pub async fn confirm_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (location_id, mut guard) = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::BookingNotModifiable(booking.status));
        }
        let event = Event::BookingConfirmed { id, location_id };
        self.persist_and_apply(location_id, &mut guard, &event).await?;
        Ok(location_id)
    }

    /// Cancel with the required notice. Exactly the notice window or
    /// more passes; one minute less fails. Terminal bookings are left
    /// untouched.
    pub async fn cancel_booking(
        &self,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Ulid, EngineError> {
        if let Some(ref r) = reason
            && r.len() > MAX_REASON_LEN {
                return Err(EngineError::LimitExceeded("cancellation reason too long"));
            }
        let (location_id, mut guard) = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
        if !booking.status.blocks_slot() {
            return Err(EngineError::BookingNotModifiable(booking.status));
        }

        let now = self.now_ms();
        let remaining = booking.start - now;
        if remaining < CANCELLATION_NOTICE_MS {
            return Err(EngineError::CancellationWindowExpired { remaining_ms: remaining });
        }

        let event = Event::BookingCancelled {
            id,
            location_id,
            cancelled_at: now,
            reason,
        };
        self.persist_and_apply(location_id, &mut guard, &event).await?;
        Ok(location_id)
    }

    /// Move a booking to a new start. Status survives; the conflict
    /// re-check ignores the booking itself. Fails closed: on
    /// `SlotUnavailable` the record is untouched.
    pub async fn reschedule_booking(&self, id: Ulid, new_start: Ms) -> Result<Ulid, EngineError> {
        let (location_id, mut guard) = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
        if !booking.status.blocks_slot() {
            return Err(EngineError::BookingNotModifiable(booking.status));
        }

        let span = Span::new(
            new_start,
            new_start + booking.duration_minutes as Ms * MINUTE_MS,
        );
        validate_window(&span)?;
        check_slot_free(&guard, booking.staff_id, &span, Some(id))?;

        let event = Event::BookingRescheduled {
            id,
            location_id,
            start: new_start,
        };
        self.persist_and_apply(location_id, &mut guard, &event).await?;
        Ok(location_id)
    }

    /// The business asserts the appointment took place; the controller
    /// does not second-guess the wall clock.
    pub async fn complete_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (location_id, mut guard) = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::BookingNotModifiable(booking.status));
        }
        let event = Event::BookingCompleted { id, location_id };
        self.persist_and_apply(location_id, &mut guard, &event).await?;
        Ok(location_id)
    }

    pub async fn mark_no_show(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (location_id, mut guard) = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::BookingNotModifiable(booking.status));
        }
        let event = Event::BookingNoShow { id, location_id };
        self.persist_and_apply(location_id, &mut guard, &event).await?;
        Ok(location_id)
    }

    /// Stamp the reminder as sent. The sweep job calls this; the
    /// notification hub carries the event to whatever actually sends.
    pub async fn mark_reminder_sent(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (location_id, mut guard) = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
        if !booking.status.blocks_slot() {
            return Err(EngineError::BookingNotModifiable(booking.status));
        }
        if booking.reminder_sent_at.is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::BookingReminderSent {
            id,
            location_id,
            sent_at: self.now_ms(),
        };
        self.persist_and_apply(location_id, &mut guard, &event).await?;
        Ok(location_id)
    }

    /// Bookings entering the reminder lead window that haven't been
    /// stamped yet.
    pub fn collect_due_reminders(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut due = Vec::new();
        for entry in self.state.iter() {
            let cal = entry.value().clone();
            if let Ok(guard) = cal.try_read() {
                for b in &guard.bookings {
                    if b.status.blocks_slot()
                        && b.reminder_sent_at.is_none()
                        && b.start > now
                        && b.start - now <= REMINDER_LEAD_MS
                    {
                        due.push((b.id, guard.id));
                    }
                }
            }
        }
        due
    }

    // ── WAL compaction ───────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the
    /// current state. Cancellation details and reminder stamps are
    /// re-emitted as follow-up events on top of the creation record.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.state.iter() {
            let cal = entry.value().clone();
            let guard = cal.try_read().expect("compact: uncontended read");

            events.push(Event::LocationCreated {
                id: guard.id,
                name: guard.name.clone(),
                auto_confirm: guard.auto_confirm,
                slot_granularity_min: guard.slot_granularity_min,
            });
            for staff in &guard.staff {
                events.push(Event::StaffAdded {
                    id: staff.id,
                    location_id: guard.id,
                    name: staff.name.clone(),
                });
            }
            for rule in &guard.rules {
                events.push(Event::RuleAdded {
                    id: rule.id,
                    location_id: guard.id,
                    staff_id: rule.staff_id,
                    kind: rule.kind,
                    window: rule.window,
                    start_minute: rule.start_minute,
                    end_minute: rule.end_minute,
                });
            }
            for b in &guard.bookings {
                events.push(Event::BookingCreated {
                    id: b.id,
                    location_id: guard.id,
                    staff_id: b.staff_id,
                    customer_id: b.customer_id,
                    items: b.items.clone(),
                    start: b.start,
                    duration_minutes: b.duration_minutes,
                    status: b.status,
                });
                if let Some(cancelled_at) = b.cancelled_at {
                    events.push(Event::BookingCancelled {
                        id: b.id,
                        location_id: guard.id,
                        cancelled_at,
                        reason: b.cancellation_reason.clone(),
                    });
                }
                if let Some(sent_at) = b.reminder_sent_at {
                    events.push(Event::BookingReminderSent {
                        id: b.id,
                        location_id: guard.id,
                        sent_at,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
