use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{day_free_intervals, slice_slots};
use super::{Engine, EngineError};

/// Slots for one date, with the horizon and past-time clamps applied.
/// Both public availability operations go through here, which is what
/// keeps them consistent: a date is available exactly when this returns
/// at least one slot.
fn compute_slots(
    cal: &CalendarState,
    date: NaiveDate,
    duration_minutes: u32,
    staff_id: Option<Ulid>,
    now: Ms,
) -> Vec<Slot> {
    let day_start = day_start_ms(date);
    // Outside the booking horizon the engine reports nothing rather
    // than guessing.
    if day_start + DAY_MS <= now {
        return Vec::new();
    }
    if day_start > now + BOOKING_HORIZON_DAYS * DAY_MS {
        return Vec::new();
    }

    let free = day_free_intervals(cal, staff_id, date, None);
    let mut slots = slice_slots(&free, day_start, duration_minutes, cal.slot_granularity_min);
    // Never offer a start time that has already passed today.
    slots.retain(|s| s.start >= now);
    slots
}

impl Engine {
    /// One `{date, available}` row per day of the range, ascending.
    /// Recomputing with the same rules and bookings yields the same
    /// answer.
    pub async fn list_available_dates(
        &self,
        location_id: Ulid,
        duration_minutes: u32,
        staff_id: Option<Ulid>,
        range_start: NaiveDate,
        range_days: u16,
    ) -> Result<Vec<DateAvailability>, EngineError> {
        if duration_minutes == 0 {
            return Err(EngineError::InvalidScheduleRange("duration must be positive"));
        }
        if range_days == 0 || range_days > MAX_RANGE_DAYS {
            return Err(EngineError::InvalidScheduleRange("date range out of bounds"));
        }
        let cal = match self.get_location(&location_id) {
            Some(cal) => cal,
            None => return Ok(Vec::new()),
        };
        let guard = cal.read().await;
        if let Some(sid) = staff_id
            && !guard.staff_exists(&sid) {
                return Err(EngineError::NotFound(sid));
            }

        let now = self.now_ms();
        let mut out = Vec::with_capacity(range_days as usize);
        for i in 0..range_days {
            let Some(date) = range_start.checked_add_days(Days::new(i as u64)) else {
                break;
            };
            let available =
                !compute_slots(&guard, date, duration_minutes, staff_id, now).is_empty();
            out.push(DateAvailability { date, available });
        }
        Ok(out)
    }

    /// Bookable start times for one date, ascending, each tagged with
    /// its period. Empty is a valid answer.
    pub async fn list_time_slots(
        &self,
        location_id: Ulid,
        date: NaiveDate,
        duration_minutes: u32,
        staff_id: Option<Ulid>,
    ) -> Result<Vec<Slot>, EngineError> {
        if duration_minutes == 0 {
            return Err(EngineError::InvalidScheduleRange("duration must be positive"));
        }
        let cal = match self.get_location(&location_id) {
            Some(cal) => cal,
            None => return Ok(Vec::new()),
        };
        let guard = cal.read().await;
        if let Some(sid) = staff_id
            && !guard.staff_exists(&sid) {
                return Err(EngineError::NotFound(sid));
            }

        Ok(compute_slots(&guard, date, duration_minutes, staff_id, self.now_ms()))
    }

    pub fn list_locations(&self) -> Vec<LocationInfo> {
        self.state
            .iter()
            .map(|entry| {
                let cal = entry.value().clone();
                let guard = cal.try_read().expect("list_locations: uncontended read");
                LocationInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                    auto_confirm: guard.auto_confirm,
                    slot_granularity_min: guard.slot_granularity_min,
                    staff_count: guard.staff.len(),
                }
            })
            .collect()
    }

    pub async fn list_rules(&self, location_id: Ulid) -> Result<Vec<RuleInfo>, EngineError> {
        let cal = match self.get_location(&location_id) {
            Some(cal) => cal,
            None => return Ok(Vec::new()),
        };
        let guard = cal.read().await;
        Ok(guard
            .rules
            .iter()
            .map(|r| RuleInfo {
                id: r.id,
                location_id,
                staff_id: r.staff_id,
                kind: r.kind,
                window: r.window,
                start_minute: r.start_minute,
                end_minute: r.end_minute,
            })
            .collect())
    }

    pub async fn list_bookings(&self, location_id: Ulid) -> Result<Vec<BookingInfo>, EngineError> {
        let cal = match self.get_location(&location_id) {
            Some(cal) => cal,
            None => return Ok(Vec::new()),
        };
        let guard = cal.read().await;
        Ok(guard
            .bookings
            .iter()
            .map(|b| booking_info(location_id, b))
            .collect())
    }

    /// Snapshot of one booking, wherever it lives.
    pub async fn booking_info(&self, id: Ulid) -> Option<BookingInfo> {
        let location_id = self.location_for_entity(&id)?;
        let cal = self.get_location(&location_id)?;
        let guard = cal.read().await;
        guard.booking(&id).map(|b| booking_info(location_id, b))
    }
}

fn booking_info(location_id: Ulid, b: &BookingState) -> BookingInfo {
    BookingInfo {
        id: b.id,
        location_id,
        staff_id: b.staff_id,
        customer_id: b.customer_id,
        items: b.items.clone(),
        start: b.start,
        duration_minutes: b.duration_minutes,
        status: b.status,
        cancelled_at: b.cancelled_at,
        cancellation_reason: b.cancellation_reason.clone(),
        reminder_sent_at: b.reminder_sent_at,
    }
}
