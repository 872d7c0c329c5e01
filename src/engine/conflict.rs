use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::day_free_intervals;
use super::EngineError;

pub(crate) fn validate_window(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidScheduleRange("timestamp out of range"));
    }
    if span.end <= span.start {
        return Err(EngineError::InvalidScheduleRange("window is empty"));
    }
    Ok(())
}

pub(crate) fn validate_rule_minutes(start_minute: u16, end_minute: u16) -> Result<(), EngineError> {
    if end_minute <= start_minute {
        return Err(EngineError::InvalidScheduleRange("rule ends before it starts"));
    }
    if end_minute > MINUTES_PER_DAY {
        return Err(EngineError::InvalidScheduleRange("rule extends past midnight"));
    }
    Ok(())
}

pub(crate) fn booking_date(start: Ms) -> Result<NaiveDate, EngineError> {
    date_of_ms(start).ok_or(EngineError::InvalidScheduleRange("timestamp out of range"))
}

/// The commit-time re-check: the requested window must sit entirely
/// inside one free interval for the booking's staff scope. The caller
/// holds the location's write lock, so nothing can take the slot
/// between this check and the append.
pub(crate) fn check_slot_free(
    cal: &CalendarState,
    staff_id: Option<Ulid>,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let date = booking_date(span.start)?;
    let free = day_free_intervals(cal, staff_id, date, exclude);
    if free.iter().any(|iv| iv.contains_span(span)) {
        Ok(())
    } else {
        Err(EngineError::SlotUnavailable(*span))
    }
}
