use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

// ── Availability resolution ───────────────────────────────────────

/// Open intervals for one location (optionally scoped to one staff
/// member) on one date, before bookings are considered.
///
/// Resolution order is fixed: available rules first, then break rules
/// subtracted, then blocked/holiday rules subtracted. Blocking wins
/// over available no matter the order rules were defined in.
///
/// Staff scoping: a staff member's own available rules OVERRIDE the
/// location's when any apply that day; break and blocked/holiday rules
/// ACCUMULATE across the location and the staff member. Rules that
/// belong to a different staff member never apply.
pub fn day_open_intervals(
    cal: &CalendarState,
    staff_id: Option<Ulid>,
    date: NaiveDate,
) -> Vec<Span> {
    let mut location_open: Vec<Span> = Vec::new();
    let mut staff_open: Vec<Span> = Vec::new();
    let mut breaks: Vec<Span> = Vec::new();
    let mut blocked: Vec<Span> = Vec::new();

    for rule in &cal.rules {
        if rule.staff_id.is_some() && rule.staff_id != staff_id {
            continue;
        }
        let Some(span) = rule.span_on(date) else {
            continue;
        };
        match rule.kind {
            RuleKind::Available if rule.staff_id.is_some() => staff_open.push(span),
            RuleKind::Available => location_open.push(span),
            RuleKind::Break => breaks.push(span),
            RuleKind::Blocked | RuleKind::Holiday => blocked.push(span),
        }
    }

    let mut open = if staff_open.is_empty() {
        location_open
    } else {
        staff_open
    };
    open.sort_by_key(|s| s.start);
    let mut open = merge_overlapping(&open);

    if !breaks.is_empty() {
        breaks.sort_by_key(|s| s.start);
        open = subtract_spans(&open, &breaks);
    }
    if !blocked.is_empty() {
        blocked.sort_by_key(|s| s.start);
        open = subtract_spans(&open, &blocked);
    }

    open
}

/// Time consumed by pending/confirmed bookings visible to `staff_id`,
/// clamped to `window` and sorted. Cancelled, completed and no-show
/// bookings never block.
pub fn busy_spans(
    cal: &CalendarState,
    staff_id: Option<Ulid>,
    window: &Span,
    exclude: Option<Ulid>,
) -> Vec<Span> {
    let mut busy: Vec<Span> = cal
        .overlapping_bookings(window)
        .filter(|b| b.status.blocks_slot())
        .filter(|b| exclude != Some(b.id))
        .filter(|b| b.collides_with_staff(staff_id))
        .map(|b| {
            let s = b.span();
            Span::new(s.start.max(window.start), s.end.min(window.end))
        })
        .collect();
    busy.sort_by_key(|s| s.start);
    busy
}

/// Fully resolved free intervals for one date: open intervals minus
/// booked time. `exclude` drops one booking from the busy set — used by
/// reschedule so a booking doesn't conflict with itself.
pub fn day_free_intervals(
    cal: &CalendarState,
    staff_id: Option<Ulid>,
    date: NaiveDate,
    exclude: Option<Ulid>,
) -> Vec<Span> {
    let open = day_open_intervals(cal, staff_id, date);
    if open.is_empty() {
        return open;
    }
    let day = day_start_ms(date);
    let window = Span::new(day, day + DAY_MS);
    let busy = busy_spans(cal, staff_id, &window, exclude);
    if busy.is_empty() {
        open
    } else {
        subtract_spans(&open, &busy)
    }
}

/// Cut free intervals into bookable start times on the granularity grid
/// anchored at midnight. `[start, start + duration)` must fit entirely
/// inside a single free interval.
pub fn slice_slots(
    free: &[Span],
    day_start: Ms,
    duration_minutes: u32,
    granularity_min: u16,
) -> Vec<Slot> {
    let step = granularity_min.max(1) as Ms * MINUTE_MS;
    let need = duration_minutes as Ms * MINUTE_MS;
    let mut slots = Vec::new();
    for iv in free {
        // First grid point at or after the interval start.
        let offset = (iv.start - day_start).max(0);
        let mut start = day_start + ((offset + step - 1) / step) * step;
        while start + need <= iv.end {
            let minute_of_day = ((start - day_start) / MINUTE_MS) as u16;
            slots.push(Slot {
                start,
                period: classify_period(minute_of_day),
            });
            start += step;
        }
    }
    slots
}

/// Presentation grouping only — no effect on availability.
pub fn classify_period(minute_of_day: u16) -> Period {
    if minute_of_day < 12 * 60 {
        Period::Morning
    } else if minute_of_day < 17 * 60 {
        Period::Afternoon
    } else {
        Period::Evening
    }
}

/// Merge sorted overlapping/adjacent spans into disjoint spans.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Subtract sorted `to_remove` spans from sorted disjoint `base` spans.
pub fn subtract_spans(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
