use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Midnight UTC of `date` in unix milliseconds.
pub fn day_start_ms(date: NaiveDate) -> Ms {
    date.and_hms_opt(0, 0, 0)
        .expect("midnight is valid on every date")
        .and_utc()
        .timestamp_millis()
}

/// Calendar date (UTC) an instant falls on. None outside chrono's range.
pub fn date_of_ms(ms: Ms) -> Option<NaiveDate> {
    chrono::DateTime::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

// ── Schedule rules ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleKind {
    /// Opens bookable time.
    Available,
    /// Recurring closed window inside open hours (lunch, cleaning).
    Break,
    /// One-off or recurring closed window. Wins over Available.
    Blocked,
    /// Whole-day or partial closure. Wins over Available.
    Holiday,
}

impl RuleKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(RuleKind::Available),
            "break" => Some(RuleKind::Break),
            "blocked" => Some(RuleKind::Blocked),
            "holiday" => Some(RuleKind::Holiday),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Available => "available",
            RuleKind::Break => "break",
            RuleKind::Blocked => "blocked",
            RuleKind::Holiday => "holiday",
        }
    }
}

/// When a rule applies. Weekly recurrence and a one-off date are
/// mutually exclusive by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleWindow {
    /// Every week on the given day (0 = Sunday … 6 = Saturday).
    Weekly { weekday: u8 },
    /// One calendar date only.
    Date { date: NaiveDate },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRule {
    pub id: Ulid,
    /// None = location-wide; Some = one staff member's own rule.
    pub staff_id: Option<Ulid>,
    pub kind: RuleKind,
    pub window: RuleWindow,
    /// Minutes from midnight, end exclusive.
    pub start_minute: u16,
    pub end_minute: u16,
}

impl ScheduleRule {
    pub fn applies_on(&self, date: NaiveDate) -> bool {
        match self.window {
            RuleWindow::Weekly { weekday } => {
                date.weekday().num_days_from_sunday() as u8 == weekday
            }
            RuleWindow::Date { date: d } => d == date,
        }
    }

    /// Concrete span on `date`. Inverted or zero-length windows
    /// contribute nothing — the write path rejects them, but data that
    /// predates validation must not break reads.
    pub fn span_on(&self, date: NaiveDate) -> Option<Span> {
        if !self.applies_on(date) || self.end_minute <= self.start_minute {
            return None;
        }
        let day = day_start_ms(date);
        Some(Span::new(
            day + self.start_minute as Ms * MINUTE_MS,
            day + self.end_minute as Ms * MINUTE_MS,
        ))
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    /// Terminal states admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::NoShow
        )
    }

    /// Whether the booking still occupies its time window.
    pub fn blocks_slot(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" => Some(BookingStatus::Cancelled),
            "no_show" => Some(BookingStatus::NoShow),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }
}

/// Where a booking was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingChannel {
    /// Public booking flow. Starts Pending unless the location
    /// auto-confirms.
    Online,
    /// Dashboard entry by the business. Always starts Confirmed.
    Manual,
}

/// One service line item, snapshotted at booking time. Never re-joined
/// to the live service catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceItem {
    pub name: String,
    pub duration_minutes: u32,
    pub price_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingState {
    pub id: Ulid,
    pub staff_id: Option<Ulid>,
    pub customer_id: Ulid,
    pub items: Vec<ServiceItem>,
    pub start: Ms,
    /// Always the sum of the line items' durations.
    pub duration_minutes: u32,
    pub status: BookingStatus,
    pub cancelled_at: Option<Ms>,
    pub cancellation_reason: Option<String>,
    pub reminder_sent_at: Option<Ms>,
}

impl BookingState {
    pub fn span(&self) -> Span {
        Span::new(
            self.start,
            self.start + self.duration_minutes as Ms * MINUTE_MS,
        )
    }

    /// Whether this booking competes with a request scoped to
    /// `staff_id`. An unassigned booking consumes the location as a
    /// whole, and an unassigned request needs the whole location free.
    pub fn collides_with_staff(&self, staff_id: Option<Ulid>) -> bool {
        match (self.staff_id, staff_id) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffMember {
    pub id: Ulid,
    pub name: String,
}

/// Per-location calendar: the unit of locking. Rules, the staff roster,
/// and every booking ever taken live under one lock so the commit-time
/// conflict re-check and the write are a single critical section.
#[derive(Debug, Clone)]
pub struct CalendarState {
    pub id: Ulid,
    pub name: String,
    /// Online bookings start Confirmed when set, Pending otherwise.
    pub auto_confirm: bool,
    /// Slot grid step in minutes.
    pub slot_granularity_min: u16,
    pub staff: Vec<StaffMember>,
    pub rules: Vec<ScheduleRule>,
    /// Sorted by `start`.
    pub bookings: Vec<BookingState>,
}

impl CalendarState {
    pub fn new(id: Ulid, name: String, auto_confirm: bool, slot_granularity_min: u16) -> Self {
        Self {
            id,
            name,
            auto_confirm,
            slot_granularity_min,
            staff: Vec::new(),
            rules: Vec::new(),
            bookings: Vec::new(),
        }
    }

    pub fn staff_exists(&self, id: &Ulid) -> bool {
        self.staff.iter().any(|s| s.id == *id)
    }

    /// Insert a booking maintaining sort order by start.
    pub fn insert_booking(&mut self, booking: BookingState) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.start, |b| b.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&BookingState> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut BookingState> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Re-sort one booking after its start changed.
    pub fn reposition_booking(&mut self, id: Ulid) {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == id) {
            let booking = self.bookings.remove(pos);
            self.insert_booking(booking);
        }
    }

    /// Bookings whose occupied window overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`;
    /// a booking can occupy at most a day, so scan back from there.
    pub fn overlapping_bookings(&self, query: &Span) -> impl Iterator<Item = &BookingState> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.start < query.end);
        let query = *query;
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span().end > query.start)
    }

    pub fn rule(&self, id: &Ulid) -> Option<&ScheduleRule> {
        self.rules.iter().find(|r| r.id == *id)
    }
}

// ── Events — flat, no nesting. This is the WAL record format. ────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    LocationCreated {
        id: Ulid,
        name: String,
        auto_confirm: bool,
        slot_granularity_min: u16,
    },
    LocationUpdated {
        id: Ulid,
        name: String,
        auto_confirm: bool,
        slot_granularity_min: u16,
    },
    LocationDeleted {
        id: Ulid,
    },
    StaffAdded {
        id: Ulid,
        location_id: Ulid,
        name: String,
    },
    StaffRemoved {
        id: Ulid,
        location_id: Ulid,
    },
    RuleAdded {
        id: Ulid,
        location_id: Ulid,
        staff_id: Option<Ulid>,
        kind: RuleKind,
        window: RuleWindow,
        start_minute: u16,
        end_minute: u16,
    },
    RuleUpdated {
        id: Ulid,
        location_id: Ulid,
        kind: RuleKind,
        window: RuleWindow,
        start_minute: u16,
        end_minute: u16,
    },
    RuleRemoved {
        id: Ulid,
        location_id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        location_id: Ulid,
        staff_id: Option<Ulid>,
        customer_id: Ulid,
        items: Vec<ServiceItem>,
        start: Ms,
        duration_minutes: u32,
        status: BookingStatus,
    },
    BookingConfirmed {
        id: Ulid,
        location_id: Ulid,
    },
    BookingCancelled {
        id: Ulid,
        location_id: Ulid,
        cancelled_at: Ms,
        reason: Option<String>,
    },
    BookingRescheduled {
        id: Ulid,
        location_id: Ulid,
        start: Ms,
    },
    BookingCompleted {
        id: Ulid,
        location_id: Ulid,
    },
    BookingNoShow {
        id: Ulid,
        location_id: Ulid,
    },
    BookingReminderSent {
        id: Ulid,
        location_id: Ulid,
        sent_at: Ms,
    },
}

/// Extract the location id from an event (None for Created/Deleted,
/// which are handled at the map level).
pub fn event_location_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::StaffAdded { location_id, .. }
        | Event::StaffRemoved { location_id, .. }
        | Event::RuleAdded { location_id, .. }
        | Event::RuleUpdated { location_id, .. }
        | Event::RuleRemoved { location_id, .. }
        | Event::BookingCreated { location_id, .. }
        | Event::BookingConfirmed { location_id, .. }
        | Event::BookingCancelled { location_id, .. }
        | Event::BookingRescheduled { location_id, .. }
        | Event::BookingCompleted { location_id, .. }
        | Event::BookingNoShow { location_id, .. }
        | Event::BookingReminderSent { location_id, .. } => Some(*location_id),
        Event::LocationUpdated { id, .. } => Some(*id),
        Event::LocationCreated { .. } | Event::LocationDeleted { .. } => None,
    }
}

// ── Query result types ───────────────────────────────────────────

/// Presentation grouping for a slot. Has no availability semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Morning,
    Afternoon,
    Evening,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Morning => "morning",
            Period::Afternoon => "afternoon",
            Period::Evening => "evening",
        }
    }
}

/// One bookable start time. Transient — computed fresh on every request
/// and never cached, because bookings can land in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub start: Ms,
    pub period: Period,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateAvailability {
    pub date: NaiveDate,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationInfo {
    pub id: Ulid,
    pub name: String,
    pub auto_confirm: bool,
    pub slot_granularity_min: u16,
    pub staff_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleInfo {
    pub id: Ulid,
    pub location_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub kind: RuleKind,
    pub window: RuleWindow,
    pub start_minute: u16,
    pub end_minute: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub location_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub customer_id: Ulid,
    pub items: Vec<ServiceItem>,
    pub start: Ms,
    pub duration_minutes: u32,
    pub status: BookingStatus,
    pub cancelled_at: Option<Ms>,
    pub cancellation_reason: Option<String>,
    pub reminder_sent_at: Option<Ms>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monday() -> NaiveDate {
        // 2026-03-02 is a Monday.
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.overlaps(&Span::new(150, 250)));
        assert!(!s.overlaps(&Span::new(200, 300))); // adjacent, not overlapping
        assert!(s.contains_span(&Span::new(100, 200)));
        assert!(!s.contains_span(&Span::new(150, 250)));
    }

    #[test]
    fn weekly_rule_applies_on_matching_weekday() {
        let rule = ScheduleRule {
            id: Ulid::new(),
            staff_id: None,
            kind: RuleKind::Available,
            window: RuleWindow::Weekly { weekday: 1 }, // Monday
            start_minute: 540,
            end_minute: 1020,
        };
        assert!(rule.applies_on(monday()));
        assert!(!rule.applies_on(monday().succ_opt().unwrap())); // Tuesday
    }

    #[test]
    fn date_rule_applies_on_that_date_only() {
        let rule = ScheduleRule {
            id: Ulid::new(),
            staff_id: None,
            kind: RuleKind::Holiday,
            window: RuleWindow::Date { date: monday() },
            start_minute: 0,
            end_minute: 1440,
        };
        assert!(rule.applies_on(monday()));
        assert!(!rule.applies_on(monday().succ_opt().unwrap()));
    }

    #[test]
    fn rule_span_on_is_anchored_to_midnight() {
        let rule = ScheduleRule {
            id: Ulid::new(),
            staff_id: None,
            kind: RuleKind::Available,
            window: RuleWindow::Weekly { weekday: 1 },
            start_minute: 540,
            end_minute: 1020,
        };
        let day = day_start_ms(monday());
        let span = rule.span_on(monday()).unwrap();
        assert_eq!(span.start, day + 540 * MINUTE_MS);
        assert_eq!(span.end, day + 1020 * MINUTE_MS);
    }

    #[test]
    fn inverted_rule_contributes_nothing() {
        let rule = ScheduleRule {
            id: Ulid::new(),
            staff_id: None,
            kind: RuleKind::Available,
            window: RuleWindow::Weekly { weekday: 1 },
            start_minute: 600,
            end_minute: 600,
        };
        assert!(rule.span_on(monday()).is_none());
    }

    #[test]
    fn status_terminality() {
        assert!(!BookingStatus::Pending.is_terminal());
        assert!(!BookingStatus::Confirmed.is_terminal());
        assert!(BookingStatus::Completed.is_terminal());
        assert!(BookingStatus::Cancelled.is_terminal());
        assert!(BookingStatus::NoShow.is_terminal());
    }

    #[test]
    fn only_live_statuses_block_slots() {
        assert!(BookingStatus::Pending.blocks_slot());
        assert!(BookingStatus::Confirmed.blocks_slot());
        assert!(!BookingStatus::Cancelled.blocks_slot());
        assert!(!BookingStatus::Completed.blocks_slot());
        assert!(!BookingStatus::NoShow.blocks_slot());
    }

    fn booking_at(start: Ms, staff_id: Option<Ulid>) -> BookingState {
        BookingState {
            id: Ulid::new(),
            staff_id,
            customer_id: Ulid::new(),
            items: vec![ServiceItem {
                name: "Wash".into(),
                duration_minutes: 60,
                price_cents: 3000,
            }],
            start,
            duration_minutes: 60,
            status: BookingStatus::Confirmed,
            cancelled_at: None,
            cancellation_reason: None,
            reminder_sent_at: None,
        }
    }

    #[test]
    fn staff_collision_matrix() {
        let a = Ulid::new();
        let b = Ulid::new();
        let assigned = booking_at(0, Some(a));
        let unassigned = booking_at(0, None);

        assert!(assigned.collides_with_staff(Some(a)));
        assert!(!assigned.collides_with_staff(Some(b)));
        assert!(assigned.collides_with_staff(None));
        assert!(unassigned.collides_with_staff(Some(a)));
        assert!(unassigned.collides_with_staff(None));
    }

    #[test]
    fn bookings_stay_sorted_on_insert() {
        let mut cal = CalendarState::new(Ulid::new(), "Shop".into(), true, 30);
        cal.insert_booking(booking_at(3 * 3_600_000, None));
        cal.insert_booking(booking_at(1 * 3_600_000, None));
        cal.insert_booking(booking_at(2 * 3_600_000, None));
        let starts: Vec<Ms> = cal.bookings.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![3_600_000, 7_200_000, 10_800_000]);
    }

    #[test]
    fn reposition_restores_order() {
        let mut cal = CalendarState::new(Ulid::new(), "Shop".into(), true, 30);
        let early = booking_at(1 * 3_600_000, None);
        let id = early.id;
        cal.insert_booking(early);
        cal.insert_booking(booking_at(2 * 3_600_000, None));

        cal.booking_mut(&id).unwrap().start = 5 * 3_600_000;
        cal.reposition_booking(id);
        assert_eq!(cal.bookings[1].id, id);
    }

    #[test]
    fn overlapping_bookings_half_open() {
        let mut cal = CalendarState::new(Ulid::new(), "Shop".into(), true, 30);
        cal.insert_booking(booking_at(1 * 3_600_000, None)); // [1h, 2h)
        // Query starting exactly at the booking's end must not see it.
        let hits: Vec<_> = cal
            .overlapping_bookings(&Span::new(2 * 3_600_000, 3 * 3_600_000))
            .collect();
        assert!(hits.is_empty());
        let hits: Vec<_> = cal
            .overlapping_bookings(&Span::new(90 * MINUTE_MS, 3 * 3_600_000))
            .collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            id: Ulid::new(),
            location_id: Ulid::new(),
            staff_id: None,
            customer_id: Ulid::new(),
            items: vec![ServiceItem {
                name: "Nail Trim".into(),
                duration_minutes: 15,
                price_cents: 1500,
            }],
            start: 1_770_000_000_000,
            duration_minutes: 15,
            status: BookingStatus::Pending,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn rule_window_serialization_roundtrip() {
        let event = Event::RuleAdded {
            id: Ulid::new(),
            location_id: Ulid::new(),
            staff_id: Some(Ulid::new()),
            kind: RuleKind::Holiday,
            window: RuleWindow::Date { date: monday() },
            start_minute: 0,
            end_minute: 1440,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
