//! Write-path limits. The read path never enforces these — malformed or
//! oversized data is kept out at the edges so queries stay total.

use crate::model::Ms;

/// Longest date range one availability query may scan.
pub const MAX_RANGE_DAYS: u16 = 60;

/// How far ahead bookings can be taken. Dates past the horizon report
/// no availability instead of guessing.
pub const BOOKING_HORIZON_DAYS: i64 = 180;

/// Minimum notice for a cancellation. Exactly this much notice passes.
pub const CANCELLATION_NOTICE_MS: Ms = 24 * 3_600_000;

/// Reminders are queued once a booking is this close to its start.
pub const REMINDER_LEAD_MS: Ms = 24 * 3_600_000;

/// Slot grid step used when a location doesn't configure its own.
pub const DEFAULT_SLOT_GRANULARITY_MIN: u16 = 30;

pub const MINUTES_PER_DAY: u16 = 1440;

pub const MAX_LOCATIONS_PER_TENANT: usize = 4096;
pub const MAX_STAFF_PER_LOCATION: usize = 256;
pub const MAX_RULES_PER_LOCATION: usize = 4096;
pub const MAX_BOOKINGS_PER_LOCATION: usize = 262_144;
pub const MAX_ITEMS_PER_BOOKING: usize = 16;
pub const MAX_BOOKING_DURATION_MIN: u32 = 1440;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 256;

/// Timestamps must fall in [1970-01-01, 2100-01-01).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
