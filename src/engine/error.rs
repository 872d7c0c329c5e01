use ulid::Ulid;

use crate::model::{BookingStatus, Ms, Span};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Requested window is no longer free at commit time.
    SlotUnavailable(Span),
    /// Transition attempted on a terminal (or otherwise ineligible)
    /// booking; the record is left untouched.
    BookingNotModifiable(BookingStatus),
    /// Cancel attempted with less than the required notice.
    CancellationWindowExpired { remaining_ms: Ms },
    /// Malformed duration, rule window, or out-of-horizon date range.
    InvalidScheduleRange(&'static str),
    HasStaff(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotUnavailable(span) => {
                write!(f, "slot [{}, {}) is not available", span.start, span.end)
            }
            EngineError::BookingNotModifiable(status) => {
                write!(f, "booking is {} and cannot be modified", status.as_str())
            }
            EngineError::CancellationWindowExpired { remaining_ms } => {
                write!(
                    f,
                    "cancellation window expired: {} minutes of notice left",
                    remaining_ms / 60_000
                )
            }
            EngineError::InvalidScheduleRange(msg) => {
                write!(f, "invalid schedule range: {msg}")
            }
            EngineError::HasStaff(id) => {
                write!(f, "cannot delete location {id}: staff still assigned")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
