//! Check-in time windows.
//!
//! Pure predicates over an appointment's scheduled start `S`, its duration and
//! the current instant. Nothing here touches the record store.
//!
//! | Window | Opens | Closes |
//! |--------|-------|--------|
//! | Appointment token (generate and scan) | `S - 30min` | `S + 15min` |
//! | Participant token (generate) | `S - 30min` | when the session starts |
//! | Participant token (redeem) | issuance | issuance `+ 15min` |
//!
//! A participant token re-requested within 5 minutes of issuance is reused.

use chrono::{DateTime, Duration, Utc};

/// How long before the scheduled start check-in opens.
pub const OPENS_BEFORE_START_MINUTES: i64 = 30;

/// How long after the scheduled start the appointment token stays usable.
pub const CLOSES_AFTER_START_MINUTES: i64 = 15;

/// Lifetime of a participant token from its own issuance.
pub const PARTICIPANT_TOKEN_TTL_MINUTES: i64 = 15;

/// Age below which a participant token is handed out again instead of re-minted.
pub const PARTICIPANT_TOKEN_REUSE_MINUTES: i64 = 5;

/// Result of a window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowCheck {
    Open,
    /// The window opens after `opens_in`.
    TooEarly { opens_in: Duration },
    /// The window closed `closed_ago`.
    TooLate { closed_ago: Duration },
}

impl WindowCheck {
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Instant the check-in window opens for a session starting at `start`.
#[must_use]
pub fn opens_at(start: DateTime<Utc>) -> DateTime<Utc> {
    start - Duration::minutes(OPENS_BEFORE_START_MINUTES)
}

/// Instant the appointment token stops being accepted.
#[must_use]
pub fn closes_at(start: DateTime<Utc>) -> DateTime<Utc> {
    start + Duration::minutes(CLOSES_AFTER_START_MINUTES)
}

/// Scheduled end of the session.
#[must_use]
pub fn session_end(start: DateTime<Utc>, duration_minutes: u32) -> DateTime<Utc> {
    start + Duration::minutes(i64::from(duration_minutes))
}

fn check_bounds(open: DateTime<Utc>, close: DateTime<Utc>, now: DateTime<Utc>) -> WindowCheck {
    if now < open {
        WindowCheck::TooEarly {
            opens_in: open - now,
        }
    } else if now > close {
        WindowCheck::TooLate {
            closed_ago: now - close,
        }
    } else {
        WindowCheck::Open
    }
}

/// Whether the appointment-level token may be generated at `now`.
#[must_use]
pub fn can_generate(start: DateTime<Utc>, now: DateTime<Utc>) -> WindowCheck {
    check_bounds(opens_at(start), closes_at(start), now)
}

/// Whether the appointment-level token may be scanned at `now`.
#[must_use]
pub fn can_scan(start: DateTime<Utc>, now: DateTime<Utc>) -> WindowCheck {
    check_bounds(opens_at(start), closes_at(start), now)
}

/// Whether a participant token may be minted at `now`.
///
/// Only the opening edge is time-based; the close is "session started",
/// which the caller checks against the appointment record.
#[must_use]
pub fn can_generate_participant_token(start: DateTime<Utc>, now: DateTime<Utc>) -> WindowCheck {
    let open = opens_at(start);
    if now < open {
        WindowCheck::TooEarly {
            opens_in: open - now,
        }
    } else {
        WindowCheck::Open
    }
}

/// Time until the check-in window opens, zero once open.
#[must_use]
pub fn time_until_open(start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (opens_at(start) - now).max(Duration::zero())
}

/// Time until the appointment token window closes, zero once closed.
#[must_use]
pub fn time_until_close(start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (closes_at(start) - now).max(Duration::zero())
}

/// Time until the scheduled session end, zero once past.
#[must_use]
pub fn time_until_session_end(
    start: DateTime<Utc>,
    duration_minutes: u32,
    now: DateTime<Utc>,
) -> Duration {
    (session_end(start, duration_minutes) - now).max(Duration::zero())
}

/// Instant a participant token issued at `issued_at` stops being redeemable.
#[must_use]
pub fn participant_token_expires_at(issued_at: DateTime<Utc>) -> DateTime<Utc> {
    issued_at + Duration::minutes(PARTICIPANT_TOKEN_TTL_MINUTES)
}

/// `true` once a participant token is older than its lifetime.
///
/// A token exactly at the lifetime is still accepted.
#[must_use]
pub fn participant_token_expired(issued_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now > participant_token_expires_at(issued_at)
}

/// `true` if a token issued at `issued_at` is young enough to hand out again.
#[must_use]
pub fn participant_token_reusable(issued_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let age = now - issued_at;
    age >= Duration::zero() && age <= Duration::minutes(PARTICIPANT_TOKEN_REUSE_MINUTES)
}
