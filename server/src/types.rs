//! Record types for the Rollcall server.
//!
//! This module defines the documents the lifecycle engine reads and writes:
//! appointments, participants and attendance ledger events. Field names
//! serialize in camelCase to match the documents the mobile clients sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall status of an appointment.
///
/// Only moves forward: `Pending` → `Started` → `Completed`. `Cancelled` is set
/// by the booking layer and is never produced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalStatus {
    Pending,
    Started,
    Completed,
    Cancelled,
}

impl GlobalStatus {
    /// Returns `true` for states no lifecycle operation may leave.
    #[must_use]
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// How a session came to be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    Manual,
    AutoAllScanned,
    AutoQrAllPresent,
    AutoLastParticipant,
}

/// State of the appointment-level check-in token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QrStatus {
    Generated,
    Scanned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Coach,
    Client,
}

/// Invitation response state, independent from attendance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
}

/// Attendance state of a participant.
///
/// Moves only `Pending` → `Present` or `Pending` → `Absent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Pending,
    Present,
    Absent,
}

/// Present/absent/total snapshot recorded when a session is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub present: u32,
    pub absent: u32,
    pub total: u32,
}

/// One scheduled coaching session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: String,

    /// User id of the client who booked the session.
    pub created_by: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by_email: Option<String>,

    /// Display name shown to the coach when the session starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,

    pub coach_id: String,

    /// Cached set of coach user ids allowed to run the session.
    #[serde(default)]
    pub coach_ids: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub coach_email: Option<String>,

    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: u32,
    pub global_status: GlobalStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_mode: Option<StartMode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_started_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_ended_by: Option<String>,

    /// Cached expected-client set. Holds user ids, or lowercased emails for
    /// invitees that have not been linked to an account yet.
    #[serde(default)]
    pub client_ids: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_generated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_status: Option<QrStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendance_summary: Option<AttendanceSummary>,

    /// When the sweeper should finalize a started session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalize_due_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Appointment {
    /// Returns `true` if `user_id` is this appointment's coach, either
    /// directly or through the cached coach-id set.
    #[must_use]
    pub fn lists_coach(&self, user_id: &str) -> bool {
        self.coach_id == user_id || self.coach_ids.iter().any(|id| id == user_id)
    }
}

/// A coach or client attached to one appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub appointment_id: String,

    /// Absent until an emailed invitee signs in and is linked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    pub role: ParticipantRole,
    pub status: InvitationStatus,
    pub attendance_status: AttendanceStatus,

    /// 1-based arrival rank, set on transition to present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendance_order: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendance_marked_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_generated_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Participant {
    /// Returns `true` if this record belongs to the given email, ignoring case.
    #[must_use]
    pub fn has_email(&self, email: &str) -> bool {
        self.email
            .as_deref()
            .is_some_and(|own| own.eq_ignore_ascii_case(email))
    }
}

/// Action recorded by an attendance ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceAction {
    Present,
    Absent,
    AutoAbsent,
    ManualStart,
    AutoStart,
    End,
}

/// Immutable audit record of an attendance-affecting action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceEvent {
    pub id: String,
    pub appointment_id: String,
    pub action: AttendanceAction,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coach_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_mode: Option<StartMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub present: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub absent: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,

    pub created_at: DateTime<Utc>,

    /// Store-assigned insertion sequence, used to break timestamp ties.
    pub seq: u64,
}

/// Ledger entry before the store has assigned its id and sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttendanceEvent {
    pub action: AttendanceAction,
    pub participant_id: Option<String>,
    pub user_id: Option<String>,
    pub coach_id: Option<String>,
    pub start_mode: Option<StartMode>,
    pub order: Option<u32>,
    pub present: Option<u32>,
    pub absent: Option<u32>,
    pub total: Option<u32>,
}

impl NewAttendanceEvent {
    /// Creates an entry carrying only the action tag.
    #[must_use]
    pub fn new(action: AttendanceAction) -> Self {
        Self {
            action,
            participant_id: None,
            user_id: None,
            coach_id: None,
            start_mode: None,
            order: None,
            present: None,
            absent: None,
            total: None,
        }
    }

    #[must_use]
    pub fn with_participant(mut self, participant: &Participant) -> Self {
        self.participant_id = Some(participant.id.clone());
        self.user_id = participant.user_id.clone();
        self
    }

    #[must_use]
    pub fn with_coach(mut self, coach_id: impl Into<String>) -> Self {
        self.coach_id = Some(coach_id.into());
        self
    }

    #[must_use]
    pub fn with_start_mode(mut self, mode: StartMode) -> Self {
        self.start_mode = Some(mode);
        self
    }

    #[must_use]
    pub fn with_order(mut self, order: u32) -> Self {
        self.order = Some(order);
        self
    }

    /// Attaches a present/absent/total snapshot.
    #[must_use]
    pub fn with_summary(mut self, summary: AttendanceSummary) -> Self {
        self.present = Some(summary.present);
        self.absent = Some(summary.absent);
        self.total = Some(summary.total);
        self
    }
}
