//! Session lifecycle engine.
//!
//! A session moves `pending` → `started` → `completed`. Every transition is a
//! guarded single-document update that re-checks the current status inside
//! the store's atomic update, so concurrent devices racing for the same
//! transition produce exactly one winner and the losers observe the result.
//!
//! Operations never fail for expected business conditions. They return a
//! [`LifecycleResult`] carrying `success`, a human readable message, an
//! optional [`ErrorCode`] and whatever context the caller needs to render the
//! outcome. Store failures are logged and reported as
//! [`ErrorCode::InternalError`].
//!
//! # Check-in flows
//!
//! - **Appointment token.** The client shows a per-appointment code; the coach
//!   scans it. The session starts only when every expected client is present.
//! - **Participant token.** Each client shows a short-lived personal code; the
//!   coach scans it, marking that client present. The last arrival starts the
//!   session.
//! - **Manual start.** The coach starts regardless of who is present.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::aggregator::{AttendanceAggregator, AttendanceCounts};
use crate::broadcast::EventBroadcaster;
use crate::clock::Clock;
use crate::error::StoreResult;
use crate::identity::Identity;
use crate::ledger::AttendanceLedger;
use crate::registry::ParticipantRegistry;
use crate::store::{AppointmentFilter, RecordStore, UpdateOutcome};
use crate::token::{self, TokenCodec, TokenPayload};
use crate::types::{
    Appointment, AttendanceAction, AttendanceEvent, AttendanceStatus, AttendanceSummary,
    GlobalStatus, NewAttendanceEvent, Participant, ParticipantRole, QrStatus, StartMode,
};
use crate::window::{self, WindowCheck};

/// Actor recorded as `sessionEndedBy` when the sweeper finalizes a session.
pub const SYSTEM_ACTOR: &str = "system:auto-finalize";

/// Machine-readable reason attached to a lifecycle result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    TokenInvalid,
    TokenExpired,
    TokenMismatch,
    WindowTooEarly,
    WindowTooLate,
    NotAssigned,
    AlreadyPresent,
    AlreadyAbsent,
    NoClientParticipants,
    WaitingForClients,
    NotFound,
    SessionAlreadyStarted,
    SessionClosed,
    InvalidRole,
    InternalError,
}

/// Optional context fields attached to a [`LifecycleResult`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appointment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reused: Option<bool>,
    /// Set when the operation found its work already done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub already: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opens_in_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_seconds_ago: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counts: Option<AttendanceCounts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attendance_order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_mode: Option<StartMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_status: Option<GlobalStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_started: Option<bool>,
    /// The caller should retry; a missing record was just repaired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<AttendanceSummary>,
}

/// Outcome of a lifecycle operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(flatten)]
    pub context: ResultContext,
}

impl LifecycleResult {
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error_code: None,
            context: ResultContext::default(),
        }
    }

    #[must_use]
    pub fn fail(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error_code: Some(code),
            context: ResultContext::default(),
        }
    }

    #[must_use]
    pub fn internal_error() -> Self {
        Self::fail(ErrorCode::InternalError, "Something went wrong, please try again")
    }

    fn not_found(what: &str) -> Self {
        Self::fail(ErrorCode::NotFound, format!("{what} not found"))
    }

    /// Overrides the error code, e.g. for informational successes.
    #[must_use]
    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.error_code = Some(code);
        self
    }

    #[must_use]
    pub fn with_appointment(mut self, appointment_id: impl Into<String>) -> Self {
        self.context.appointment_id = Some(appointment_id.into());
        self
    }

    #[must_use]
    pub fn with_participant(mut self, participant_id: impl Into<String>) -> Self {
        self.context.participant_id = Some(participant_id.into());
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, reused: bool) -> Self {
        self.context.token = Some(token.into());
        self.context.reused = Some(reused);
        self
    }

    #[must_use]
    pub fn with_already(mut self) -> Self {
        self.context.already = Some(true);
        self
    }

    #[must_use]
    pub fn with_expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.context.expires_at = Some(at);
        self
    }

    #[must_use]
    pub fn with_counts(mut self, counts: AttendanceCounts) -> Self {
        self.context.counts = Some(counts);
        self
    }

    #[must_use]
    pub fn with_order(mut self, order: Option<u32>) -> Self {
        self.context.attendance_order = order;
        self
    }

    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.context.client_name = Some(name.into());
        self
    }

    /// Copies status and start mode from an appointment snapshot.
    #[must_use]
    pub fn with_session(mut self, appointment: &Appointment) -> Self {
        self.context.appointment_id = Some(appointment.id.clone());
        self.context.global_status = Some(appointment.global_status);
        self.context.start_mode = appointment.start_mode;
        self
    }

    #[must_use]
    pub fn with_auto_started(mut self, auto_started: bool) -> Self {
        self.context.auto_started = Some(auto_started);
        self
    }

    #[must_use]
    pub fn with_retry(mut self) -> Self {
        self.context.retry = Some(true);
        self
    }

    #[must_use]
    pub fn with_summary(mut self, summary: AttendanceSummary) -> Self {
        self.context.summary = Some(summary);
        self
    }

    #[must_use]
    pub fn is_already(&self) -> bool {
        self.context.already == Some(true)
    }
}

fn whole_minutes_ceil(d: Duration) -> i64 {
    (d.num_seconds() + 59) / 60
}

/// Maps a closed window to its rejection; `None` while open.
fn window_rejection(check: WindowCheck) -> Option<LifecycleResult> {
    match check {
        WindowCheck::Open => None,
        WindowCheck::TooEarly { opens_in } => {
            let mut result = LifecycleResult::fail(
                ErrorCode::WindowTooEarly,
                format!("Check-in opens in {} min", whole_minutes_ceil(opens_in)),
            );
            result.context.opens_in_seconds = Some(opens_in.num_seconds());
            Some(result)
        }
        WindowCheck::TooLate { closed_ago } => {
            let mut result = LifecycleResult::fail(
                ErrorCode::WindowTooLate,
                "The check-in window for this session has closed",
            );
            result.context.closed_seconds_ago = Some(closed_ago.num_seconds());
            Some(result)
        }
    }
}

fn closed_session(appointment: &Appointment) -> LifecycleResult {
    let message = match appointment.global_status {
        GlobalStatus::Cancelled => "This session was cancelled",
        _ => "This session has already ended",
    };
    LifecycleResult::fail(ErrorCode::SessionClosed, message).with_session(appointment)
}

fn participant_label(participant: &Participant) -> String {
    participant
        .display_name
        .clone()
        .or_else(|| participant.email.clone())
        .unwrap_or_else(|| "Participant".to_string())
}

enum StartTransition {
    Started(Appointment),
    AlreadyStarted(Appointment),
    Closed(Appointment),
    Missing,
}

/// Runs the check-in and session lifecycle operations.
#[derive(Clone)]
pub struct SessionLifecycleManager {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    codec: TokenCodec,
    registry: ParticipantRegistry,
    ledger: AttendanceLedger,
    aggregator: AttendanceAggregator,
}

impl std::fmt::Debug for SessionLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLifecycleManager")
            .field("codec", &self.codec)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl SessionLifecycleManager {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, codec: TokenCodec) -> Self {
        Self {
            registry: ParticipantRegistry::new(Arc::clone(&store), Arc::clone(&clock)),
            ledger: AttendanceLedger::new(Arc::clone(&store), Arc::clone(&clock)),
            aggregator: AttendanceAggregator::new(Arc::clone(&store)),
            store,
            clock,
            codec,
        }
    }

    /// Publishes every ledger entry on `broadcaster`.
    #[must_use]
    pub fn with_broadcaster(mut self, broadcaster: EventBroadcaster) -> Self {
        self.ledger = self.ledger.with_broadcaster(broadcaster);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Turns a store failure into `internal_error` and logs rejections.
    fn settle(operation: &'static str, result: StoreResult<LifecycleResult>) -> LifecycleResult {
        match result {
            Ok(result) => {
                if let Some(code) = result.error_code.filter(|_| !result.success) {
                    debug!(operation, error_code = ?code, "Lifecycle operation rejected");
                }
                result
            }
            Err(err) => {
                error!(operation, error = %err, "Store failure during lifecycle operation");
                LifecycleResult::internal_error()
            }
        }
    }

    fn client_display_name(&self, appointment: &Appointment) -> StoreResult<String> {
        if let Some(name) = appointment.client_name.clone() {
            return Ok(name);
        }
        let creator = self
            .registry
            .find_client_by_user(&appointment.id, &appointment.created_by)?;
        Ok(creator
            .and_then(|p| p.display_name)
            .unwrap_or_else(|| "your client".to_string()))
    }

    fn current_counts(&self, appointment_id: &str) -> StoreResult<AttendanceCounts> {
        Ok(self
            .aggregator
            .counts(appointment_id)?
            .unwrap_or(AttendanceCounts {
                present: 0,
                absent: 0,
                total: 0,
                approximate: true,
            }))
    }

    /// Guarded `pending` → `started`. Also persists the auto-finalize due
    /// time in the same update.
    fn start_session(
        &self,
        appointment_id: &str,
        started_by: &str,
        mode: StartMode,
    ) -> StoreResult<StartTransition> {
        let now = self.clock.now();
        let outcome = self.store.update_appointment(appointment_id, &mut |appt| {
            if appt.global_status != GlobalStatus::Pending {
                return false;
            }
            appt.global_status = GlobalStatus::Started;
            appt.start_mode = Some(mode);
            appt.session_started_at = Some(now);
            appt.session_started_by = Some(started_by.to_string());
            appt.finalize_due_at = Some(window::session_end(now, appt.duration_minutes));
            if mode == StartMode::AutoQrAllPresent {
                appt.qr_status = Some(QrStatus::Scanned);
            }
            true
        })?;

        Ok(match outcome {
            UpdateOutcome::Applied(appt) => {
                info!(
                    appointment_id = %appt.id,
                    started_by = %started_by,
                    start_mode = ?mode,
                    "Session started"
                );
                StartTransition::Started(appt)
            }
            UpdateOutcome::Skipped(appt) if appt.global_status == GlobalStatus::Started => {
                StartTransition::AlreadyStarted(appt)
            }
            UpdateOutcome::Skipped(appt) => StartTransition::Closed(appt),
            UpdateOutcome::Missing => StartTransition::Missing,
        })
    }

    fn record_start(&self, appointment: &Appointment, coach_id: &str, counts: AttendanceCounts) {
        let (action, mode) = match appointment.start_mode {
            Some(StartMode::Manual) | None => (AttendanceAction::ManualStart, StartMode::Manual),
            Some(mode) => (AttendanceAction::AutoStart, mode),
        };
        self.ledger.append(
            &appointment.id,
            NewAttendanceEvent::new(action)
                .with_coach(coach_id)
                .with_start_mode(mode)
                .with_summary(counts.summary()),
        );
    }

    // ---------------------------------------------------------------------
    // Appointment token
    // ---------------------------------------------------------------------

    /// Returns the appointment's check-in token, minting it on first call.
    ///
    /// Only the creator, an expected client or an assigned coach may see it.
    pub fn generate_appointment_token(
        &self,
        appointment_id: &str,
        caller: &Identity,
    ) -> LifecycleResult {
        Self::settle(
            "generate_appointment_token",
            self.try_generate_appointment_token(appointment_id, caller),
        )
    }

    fn try_generate_appointment_token(
        &self,
        appointment_id: &str,
        caller: &Identity,
    ) -> StoreResult<LifecycleResult> {
        let Some(appt) = self.store.get_appointment(appointment_id)? else {
            return Ok(LifecycleResult::not_found("Appointment"));
        };
        if !self.may_see_appointment_code(&appt, caller)? {
            warn!(
                appointment_id = %appt.id,
                user_id = %caller.user_id,
                "Appointment code requested by non-participant"
            );
            return Ok(LifecycleResult::fail(
                ErrorCode::NotAssigned,
                "You are not a participant of this session",
            )
            .with_appointment(&appt.id));
        }
        if appt.global_status.is_closed() {
            return Ok(closed_session(&appt));
        }
        if appt.global_status == GlobalStatus::Started {
            return Ok(LifecycleResult::fail(
                ErrorCode::SessionAlreadyStarted,
                "This session has already started",
            )
            .with_session(&appt));
        }

        let now = self.clock.now();
        if let Some(rejection) = window_rejection(window::can_generate(appt.scheduled_at, now)) {
            return Ok(rejection.with_appointment(&appt.id));
        }

        let fresh = token::mint_appointment_token(&appt.id, now);
        let outcome = self.store.update_appointment(&appt.id, &mut |a| {
            if a.qr_token.is_some() || a.global_status != GlobalStatus::Pending {
                return false;
            }
            a.qr_token = Some(fresh.clone());
            a.qr_generated_at = Some(now);
            a.qr_status = Some(QrStatus::Generated);
            true
        })?;

        Ok(match outcome {
            UpdateOutcome::Applied(a) => {
                info!(appointment_id = %a.id, "Appointment check-in code generated");
                LifecycleResult::ok("Check-in code ready")
                    .with_appointment(&a.id)
                    .with_token(fresh, false)
            }
            UpdateOutcome::Skipped(a) => match a.qr_token.clone() {
                Some(existing) if a.global_status == GlobalStatus::Pending => {
                    LifecycleResult::ok("Check-in code ready")
                        .with_appointment(&a.id)
                        .with_token(existing, true)
                }
                _ if a.global_status.is_closed() => closed_session(&a),
                _ => LifecycleResult::fail(
                    ErrorCode::SessionAlreadyStarted,
                    "This session has already started",
                )
                .with_session(&a),
            },
            UpdateOutcome::Missing => LifecycleResult::not_found("Appointment"),
        })
    }

    fn may_see_appointment_code(&self, appt: &Appointment, caller: &Identity) -> StoreResult<bool> {
        if self.registry.is_expected_client(appt, caller)? {
            return Ok(true);
        }
        if self.registry.find_client_by_user(&appt.id, &caller.user_id)?.is_some() {
            return Ok(true);
        }
        self.registry.is_coach_assigned(appt, caller)
    }

    /// Coach scans the appointment token. Starts the session once every
    /// expected client is present.
    pub fn scan_appointment_token(&self, token: &str, coach: &Identity) -> LifecycleResult {
        Self::settle(
            "scan_appointment_token",
            self.try_scan_appointment_token(token, coach),
        )
    }

    fn try_scan_appointment_token(
        &self,
        presented: &str,
        coach: &Identity,
    ) -> StoreResult<LifecycleResult> {
        let Some(appointment_id) = token::appointment_id_from_token(presented) else {
            return Ok(LifecycleResult::fail(
                ErrorCode::TokenInvalid,
                "This code is not a valid check-in code",
            ));
        };
        let Some(appt) = self.store.get_appointment(appointment_id)? else {
            return Ok(LifecycleResult::fail(
                ErrorCode::TokenInvalid,
                "This code does not belong to any session",
            ));
        };

        if appt.global_status == GlobalStatus::Started {
            return Ok(LifecycleResult::ok("Session already started")
                .with_session(&appt)
                .with_already());
        }
        if appt.global_status.is_closed() {
            return Ok(closed_session(&appt));
        }

        let matches_stored = appt
            .qr_token
            .as_deref()
            .is_some_and(|stored| token::tokens_match(presented, stored));
        if !matches_stored {
            return Ok(LifecycleResult::fail(
                ErrorCode::TokenMismatch,
                "This code is out of date, ask the client to refresh it",
            )
            .with_appointment(&appt.id));
        }

        if let Some(rejection) =
            window_rejection(window::can_scan(appt.scheduled_at, self.clock.now()))
        {
            return Ok(rejection.with_appointment(&appt.id));
        }

        if !self.registry.is_coach_assigned(&appt, coach)? {
            return Ok(LifecycleResult::fail(
                ErrorCode::NotAssigned,
                "You are not assigned to this session",
            )
            .with_appointment(&appt.id));
        }

        let counts = self.current_counts(&appt.id)?;
        if counts.total == 0 {
            self.registry.ensure_client_participant(
                &appt.id,
                &appt.created_by,
                appt.created_by_email.as_deref(),
            )?;
            return Ok(LifecycleResult::fail(
                ErrorCode::NoClientParticipants,
                "Client records were missing and have been repaired, please scan again",
            )
            .with_appointment(&appt.id)
            .with_retry());
        }
        if !counts.all_present() {
            return Ok(LifecycleResult::fail(
                ErrorCode::WaitingForClients,
                format!("Waiting for clients ({}/{} present)", counts.present, counts.total),
            )
            .with_appointment(&appt.id)
            .with_counts(counts));
        }

        let client_name = self.client_display_name(&appt)?;
        Ok(
            match self.start_session(&appt.id, &coach.user_id, StartMode::AutoQrAllPresent)? {
                StartTransition::Started(started) => {
                    self.record_start(&started, &coach.user_id, counts);
                    LifecycleResult::ok(format!("Session with {client_name} started"))
                        .with_session(&started)
                        .with_counts(counts)
                        .with_client_name(client_name)
                }
                StartTransition::AlreadyStarted(current) => {
                    LifecycleResult::ok("Session already started")
                        .with_session(&current)
                        .with_already()
                }
                StartTransition::Closed(current) => closed_session(&current),
                StartTransition::Missing => LifecycleResult::not_found("Appointment"),
            },
        )
    }

    // ---------------------------------------------------------------------
    // Participant token
    // ---------------------------------------------------------------------

    /// Issues the caller's personal check-in token, reusing one minted in
    /// the last few minutes.
    pub fn generate_participant_token(&self, appointment_id: &str, user: &Identity) -> LifecycleResult {
        Self::settle(
            "generate_participant_token",
            self.try_generate_participant_token(appointment_id, user),
        )
    }

    fn try_generate_participant_token(
        &self,
        appointment_id: &str,
        user: &Identity,
    ) -> StoreResult<LifecycleResult> {
        let Some(appt) = self.store.get_appointment(appointment_id)? else {
            return Ok(LifecycleResult::not_found("Appointment"));
        };
        if appt.global_status.is_closed() {
            return Ok(closed_session(&appt));
        }
        if appt.global_status == GlobalStatus::Started {
            return Ok(LifecycleResult::fail(
                ErrorCode::SessionAlreadyStarted,
                "This session has already started",
            )
            .with_session(&appt));
        }

        let now = self.clock.now();
        if let Some(rejection) =
            window_rejection(window::can_generate_participant_token(appt.scheduled_at, now))
        {
            return Ok(rejection.with_appointment(&appt.id));
        }

        let participant = match self.registry.find_client_by_user(&appt.id, &user.user_id)? {
            Some(participant) => participant,
            None => {
                if !self.registry.is_expected_client(&appt, user)? {
                    return Ok(LifecycleResult::fail(
                        ErrorCode::NotAssigned,
                        "You are not a participant of this session",
                    )
                    .with_appointment(&appt.id));
                }
                self.registry
                    .ensure_client_participant(&appt.id, &user.user_id, user.email.as_deref())?
            }
        };

        if let Some(result) = self.attendance_already_resolved(&participant) {
            return Ok(result.with_appointment(&appt.id));
        }

        let payload = TokenPayload::new(&appt.id, &participant.id, now);
        let fresh = self.codec.encode(&payload);
        let outcome = self.store.update_participant(&participant.id, &mut |p| {
            if p.attendance_status != AttendanceStatus::Pending {
                return false;
            }
            if self.reusable_token(p, now).is_some() {
                return false;
            }
            p.qr_token = Some(fresh.clone());
            p.qr_generated_at = Some(now);
            true
        })?;

        Ok(match outcome {
            UpdateOutcome::Applied(p) => {
                debug!(
                    appointment_id = %appt.id,
                    participant_id = %p.id,
                    "Participant check-in code issued"
                );
                LifecycleResult::ok("Show this code to your coach")
                    .with_appointment(&appt.id)
                    .with_participant(&p.id)
                    .with_token(fresh, false)
                    .with_expires_at(window::participant_token_expires_at(now))
            }
            UpdateOutcome::Skipped(p) => {
                if let Some(result) = self.attendance_already_resolved(&p) {
                    result.with_appointment(&appt.id)
                } else if let Some((existing, issued_at)) = self.reusable_token(&p, now) {
                    LifecycleResult::ok("Show this code to your coach")
                        .with_appointment(&appt.id)
                        .with_participant(&p.id)
                        .with_token(existing, true)
                        .with_expires_at(window::participant_token_expires_at(issued_at))
                } else {
                    error!(participant_id = %p.id, "Participant token update declined without cause");
                    LifecycleResult::internal_error()
                }
            }
            UpdateOutcome::Missing => LifecycleResult::not_found("Participant"),
        })
    }

    fn reusable_token(&self, participant: &Participant, now: DateTime<Utc>) -> Option<(String, DateTime<Utc>)> {
        let token = participant.qr_token.as_deref()?;
        let issued_at = participant.qr_generated_at?;
        let decodes = self.codec.decode(token).is_some();
        (decodes && window::participant_token_reusable(issued_at, now))
            .then(|| (token.to_string(), issued_at))
    }

    fn attendance_already_resolved(&self, participant: &Participant) -> Option<LifecycleResult> {
        match participant.attendance_status {
            AttendanceStatus::Pending => None,
            AttendanceStatus::Present => Some(
                LifecycleResult::fail(ErrorCode::AlreadyPresent, "You are already checked in")
                    .with_participant(&participant.id)
                    .with_order(participant.attendance_order),
            ),
            AttendanceStatus::Absent => Some(
                LifecycleResult::fail(ErrorCode::AlreadyAbsent, "You were marked absent")
                    .with_participant(&participant.id),
            ),
        }
    }

    /// Coach scans a participant token, marking that client present. The
    /// scan that completes the expected set starts the session.
    pub fn scan_participant_token(&self, token: &str, coach: &Identity) -> LifecycleResult {
        Self::settle(
            "scan_participant_token",
            self.try_scan_participant_token(token, coach),
        )
    }

    fn try_scan_participant_token(
        &self,
        presented: &str,
        coach: &Identity,
    ) -> StoreResult<LifecycleResult> {
        let invalid = || {
            LifecycleResult::fail(ErrorCode::TokenInvalid, "This code is not a valid check-in code")
        };
        let Some(payload) = self.codec.decode(presented) else {
            return Ok(invalid());
        };
        let Some(issued_at) = payload.issued_at() else {
            return Ok(invalid());
        };

        let now = self.clock.now();
        if window::participant_token_expired(issued_at, now) {
            return Ok(LifecycleResult::fail(
                ErrorCode::TokenExpired,
                "This code has expired, ask the client to refresh it",
            )
            .with_appointment(&payload.appointment_id));
        }

        let Some(participant) = self.store.get_participant(&payload.participant_id)? else {
            return Ok(LifecycleResult::not_found("Participant"));
        };
        if participant.appointment_id != payload.appointment_id {
            return Ok(LifecycleResult::fail(
                ErrorCode::TokenMismatch,
                "This code belongs to a different session",
            ));
        }
        let Some(appt) = self.store.get_appointment(&participant.appointment_id)? else {
            return Ok(LifecycleResult::not_found("Appointment"));
        };

        if participant.role != ParticipantRole::Client {
            return Ok(LifecycleResult::fail(
                ErrorCode::InvalidRole,
                "Only client codes can be scanned",
            )
            .with_appointment(&appt.id));
        }
        if !self.registry.is_coach_assigned(&appt, coach)? {
            return Ok(LifecycleResult::fail(
                ErrorCode::NotAssigned,
                "You are not assigned to this session",
            )
            .with_appointment(&appt.id));
        }
        if appt.global_status.is_closed() {
            return Ok(closed_session(&appt));
        }

        let label = participant_label(&participant);
        match participant.attendance_status {
            AttendanceStatus::Present => {
                return self.already_present(&appt.id, &participant, &label);
            }
            AttendanceStatus::Absent => {
                return Ok(LifecycleResult::fail(
                    ErrorCode::AlreadyAbsent,
                    format!("{label} was already marked absent"),
                )
                .with_appointment(&appt.id)
                .with_participant(&participant.id));
            }
            AttendanceStatus::Pending => {}
        }

        let next_order = self
            .registry
            .client_participants(&appt.id)?
            .iter()
            .filter_map(|p| p.attendance_order)
            .max()
            .unwrap_or(0)
            + 1;
        let outcome = self.store.update_participant(&participant.id, &mut |p| {
            if p.attendance_status != AttendanceStatus::Pending {
                return false;
            }
            p.attendance_status = AttendanceStatus::Present;
            p.attendance_order = Some(next_order);
            p.attendance_marked_at = Some(now);
            true
        })?;

        let marked = match outcome {
            UpdateOutcome::Applied(p) => p,
            UpdateOutcome::Skipped(p) if p.attendance_status == AttendanceStatus::Present => {
                return self.already_present(&appt.id, &p, &label);
            }
            UpdateOutcome::Skipped(p) => {
                return Ok(LifecycleResult::fail(
                    ErrorCode::AlreadyAbsent,
                    format!("{label} was already marked absent"),
                )
                .with_appointment(&appt.id)
                .with_participant(&p.id));
            }
            UpdateOutcome::Missing => return Ok(LifecycleResult::not_found("Participant")),
        };

        info!(
            appointment_id = %appt.id,
            participant_id = %marked.id,
            order = next_order,
            "Participant checked in"
        );
        self.ledger.append(
            &appt.id,
            NewAttendanceEvent::new(AttendanceAction::Present)
                .with_participant(&marked)
                .with_coach(&coach.user_id)
                .with_order(next_order),
        );

        let counts = self.current_counts(&appt.id)?;
        let mut result = LifecycleResult::ok(format!("{label} checked in (#{next_order})"))
            .with_appointment(&appt.id)
            .with_participant(&marked.id)
            .with_order(marked.attendance_order)
            .with_counts(counts);

        let mut auto_started = false;
        if counts.all_present() {
            match self.start_session(&appt.id, &coach.user_id, StartMode::AutoLastParticipant)? {
                StartTransition::Started(started) => {
                    self.record_start(&started, &coach.user_id, counts);
                    auto_started = true;
                    result = result.with_session(&started);
                    result.message = format!("{label} checked in, everyone is here: session started");
                }
                StartTransition::AlreadyStarted(current) | StartTransition::Closed(current) => {
                    result = result.with_session(&current);
                }
                StartTransition::Missing => {}
            }
        }
        Ok(result.with_auto_started(auto_started))
    }

    fn already_present(
        &self,
        appointment_id: &str,
        participant: &Participant,
        label: &str,
    ) -> StoreResult<LifecycleResult> {
        let counts = self.current_counts(appointment_id)?;
        Ok(LifecycleResult::ok(format!("{label} is already checked in"))
            .with_code(ErrorCode::AlreadyPresent)
            .with_already()
            .with_appointment(appointment_id)
            .with_participant(&participant.id)
            .with_order(participant.attendance_order)
            .with_counts(counts))
    }

    // ---------------------------------------------------------------------
    // Coach controls
    // ---------------------------------------------------------------------

    /// Starts the session regardless of who is present.
    pub fn manual_start(&self, appointment_id: &str, coach: &Identity) -> LifecycleResult {
        Self::settle("manual_start", self.try_manual_start(appointment_id, coach))
    }

    fn try_manual_start(&self, appointment_id: &str, coach: &Identity) -> StoreResult<LifecycleResult> {
        let Some(appt) = self.store.get_appointment(appointment_id)? else {
            return Ok(LifecycleResult::not_found("Appointment"));
        };
        if !self.registry.is_coach_assigned(&appt, coach)? {
            return Ok(LifecycleResult::fail(
                ErrorCode::NotAssigned,
                "You are not assigned to this session",
            )
            .with_appointment(&appt.id));
        }
        if appt.global_status.is_closed() {
            return Ok(closed_session(&appt));
        }
        if appt.global_status == GlobalStatus::Started {
            return Ok(LifecycleResult::ok("Session already started")
                .with_session(&appt)
                .with_already());
        }

        let counts = self.current_counts(&appt.id)?;
        Ok(match self.start_session(&appt.id, &coach.user_id, StartMode::Manual)? {
            StartTransition::Started(started) => {
                self.record_start(&started, &coach.user_id, counts);
                LifecycleResult::ok("Session started")
                    .with_session(&started)
                    .with_counts(counts)
            }
            StartTransition::AlreadyStarted(current) => LifecycleResult::ok("Session already started")
                .with_session(&current)
                .with_already(),
            StartTransition::Closed(current) => closed_session(&current),
            StartTransition::Missing => LifecycleResult::not_found("Appointment"),
        })
    }

    /// Ends the session: pending clients become absent, the appointment is
    /// completed with an attendance summary.
    pub fn finalize_session(&self, appointment_id: &str, coach: &Identity) -> LifecycleResult {
        Self::settle(
            "finalize_session",
            self.try_finalize_session(appointment_id, Some(coach)),
        )
    }

    /// Finalizes on behalf of the system, skipping the coach check.
    pub fn finalize_as_system(&self, appointment_id: &str) -> LifecycleResult {
        Self::settle("finalize_as_system", self.try_finalize_session(appointment_id, None))
    }

    fn try_finalize_session(
        &self,
        appointment_id: &str,
        coach: Option<&Identity>,
    ) -> StoreResult<LifecycleResult> {
        let Some(appt) = self.store.get_appointment(appointment_id)? else {
            return Ok(LifecycleResult::not_found("Appointment"));
        };
        if let Some(coach) = coach {
            if !self.registry.is_coach_assigned(&appt, coach)? {
                return Ok(LifecycleResult::fail(
                    ErrorCode::NotAssigned,
                    "You are not assigned to this session",
                )
                .with_appointment(&appt.id));
            }
        }
        let ended_by = coach.map_or(SYSTEM_ACTOR, |c| c.user_id.as_str());

        match appt.global_status {
            GlobalStatus::Cancelled => return Ok(closed_session(&appt)),
            GlobalStatus::Completed => return Ok(Self::already_completed(&appt)),
            GlobalStatus::Pending | GlobalStatus::Started => {}
        }

        let now = self.clock.now();
        for pending in self
            .registry
            .client_participants(&appt.id)?
            .into_iter()
            .filter(|p| p.attendance_status == AttendanceStatus::Pending)
        {
            let outcome = self.store.update_participant(&pending.id, &mut |p| {
                if p.attendance_status != AttendanceStatus::Pending {
                    return false;
                }
                p.attendance_status = AttendanceStatus::Absent;
                p.attendance_marked_at = Some(now);
                true
            })?;
            if let UpdateOutcome::Applied(absent) = outcome {
                self.ledger.append(
                    &appt.id,
                    NewAttendanceEvent::new(AttendanceAction::AutoAbsent)
                        .with_participant(&absent)
                        .with_coach(ended_by),
                );
            }
        }

        let summary = self.current_counts(&appt.id)?.summary();
        let outcome = self.store.update_appointment(&appt.id, &mut |a| {
            if !matches!(a.global_status, GlobalStatus::Pending | GlobalStatus::Started) {
                return false;
            }
            a.global_status = GlobalStatus::Completed;
            a.session_ended_at = Some(now);
            a.session_ended_by = Some(ended_by.to_string());
            a.attendance_summary = Some(summary);
            a.finalize_due_at = None;
            true
        })?;

        Ok(match outcome {
            UpdateOutcome::Applied(done) => {
                info!(
                    appointment_id = %done.id,
                    ended_by = %ended_by,
                    present = summary.present,
                    absent = summary.absent,
                    total = summary.total,
                    "Session finalized"
                );
                self.ledger.append(
                    &done.id,
                    NewAttendanceEvent::new(AttendanceAction::End)
                        .with_coach(ended_by)
                        .with_summary(summary),
                );
                LifecycleResult::ok("Session completed")
                    .with_session(&done)
                    .with_summary(summary)
            }
            UpdateOutcome::Skipped(current) if current.global_status == GlobalStatus::Completed => {
                Self::already_completed(&current)
            }
            UpdateOutcome::Skipped(current) => closed_session(&current),
            UpdateOutcome::Missing => LifecycleResult::not_found("Appointment"),
        })
    }

    fn already_completed(appointment: &Appointment) -> LifecycleResult {
        let mut result = LifecycleResult::ok("Session already completed")
            .with_session(appointment)
            .with_already();
        result.context.summary = appointment.attendance_summary;
        result
    }

    /// Marks one client absent by hand.
    pub fn mark_absent(
        &self,
        appointment_id: &str,
        participant_id: &str,
        coach: &Identity,
    ) -> LifecycleResult {
        Self::settle(
            "mark_absent",
            self.try_mark_absent(appointment_id, participant_id, coach),
        )
    }

    fn try_mark_absent(
        &self,
        appointment_id: &str,
        participant_id: &str,
        coach: &Identity,
    ) -> StoreResult<LifecycleResult> {
        let Some(appt) = self.store.get_appointment(appointment_id)? else {
            return Ok(LifecycleResult::not_found("Appointment"));
        };
        let Some(participant) = self
            .store
            .get_participant(participant_id)?
            .filter(|p| p.appointment_id == appt.id)
        else {
            return Ok(LifecycleResult::not_found("Participant"));
        };
        if !self.registry.is_coach_assigned(&appt, coach)? {
            return Ok(LifecycleResult::fail(
                ErrorCode::NotAssigned,
                "You are not assigned to this session",
            )
            .with_appointment(&appt.id));
        }
        if participant.role != ParticipantRole::Client {
            return Ok(LifecycleResult::fail(
                ErrorCode::InvalidRole,
                "Only clients can be marked absent",
            )
            .with_appointment(&appt.id));
        }
        if appt.global_status == GlobalStatus::Cancelled {
            return Ok(closed_session(&appt));
        }

        let label = participant_label(&participant);
        let now = self.clock.now();
        let outcome = self.store.update_participant(&participant.id, &mut |p| {
            if p.attendance_status != AttendanceStatus::Pending {
                return false;
            }
            p.attendance_status = AttendanceStatus::Absent;
            p.attendance_marked_at = Some(now);
            true
        })?;

        let result = match outcome {
            UpdateOutcome::Applied(absent) => {
                info!(
                    appointment_id = %appt.id,
                    participant_id = %absent.id,
                    "Participant marked absent"
                );
                self.ledger.append(
                    &appt.id,
                    NewAttendanceEvent::new(AttendanceAction::Absent)
                        .with_participant(&absent)
                        .with_coach(&coach.user_id),
                );
                LifecycleResult::ok(format!("{label} marked absent"))
            }
            UpdateOutcome::Skipped(current) if current.attendance_status == AttendanceStatus::Present => {
                LifecycleResult::fail(
                    ErrorCode::AlreadyPresent,
                    format!("{label} is checked in and cannot be marked absent"),
                )
                .with_order(current.attendance_order)
            }
            UpdateOutcome::Skipped(_) => {
                LifecycleResult::ok(format!("{label} was already marked absent")).with_already()
            }
            UpdateOutcome::Missing => return Ok(LifecycleResult::not_found("Participant")),
        };

        let counts = self.current_counts(&appt.id)?;
        Ok(result
            .with_appointment(&appt.id)
            .with_participant(&participant.id)
            .with_counts(counts))
    }

    // ---------------------------------------------------------------------
    // Read projections
    // ---------------------------------------------------------------------

    /// Current counts, or `None` for an unknown appointment.
    pub fn counts(&self, appointment_id: &str) -> StoreResult<Option<AttendanceCounts>> {
        self.aggregator.counts(appointment_id)
    }

    /// Ledger entries, oldest first.
    pub fn history(&self, appointment_id: &str) -> StoreResult<Vec<AttendanceEvent>> {
        self.ledger.history(appointment_id)
    }

    /// The session `coach_id` most recently started and has not finished.
    pub fn active_session_for_coach(&self, coach_id: &str) -> StoreResult<Option<Appointment>> {
        let active = self.store.find_appointments(
            &AppointmentFilter::new()
                .with_status(GlobalStatus::Started)
                .with_started_by(coach_id),
        )?;
        Ok(active.into_iter().max_by_key(|a| a.session_started_at))
    }

    /// Started sessions whose auto-finalize time has passed.
    pub fn due_for_finalize(&self) -> StoreResult<Vec<Appointment>> {
        self.store.find_appointments(
            &AppointmentFilter::new()
                .with_status(GlobalStatus::Started)
                .with_finalize_due_by(self.clock.now()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::failing::FailingLedgerStore;
    use crate::store::fixtures::{appointment, participant};
    use crate::store::InMemoryStore;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 14, 0, 0).unwrap()
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        start() + Duration::minutes(minutes)
    }

    fn coach() -> Identity {
        Identity::new("coach-1")
    }

    fn client() -> Identity {
        Identity::new("client-1")
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        clock: ManualClock,
        manager: SessionLifecycleManager,
    }

    /// One appointment `a-1` at `start()`, coach `coach-1` and one expected
    /// client `client-1` with participant record `p-1`.
    fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        store.insert_appointment(appointment("a-1", start())).unwrap();
        store
            .insert_participant(participant("p-coach", "a-1", Some("coach-1"), ParticipantRole::Coach, at(-1440)))
            .unwrap();
        store
            .insert_participant(participant("p-1", "a-1", Some("client-1"), ParticipantRole::Client, at(-1440)))
            .unwrap();
        let clock = ManualClock::new(at(-10));
        let manager =
            SessionLifecycleManager::new(store.clone(), Arc::new(clock.clone()), TokenCodec::unsigned());
        Harness { store, clock, manager }
    }

    fn add_client(h: &Harness, participant_id: &str, user_id: &str) {
        h.store
            .insert_participant(participant(participant_id, "a-1", Some(user_id), ParticipantRole::Client, at(-1440)))
            .unwrap();
        h.store
            .update_appointment("a-1", &mut |a| {
                a.client_ids.push(user_id.to_string());
                true
            })
            .unwrap();
    }

    fn appt(h: &Harness) -> Appointment {
        h.store.get_appointment("a-1").unwrap().unwrap()
    }

    fn issue(h: &Harness, user: &Identity) -> String {
        let result = h.manager.generate_participant_token("a-1", user);
        assert!(result.success, "{result:?}");
        result.context.token.expect("token issued")
    }

    #[test]
    fn test_appointment_token_is_idempotent() {
        let h = harness();
        let first = h.manager.generate_appointment_token("a-1", &client());
        assert!(first.success);
        assert_eq!(first.context.reused, Some(false));
        let token = first.context.token.clone().unwrap();
        assert!(token.starts_with("a-1_"));
        assert_eq!(appt(&h).qr_status, Some(QrStatus::Generated));

        h.clock.advance(Duration::minutes(3));
        let second = h.manager.generate_appointment_token("a-1", &client());
        assert_eq!(second.context.token.as_deref(), Some(token.as_str()));
        assert_eq!(second.context.reused, Some(true));
    }

    #[test]
    fn test_appointment_token_requires_a_participant() {
        let h = harness();
        let stranger = h.manager.generate_appointment_token("a-1", &Identity::new("stranger"));
        assert!(!stranger.success);
        assert_eq!(stranger.error_code, Some(ErrorCode::NotAssigned));
        assert!(stranger.context.token.is_none());
        assert_eq!(appt(&h).qr_token, None);

        let by_coach = h.manager.generate_appointment_token("a-1", &coach());
        assert!(by_coach.success, "{by_coach:?}");
        let by_client = h.manager.generate_appointment_token("a-1", &client());
        assert_eq!(by_client.context.token, by_coach.context.token);
        assert_eq!(by_client.context.reused, Some(true));
    }

    #[test]
    fn test_appointment_token_window() {
        let h = harness();
        h.clock.set(at(-31));
        let early = h.manager.generate_appointment_token("a-1", &client());
        assert_eq!(early.error_code, Some(ErrorCode::WindowTooEarly));
        assert_eq!(early.context.opens_in_seconds, Some(60));

        h.clock.set(at(16));
        let late = h.manager.generate_appointment_token("a-1", &client());
        assert_eq!(late.error_code, Some(ErrorCode::WindowTooLate));

        assert_eq!(
            h.manager.generate_appointment_token("nope", &client()).error_code,
            Some(ErrorCode::NotFound)
        );
    }

    #[test]
    fn test_appointment_scan_waits_then_starts() {
        let h = harness();
        let token = h.manager.generate_appointment_token("a-1", &client()).context.token.unwrap();

        let waiting = h.manager.scan_appointment_token(&token, &coach());
        assert!(!waiting.success);
        assert_eq!(waiting.error_code, Some(ErrorCode::WaitingForClients));
        assert_eq!(waiting.context.counts.map(|c| (c.present, c.total)), Some((0, 1)));

        h.store
            .update_participant("p-1", &mut |p| {
                p.attendance_status = AttendanceStatus::Present;
                true
            })
            .unwrap();

        let started = h.manager.scan_appointment_token(&token, &coach());
        assert!(started.success, "{started:?}");
        assert_eq!(started.context.client_name.as_deref(), Some("Client One"));
        let a = appt(&h);
        assert_eq!(a.global_status, GlobalStatus::Started);
        assert_eq!(a.start_mode, Some(StartMode::AutoQrAllPresent));
        assert_eq!(a.qr_status, Some(QrStatus::Scanned));
        assert_eq!(a.finalize_due_at, Some(at(-10) + Duration::minutes(60)));

        let again = h.manager.scan_appointment_token(&token, &coach());
        assert!(again.success && again.is_already());
    }

    #[test]
    fn test_appointment_scan_rejections() {
        let h = harness();
        let token = h.manager.generate_appointment_token("a-1", &client()).context.token.unwrap();

        assert_eq!(
            h.manager.scan_appointment_token("garbage", &coach()).error_code,
            Some(ErrorCode::TokenInvalid)
        );
        assert_eq!(
            h.manager
                .scan_appointment_token("a-1_1780000000000_ZZZZZZZZZ", &coach())
                .error_code,
            Some(ErrorCode::TokenMismatch)
        );
        assert_eq!(
            h.manager
                .scan_appointment_token(&token, &Identity::new("other-coach"))
                .error_code,
            Some(ErrorCode::NotAssigned)
        );

        h.clock.set(at(20));
        assert_eq!(
            h.manager.scan_appointment_token(&token, &coach()).error_code,
            Some(ErrorCode::WindowTooLate)
        );
    }

    #[test]
    fn test_appointment_scan_with_no_clients_self_heals() {
        let store = Arc::new(InMemoryStore::new());
        let mut legacy = appointment("a-1", start());
        legacy.client_ids.clear();
        store.insert_appointment(legacy).unwrap();
        let clock = ManualClock::new(at(-5));
        let manager =
            SessionLifecycleManager::new(store.clone(), Arc::new(clock), TokenCodec::unsigned());
        let token = manager.generate_appointment_token("a-1", &client()).context.token.unwrap();

        let result = manager.scan_appointment_token(&token, &coach());
        assert_eq!(result.error_code, Some(ErrorCode::NoClientParticipants));
        assert_eq!(result.context.retry, Some(true));

        let healed = manager.registry().find_client_by_user("a-1", "client-1").unwrap();
        assert!(healed.is_some());
        let retry = manager.scan_appointment_token(&token, &coach());
        assert_eq!(retry.error_code, Some(ErrorCode::WaitingForClients));
    }

    #[test]
    fn test_newcomer_on_legacy_appointment_keeps_existing_clients_expected() {
        let h = harness();
        h.store
            .update_appointment("a-1", &mut |a| {
                a.client_ids.clear();
                true
            })
            .unwrap();

        let token = issue(&h, &Identity::new("client-2"));
        let scanned = h.manager.scan_participant_token(&token, &coach());
        assert!(scanned.success, "{scanned:?}");
        assert_eq!(scanned.context.auto_started, Some(false));

        let a = appt(&h);
        assert_eq!(a.global_status, GlobalStatus::Pending);
        assert_eq!(a.client_ids, vec!["client-1", "client-2"]);
        let counts = h.manager.counts("a-1").unwrap().unwrap();
        assert_eq!((counts.present, counts.total), (1, 2));
    }

    #[test]
    fn test_participant_token_reuse_and_refresh() {
        let h = harness();
        let first = h.manager.generate_participant_token("a-1", &client());
        assert_eq!(first.context.reused, Some(false));
        assert_eq!(first.context.expires_at, Some(at(5)));

        h.clock.advance(Duration::minutes(4));
        let reused = h.manager.generate_participant_token("a-1", &client());
        assert_eq!(reused.context.reused, Some(true));
        assert_eq!(reused.context.token, first.context.token);

        h.clock.advance(Duration::minutes(2));
        let fresh = h.manager.generate_participant_token("a-1", &client());
        assert_eq!(fresh.context.reused, Some(false));
        assert_ne!(fresh.context.token, first.context.token);
    }

    #[test]
    fn test_participant_token_rejects_strangers_and_started_sessions() {
        let h = harness();
        let stranger = h.manager.generate_participant_token("a-1", &Identity::new("stranger"));
        assert_eq!(stranger.error_code, Some(ErrorCode::NotAssigned));

        h.manager.manual_start("a-1", &coach());
        let late = h.manager.generate_participant_token("a-1", &client());
        assert_eq!(late.error_code, Some(ErrorCode::SessionAlreadyStarted));
    }

    #[test]
    fn test_participant_scan_marks_present_and_auto_starts() {
        let h = harness();
        add_client(&h, "p-2", "client-2");
        let t1 = issue(&h, &client());
        let t2 = issue(&h, &Identity::new("client-2"));

        let first = h.manager.scan_participant_token(&t1, &coach());
        assert!(first.success);
        assert_eq!(first.context.attendance_order, Some(1));
        assert_eq!(first.context.auto_started, Some(false));
        assert_eq!(appt(&h).global_status, GlobalStatus::Pending);

        h.clock.advance(Duration::minutes(1));
        let last = h.manager.scan_participant_token(&t2, &coach());
        assert!(last.success);
        assert_eq!(last.context.attendance_order, Some(2));
        assert_eq!(last.context.auto_started, Some(true));
        assert_eq!(appt(&h).start_mode, Some(StartMode::AutoLastParticipant));

        let actions: Vec<_> = h
            .manager
            .history("a-1")
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                AttendanceAction::Present,
                AttendanceAction::Present,
                AttendanceAction::AutoStart
            ]
        );
    }

    #[test]
    fn test_rescanning_present_participant_is_informational() {
        let h = harness();
        add_client(&h, "p-2", "client-2");
        let token = issue(&h, &client());
        h.manager.scan_participant_token(&token, &coach());
        let counts_before = h.manager.counts("a-1").unwrap();

        let again = h.manager.scan_participant_token(&token, &coach());
        assert!(again.success);
        assert_eq!(again.error_code, Some(ErrorCode::AlreadyPresent));
        assert_eq!(again.context.attendance_order, Some(1));
        assert_eq!(h.manager.counts("a-1").unwrap(), counts_before);
        assert_eq!(h.manager.history("a-1").unwrap().len(), 1);
    }

    #[test]
    fn test_participant_token_expiry_boundary() {
        let h = harness();
        let token = issue(&h, &client());

        h.clock.advance(Duration::minutes(16));
        let expired = h.manager.scan_participant_token(&token, &coach());
        assert_eq!(expired.error_code, Some(ErrorCode::TokenExpired));

        h.clock.advance(Duration::minutes(-2));
        let accepted = h.manager.scan_participant_token(&token, &coach());
        assert!(accepted.success, "{accepted:?}");
    }

    #[test]
    fn test_participant_scan_rejections() {
        let h = harness();
        assert_eq!(
            h.manager.scan_participant_token("%%%", &coach()).error_code,
            Some(ErrorCode::TokenInvalid)
        );

        let forged = TokenCodec::unsigned().encode(&TokenPayload::new("a-2", "p-1", at(-10)));
        assert_eq!(
            h.manager.scan_participant_token(&forged, &coach()).error_code,
            Some(ErrorCode::TokenMismatch)
        );

        let coach_token = TokenCodec::unsigned().encode(&TokenPayload::new("a-1", "p-coach", at(-10)));
        assert_eq!(
            h.manager.scan_participant_token(&coach_token, &coach()).error_code,
            Some(ErrorCode::InvalidRole)
        );

        let token = issue(&h, &client());
        assert_eq!(
            h.manager
                .scan_participant_token(&token, &Identity::new("other-coach"))
                .error_code,
            Some(ErrorCode::NotAssigned)
        );
    }

    #[test]
    fn test_absent_participant_cannot_check_in() {
        let h = harness();
        let token = issue(&h, &client());
        assert!(h.manager.mark_absent("a-1", "p-1", &coach()).success);

        let scanned = h.manager.scan_participant_token(&token, &coach());
        assert_eq!(scanned.error_code, Some(ErrorCode::AlreadyAbsent));
        assert_eq!(
            h.manager.generate_participant_token("a-1", &client()).error_code,
            Some(ErrorCode::AlreadyAbsent)
        );
    }

    #[test]
    fn test_manual_start_ignores_counts() {
        let h = harness();
        add_client(&h, "p-2", "client-2");
        add_client(&h, "p-3", "client-3");
        let t1 = issue(&h, &client());
        let t2 = issue(&h, &Identity::new("client-2"));
        h.manager.scan_participant_token(&t1, &coach());
        h.manager.scan_participant_token(&t2, &coach());

        let result = h.manager.manual_start("a-1", &coach());
        assert!(result.success);
        assert_eq!(result.context.start_mode, Some(StartMode::Manual));
        assert_eq!(appt(&h).global_status, GlobalStatus::Started);

        let again = h.manager.manual_start("a-1", &coach());
        assert!(again.success && again.is_already());

        let last = h.manager.history("a-1").unwrap().pop().unwrap();
        assert_eq!(last.action, AttendanceAction::ManualStart);
        assert_eq!((last.present, last.total), (Some(2), Some(3)));
    }

    #[test]
    fn test_manual_start_requires_assignment() {
        let h = harness();
        let result = h.manager.manual_start("a-1", &Identity::new("intruder"));
        assert_eq!(result.error_code, Some(ErrorCode::NotAssigned));
        assert_eq!(appt(&h).global_status, GlobalStatus::Pending);
    }

    #[test]
    fn test_finalize_resolves_pending_and_is_idempotent() {
        let h = harness();
        add_client(&h, "p-2", "client-2");
        let token = issue(&h, &client());
        h.manager.scan_participant_token(&token, &coach());
        h.manager.manual_start("a-1", &coach());

        h.clock.advance(Duration::minutes(70));
        let done = h.manager.finalize_session("a-1", &coach());
        assert!(done.success);
        assert_eq!(
            done.context.summary,
            Some(AttendanceSummary { present: 1, absent: 1, total: 2 })
        );

        let a = appt(&h);
        assert_eq!(a.global_status, GlobalStatus::Completed);
        assert_eq!(a.session_ended_by.as_deref(), Some("coach-1"));
        assert!(a.finalize_due_at.is_none());
        let pending = h
            .manager
            .registry()
            .client_participants("a-1")
            .unwrap()
            .into_iter()
            .filter(|p| p.attendance_status == AttendanceStatus::Pending)
            .count();
        assert_eq!(pending, 0);

        let history = h.manager.history("a-1").unwrap();
        assert_eq!(history.last().unwrap().action, AttendanceAction::End);
        assert!(history.iter().any(|e| e.action == AttendanceAction::AutoAbsent));

        let again = h.manager.finalize_session("a-1", &coach());
        assert!(again.success && again.is_already());
        assert_eq!(h.manager.history("a-1").unwrap().len(), history.len());

        // Completed is terminal.
        assert_eq!(
            h.manager.manual_start("a-1", &coach()).error_code,
            Some(ErrorCode::SessionClosed)
        );
    }

    #[test]
    fn test_mark_absent_rules() {
        let h = harness();
        add_client(&h, "p-2", "client-2");
        let token = issue(&h, &client());
        h.manager.scan_participant_token(&token, &coach());

        let present = h.manager.mark_absent("a-1", "p-1", &coach());
        assert!(!present.success);
        assert_eq!(present.error_code, Some(ErrorCode::AlreadyPresent));

        let first = h.manager.mark_absent("a-1", "p-2", &coach());
        assert!(first.success && !first.is_already());
        let second = h.manager.mark_absent("a-1", "p-2", &coach());
        assert!(second.success && second.is_already());

        assert_eq!(
            h.manager.mark_absent("a-1", "p-coach", &coach()).error_code,
            Some(ErrorCode::InvalidRole)
        );
        assert_eq!(
            h.manager.mark_absent("a-1", "nope", &coach()).error_code,
            Some(ErrorCode::NotFound)
        );
    }

    #[test]
    fn test_active_session_and_due_queries() {
        let h = harness();
        assert!(h.manager.active_session_for_coach("coach-1").unwrap().is_none());
        h.manager.manual_start("a-1", &coach());

        let active = h.manager.active_session_for_coach("coach-1").unwrap().unwrap();
        assert_eq!(active.id, "a-1");
        assert!(h.manager.due_for_finalize().unwrap().is_empty());

        h.clock.advance(Duration::minutes(60));
        assert_eq!(h.manager.due_for_finalize().unwrap().len(), 1);

        let done = h.manager.finalize_as_system("a-1");
        assert!(done.success);
        assert_eq!(appt(&h).session_ended_by.as_deref(), Some(SYSTEM_ACTOR));
        assert!(h.manager.active_session_for_coach("coach-1").unwrap().is_none());
    }

    #[test]
    fn test_ledger_failure_does_not_abort_transition() {
        let store = Arc::new(FailingLedgerStore::default());
        store.inner.insert_appointment(appointment("a-1", start())).unwrap();
        let clock = ManualClock::new(at(-10));
        let manager = SessionLifecycleManager::new(store.clone(), Arc::new(clock), TokenCodec::unsigned());

        let result = manager.manual_start("a-1", &coach());
        assert!(result.success);
        assert_eq!(
            store.inner.get_appointment("a-1").unwrap().unwrap().global_status,
            GlobalStatus::Started
        );
    }

    #[test]
    fn test_result_serializes_flat_camel_case() {
        let result = LifecycleResult::fail(ErrorCode::WaitingForClients, "waiting")
            .with_appointment("a-1")
            .with_counts(AttendanceCounts {
                present: 1,
                absent: 0,
                total: 2,
                approximate: false,
            });
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["errorCode"], "waiting_for_clients");
        assert_eq!(json["appointmentId"], "a-1");
        assert_eq!(json["counts"]["total"], 2);
        assert!(json.get("token").is_none());
    }
}
