//! Participant lookup, booking and self-healing.
//!
//! Appointments carry two cached sets next to their participant records: the
//! coach-id set and the expected-client set. Records can go missing (a client
//! app crashed mid-booking, an invitee signed up after being invited by email),
//! so lookups here repair what they can instead of failing the check-in:
//!
//! - a client without a participant record gets one created on demand,
//! - an emailed invitee is linked to their user id on first contact,
//! - a coach matched only by email gets a coach participant record.
//!
//! Every repair is logged at `warn`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{ServerError, StoreResult};
use crate::identity::Identity;
use crate::store::{ParticipantFilter, RecordStore, UpdateOutcome};
use crate::types::{
    Appointment, AttendanceStatus, GlobalStatus, InvitationStatus, Participant, ParticipantRole,
};

/// Someone invited to an appointment at booking time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitee {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Invitee {
    /// Key used in the expected-client set: the user id when known,
    /// otherwise the lowercased email.
    fn expected_key(&self) -> Option<String> {
        self.user_id
            .clone()
            .or_else(|| self.email.as_ref().map(|e| e.to_ascii_lowercase()))
    }
}

/// Input to [`ParticipantRegistry::book_appointment`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    pub coach_id: String,
    #[serde(default)]
    pub coach_email: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: u32,
    #[serde(default)]
    pub invitees: Vec<Invitee>,
}

/// Result of answering an invitation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvitationOutcome {
    Updated(Participant),
    /// The invitation had already been answered; nothing changed.
    AlreadyResponded(Participant),
    NotFound,
    /// The caller is not the invitee.
    NotInvitee,
}

/// Finds, creates and repairs participant records.
#[derive(Clone)]
pub struct ParticipantRegistry {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ParticipantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipantRegistry").finish_non_exhaustive()
    }
}

fn new_participant(
    appointment_id: &str,
    role: ParticipantRole,
    user_id: Option<&str>,
    email: Option<&str>,
    display_name: Option<&str>,
    status: InvitationStatus,
    now: DateTime<Utc>,
) -> Participant {
    Participant {
        id: Uuid::new_v4().to_string(),
        appointment_id: appointment_id.to_string(),
        user_id: user_id.map(str::to_string),
        email: email.map(str::to_string),
        display_name: display_name.map(str::to_string),
        role,
        status,
        attendance_status: AttendanceStatus::Pending,
        attendance_order: None,
        attendance_marked_at: None,
        qr_token: None,
        qr_generated_at: None,
        created_at: now,
    }
}

/// The expected-client key a record answers to: its user id, else its
/// lowercased email.
fn expected_key_of(participant: &Participant) -> Option<String> {
    participant
        .user_id
        .clone()
        .or_else(|| participant.email.as_ref().map(|e| e.to_ascii_lowercase()))
}

fn is_creator(invitee: &Invitee, creator: &Identity) -> bool {
    match invitee.user_id.as_deref() {
        Some(user_id) => user_id == creator.user_id,
        None => creator.email_matches(invitee.email.as_deref()),
    }
}

impl ParticipantRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Creates an appointment with its coach, creator and invitee records.
    ///
    /// The expected-client set is always populated here so counts never have
    /// to fall back to the record-count approximation for new bookings.
    pub fn book_appointment(
        &self,
        request: BookingRequest,
        creator: &Identity,
    ) -> Result<Appointment, ServerError> {
        if request.coach_id.trim().is_empty() {
            return Err(ServerError::validation("coachId must not be empty"));
        }
        if request.duration_minutes == 0 {
            return Err(ServerError::validation("durationMinutes must be positive"));
        }
        if request
            .invitees
            .iter()
            .any(|i| i.user_id.is_none() && i.email.is_none())
        {
            return Err(ServerError::validation("every invitee needs a userId or email"));
        }

        let now = self.clock.now();
        let invitees: Vec<&Invitee> = request
            .invitees
            .iter()
            .filter(|i| !is_creator(i, creator))
            .collect();
        let mut client_ids = vec![creator.user_id.clone()];
        for key in invitees.iter().filter_map(|i| i.expected_key()) {
            if !client_ids.contains(&key) {
                client_ids.push(key);
            }
        }

        let appointment = Appointment {
            id: Uuid::new_v4().to_string(),
            created_by: creator.user_id.clone(),
            created_by_email: creator.email.clone(),
            client_name: request.client_name.clone(),
            coach_id: request.coach_id.clone(),
            coach_ids: vec![request.coach_id.clone()],
            coach_email: request.coach_email.clone(),
            scheduled_at: request.scheduled_at,
            duration_minutes: request.duration_minutes,
            global_status: GlobalStatus::Pending,
            start_mode: None,
            session_started_at: None,
            session_started_by: None,
            session_ended_at: None,
            session_ended_by: None,
            client_ids,
            qr_token: None,
            qr_generated_at: None,
            qr_status: None,
            attendance_summary: None,
            finalize_due_at: None,
            created_at: now,
        };
        self.store.insert_appointment(appointment.clone())?;

        self.store.insert_participant(new_participant(
            &appointment.id,
            ParticipantRole::Coach,
            Some(&request.coach_id),
            request.coach_email.as_deref(),
            None,
            InvitationStatus::Accepted,
            now,
        ))?;
        self.store.insert_participant(new_participant(
            &appointment.id,
            ParticipantRole::Client,
            Some(&creator.user_id),
            creator.email.as_deref(),
            request.client_name.as_deref(),
            InvitationStatus::Accepted,
            now,
        ))?;

        for invitee in invitees {
            self.store.insert_participant(new_participant(
                &appointment.id,
                ParticipantRole::Client,
                invitee.user_id.as_deref(),
                invitee.email.as_deref(),
                invitee.display_name.as_deref(),
                InvitationStatus::Pending,
                now,
            ))?;
        }

        info!(
            appointment_id = %appointment.id,
            coach_id = %appointment.coach_id,
            expected_clients = appointment.client_ids.len(),
            "Appointment booked"
        );
        Ok(appointment)
    }

    pub fn find_coach_participant(
        &self,
        appointment_id: &str,
        coach_id: &str,
    ) -> StoreResult<Option<Participant>> {
        let found = self.store.find_participants(
            &ParticipantFilter::for_appointment(appointment_id)
                .with_user(coach_id)
                .with_role(ParticipantRole::Coach),
        )?;
        Ok(found.into_iter().next())
    }

    /// Looks up a client participant by record id, scoped to one appointment.
    pub fn find_client_participant(
        &self,
        appointment_id: &str,
        participant_id: &str,
    ) -> StoreResult<Option<Participant>> {
        Ok(self
            .store
            .get_participant(participant_id)?
            .filter(|p| p.appointment_id == appointment_id && p.role == ParticipantRole::Client))
    }

    pub fn find_client_by_user(
        &self,
        appointment_id: &str,
        user_id: &str,
    ) -> StoreResult<Option<Participant>> {
        let found = self.store.find_participants(
            &ParticipantFilter::for_appointment(appointment_id)
                .with_user(user_id)
                .with_role(ParticipantRole::Client),
        )?;
        Ok(found.into_iter().next())
    }

    pub fn client_participants(&self, appointment_id: &str) -> StoreResult<Vec<Participant>> {
        self.store.find_participants(
            &ParticipantFilter::for_appointment(appointment_id).with_role(ParticipantRole::Client),
        )
    }

    /// Whether `user` belongs on this appointment's client list.
    ///
    /// Appointments without an expected-client set accept anyone.
    pub fn is_expected_client(&self, appointment: &Appointment, user: &Identity) -> StoreResult<bool> {
        if appointment.created_by == user.user_id || appointment.client_ids.is_empty() {
            return Ok(true);
        }
        let listed = appointment
            .client_ids
            .iter()
            .any(|key| key == &user.user_id || user.email_matches(Some(key)));
        if listed {
            return Ok(true);
        }
        let Some(email) = user.email.as_deref() else {
            return Ok(false);
        };
        Ok(self
            .client_participants(&appointment.id)?
            .iter()
            .any(|p| p.user_id.is_none() && p.has_email(email)))
    }

    /// Returns the caller's client participant, creating or linking one if
    /// needed. Creation and linking both add the caller to the
    /// expected-client set.
    pub fn ensure_client_participant(
        &self,
        appointment_id: &str,
        user_id: &str,
        email: Option<&str>,
    ) -> StoreResult<Participant> {
        if let Some(existing) = self.find_client_by_user(appointment_id, user_id)? {
            return Ok(existing);
        }

        if let Some(email) = email {
            if let Some(linked) = self.link_client_by_email(appointment_id, user_id, email)? {
                return Ok(linked);
            }
        }

        let candidate = new_participant(
            appointment_id,
            ParticipantRole::Client,
            Some(user_id),
            email,
            None,
            InvitationStatus::Accepted,
            self.clock.now(),
        );
        let candidate_id = candidate.id.clone();
        let stood = self.store.insert_participant_unless(candidate, &|p| {
            p.role == ParticipantRole::Client && p.user_id.as_deref() == Some(user_id)
        })?;

        if stood.id == candidate_id {
            warn!(
                appointment_id = %appointment_id,
                user_id = %user_id,
                participant_id = %stood.id,
                "Created missing client participant"
            );
            self.include_expected_client(appointment_id, user_id, None)?;
        }
        Ok(stood)
    }

    fn link_client_by_email(
        &self,
        appointment_id: &str,
        user_id: &str,
        email: &str,
    ) -> StoreResult<Option<Participant>> {
        let unlinked: Vec<Participant> = self
            .client_participants(appointment_id)?
            .into_iter()
            .filter(|p| p.user_id.is_none() && p.has_email(email))
            .collect();

        for candidate in unlinked {
            let outcome = self.store.update_participant(&candidate.id, &mut |p| {
                if p.user_id.is_some() {
                    return false;
                }
                p.user_id = Some(user_id.to_string());
                true
            })?;

            match outcome {
                UpdateOutcome::Applied(linked) => {
                    warn!(
                        appointment_id = %appointment_id,
                        user_id = %user_id,
                        participant_id = %linked.id,
                        "Linked invitee to user by email"
                    );
                    self.include_expected_client(appointment_id, user_id, Some(email))?;
                    return Ok(Some(linked));
                }
                UpdateOutcome::Skipped(p) if p.user_id.as_deref() == Some(user_id) => {
                    return Ok(Some(p));
                }
                UpdateOutcome::Skipped(_) | UpdateOutcome::Missing => {}
            }
        }
        Ok(None)
    }

    /// Adds `key` to the expected-client set, dropping `replacing` (an email
    /// key being upgraded to a user id).
    ///
    /// An empty set means "whoever holds a client record", so before the
    /// first key goes in, the set is seeded with every existing
    /// non-declined client record. Otherwise the newcomer would become the
    /// only expected client.
    fn include_expected_client(
        &self,
        appointment_id: &str,
        key: &str,
        replacing: Option<&str>,
    ) -> StoreResult<()> {
        let seed: Vec<String> = self
            .client_participants(appointment_id)?
            .iter()
            .filter(|p| p.status != InvitationStatus::Declined)
            .filter_map(expected_key_of)
            .collect();

        self.store.update_appointment(appointment_id, &mut |appt| {
            let before = appt.client_ids.clone();
            if appt.client_ids.is_empty() {
                for k in &seed {
                    if !appt.client_ids.contains(k) {
                        appt.client_ids.push(k.clone());
                    }
                }
            }
            if let Some(old) = replacing {
                appt.client_ids.retain(|k| !k.eq_ignore_ascii_case(old));
            }
            if !appt.client_ids.iter().any(|k| k == key) {
                appt.client_ids.push(key.to_string());
            }
            appt.client_ids != before
        })?;
        Ok(())
    }

    /// Drops a declined client from the expected-client set so the rest of
    /// the group can still reach "all present".
    fn exclude_expected_client(
        &self,
        appointment_id: &str,
        user_id: &str,
        email: Option<&str>,
    ) -> StoreResult<()> {
        self.store.update_appointment(appointment_id, &mut |appt| {
            let before = appt.client_ids.len();
            appt.client_ids.retain(|k| {
                k != user_id && !email.is_some_and(|e| k.eq_ignore_ascii_case(e))
            });
            appt.client_ids.len() != before
        })?;
        Ok(())
    }

    /// Whether `coach` may run this appointment.
    ///
    /// Checked in order: a coach participant record for the user id, the
    /// appointment's coach id or coach-id set, then the coach's email. An
    /// email-only match repairs the missing coach participant and coach-id
    /// entry before returning `true`.
    pub fn is_coach_assigned(&self, appointment: &Appointment, coach: &Identity) -> StoreResult<bool> {
        if self
            .find_coach_participant(&appointment.id, &coach.user_id)?
            .is_some()
        {
            return Ok(true);
        }
        if appointment.lists_coach(&coach.user_id) {
            return Ok(true);
        }

        let Some(email) = coach.email.as_deref() else {
            return Ok(false);
        };
        let coach_records = self.store.find_participants(
            &ParticipantFilter::for_appointment(&appointment.id).with_role(ParticipantRole::Coach),
        )?;
        let matched_by_email = coach.email_matches(appointment.coach_email.as_deref())
            || coach_records
                .iter()
                .any(|p| p.user_id.is_none() && p.has_email(email));
        if !matched_by_email {
            return Ok(false);
        }

        warn!(
            appointment_id = %appointment.id,
            coach_id = %coach.user_id,
            "Coach matched by email only; repairing coach records"
        );
        self.ensure_coach_participant(&appointment.id, coach)?;
        Ok(true)
    }

    /// Returns the coach participant for `coach`, linking an email-only
    /// record or creating one, and adds the coach to the coach-id set.
    pub fn ensure_coach_participant(
        &self,
        appointment_id: &str,
        coach: &Identity,
    ) -> StoreResult<Participant> {
        let user_id = coach.user_id.as_str();
        let mut record = self.find_coach_participant(appointment_id, user_id)?;

        if record.is_none() {
            if let Some(email) = coach.email.as_deref() {
                let unlinked = self
                    .store
                    .find_participants(
                        &ParticipantFilter::for_appointment(appointment_id)
                            .with_role(ParticipantRole::Coach),
                    )?
                    .into_iter()
                    .find(|p| p.user_id.is_none() && p.has_email(email));
                if let Some(unlinked) = unlinked {
                    let outcome = self.store.update_participant(&unlinked.id, &mut |p| {
                        if p.user_id.is_some() {
                            return false;
                        }
                        p.user_id = Some(user_id.to_string());
                        true
                    })?;
                    record = outcome
                        .into_document()
                        .filter(|p| p.user_id.as_deref() == Some(user_id));
                }
            }
        }

        let record = match record {
            Some(record) => record,
            None => self.store.insert_participant_unless(
                new_participant(
                    appointment_id,
                    ParticipantRole::Coach,
                    Some(user_id),
                    coach.email.as_deref(),
                    None,
                    InvitationStatus::Accepted,
                    self.clock.now(),
                ),
                &|p| p.role == ParticipantRole::Coach && p.user_id.as_deref() == Some(user_id),
            )?,
        };

        self.store.update_appointment(appointment_id, &mut |appt| {
            if appt.coach_ids.iter().any(|id| id == user_id) {
                return false;
            }
            appt.coach_ids.push(user_id.to_string());
            true
        })?;
        Ok(record)
    }

    /// Accepts or declines a pending invitation. Answering also links an
    /// email-only invitee to the responder's user id.
    pub fn respond_to_invitation(
        &self,
        participant_id: &str,
        responder: &Identity,
        accept: bool,
    ) -> StoreResult<InvitationOutcome> {
        let Some(participant) = self.store.get_participant(participant_id)? else {
            return Ok(InvitationOutcome::NotFound);
        };

        let owns_record = match participant.user_id.as_deref() {
            Some(user_id) => user_id == responder.user_id,
            None => responder.email_matches(participant.email.as_deref()),
        };
        if !owns_record {
            return Ok(InvitationOutcome::NotInvitee);
        }

        let target = if accept {
            InvitationStatus::Accepted
        } else {
            InvitationStatus::Declined
        };
        let was_unlinked = participant.user_id.is_none();
        let outcome = self.store.update_participant(participant_id, &mut |p| {
            if p.status != InvitationStatus::Pending {
                return false;
            }
            p.status = target;
            if p.user_id.is_none() {
                p.user_id = Some(responder.user_id.clone());
            }
            true
        })?;

        Ok(match outcome {
            UpdateOutcome::Applied(updated) => {
                if updated.role == ParticipantRole::Client {
                    if target == InvitationStatus::Declined {
                        self.exclude_expected_client(
                            &updated.appointment_id,
                            &responder.user_id,
                            updated.email.as_deref(),
                        )?;
                    } else if was_unlinked {
                        self.include_expected_client(
                            &updated.appointment_id,
                            &responder.user_id,
                            updated.email.as_deref(),
                        )?;
                    }
                }
                info!(
                    participant_id = %updated.id,
                    appointment_id = %updated.appointment_id,
                    status = ?updated.status,
                    "Invitation answered"
                );
                InvitationOutcome::Updated(updated)
            }
            UpdateOutcome::Skipped(current) => InvitationOutcome::AlreadyResponded(current),
            UpdateOutcome::Missing => InvitationOutcome::NotFound,
        })
    }
}
