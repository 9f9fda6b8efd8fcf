//! Record store abstraction and the in-memory implementation.
//!
//! The lifecycle engine needs very little from its store: documents of two
//! kinds (appointments and participants), equality and array-membership
//! queries over them, an appointment-scoped append-only ledger, and an atomic
//! single-document update. That last primitive is the only coordination
//! between devices: every state change is a guarded closure the store applies
//! while holding the document exclusively, so a guard that re-checks the
//! current status can never be raced.
//!
//! # Thread Safety
//!
//! [`InMemoryStore`] keeps each collection behind its own [`RwLock`]; updates
//! take the write lock for the duration of the closure.
//!
//! # Example
//!
//! ```rust,ignore
//! use rollcall_server::store::{InMemoryStore, RecordStore, UpdateOutcome};
//! use rollcall_server::types::GlobalStatus;
//!
//! let store = InMemoryStore::new();
//! // ... insert an appointment ...
//! let outcome = store.update_appointment("appt-1", &mut |appt| {
//!     if appt.global_status != GlobalStatus::Pending {
//!         return false;
//!     }
//!     appt.global_status = GlobalStatus::Started;
//!     true
//! })?;
//! assert!(outcome.is_applied());
//! ```

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::types::{
    Appointment, AttendanceEvent, GlobalStatus, NewAttendanceEvent, Participant, ParticipantRole,
};

/// Result of an atomic single-document update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome<T> {
    /// The guard accepted and the new document was written.
    Applied(T),
    /// The guard declined; the current document is returned unchanged.
    Skipped(T),
    /// No document with that id exists.
    Missing,
}

impl<T> UpdateOutcome<T> {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// The document after the call, whether or not it changed.
    #[must_use]
    pub fn into_document(self) -> Option<T> {
        match self {
            Self::Applied(doc) | Self::Skipped(doc) => Some(doc),
            Self::Missing => None,
        }
    }
}

/// Equality / array-membership filter over appointments. Unset fields match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentFilter {
    pub global_status: Option<GlobalStatus>,
    pub session_started_by: Option<String>,
    /// `coachIds array-contains value`.
    pub coach_ids_contains: Option<String>,
    /// `finalizeDueAt <= value`.
    pub finalize_due_by: Option<DateTime<Utc>>,
}

impl AppointmentFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_status(mut self, status: GlobalStatus) -> Self {
        self.global_status = Some(status);
        self
    }

    #[must_use]
    pub fn with_started_by(mut self, user_id: impl Into<String>) -> Self {
        self.session_started_by = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_coach(mut self, user_id: impl Into<String>) -> Self {
        self.coach_ids_contains = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_finalize_due_by(mut self, instant: DateTime<Utc>) -> Self {
        self.finalize_due_by = Some(instant);
        self
    }

    #[must_use]
    pub fn matches(&self, appointment: &Appointment) -> bool {
        if let Some(status) = self.global_status {
            if appointment.global_status != status {
                return false;
            }
        }

        if let Some(ref started_by) = self.session_started_by {
            if appointment.session_started_by.as_ref() != Some(started_by) {
                return false;
            }
        }

        if let Some(ref coach) = self.coach_ids_contains {
            if !appointment.coach_ids.contains(coach) {
                return false;
            }
        }

        if let Some(due_by) = self.finalize_due_by {
            match appointment.finalize_due_at {
                Some(due) if due <= due_by => {}
                _ => return false,
            }
        }

        true
    }
}

/// Equality filter over participants. Unset fields match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantFilter {
    pub appointment_id: Option<String>,
    pub user_id: Option<String>,
    pub role: Option<ParticipantRole>,
}

impl ParticipantFilter {
    /// All participants of one appointment.
    #[must_use]
    pub fn for_appointment(appointment_id: impl Into<String>) -> Self {
        Self {
            appointment_id: Some(appointment_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: ParticipantRole) -> Self {
        self.role = Some(role);
        self
    }

    #[must_use]
    pub fn matches(&self, participant: &Participant) -> bool {
        if let Some(ref appointment_id) = self.appointment_id {
            if &participant.appointment_id != appointment_id {
                return false;
            }
        }

        if let Some(ref user_id) = self.user_id {
            if participant.user_id.as_ref() != Some(user_id) {
                return false;
            }
        }

        if let Some(role) = self.role {
            if participant.role != role {
                return false;
            }
        }

        true
    }
}

/// Guarded mutation applied atomically to one document. Returning `false`
/// leaves the document untouched.
pub type Mutation<'a, T> = &'a mut dyn FnMut(&mut T) -> bool;

/// The record store the lifecycle engine runs against.
pub trait RecordStore: Send + Sync {
    fn insert_appointment(&self, appointment: Appointment) -> StoreResult<()>;

    fn get_appointment(&self, id: &str) -> StoreResult<Option<Appointment>>;

    fn update_appointment(
        &self,
        id: &str,
        mutate: Mutation<'_, Appointment>,
    ) -> StoreResult<UpdateOutcome<Appointment>>;

    fn find_appointments(&self, filter: &AppointmentFilter) -> StoreResult<Vec<Appointment>>;

    fn insert_participant(&self, participant: Participant) -> StoreResult<()>;

    /// Inserts `candidate` unless a participant of the same appointment
    /// already satisfies `existing`; returns whichever record now stands.
    /// The check and the insert happen under one lock.
    fn insert_participant_unless(
        &self,
        candidate: Participant,
        existing: &dyn Fn(&Participant) -> bool,
    ) -> StoreResult<Participant>;

    fn get_participant(&self, id: &str) -> StoreResult<Option<Participant>>;

    fn update_participant(
        &self,
        id: &str,
        mutate: Mutation<'_, Participant>,
    ) -> StoreResult<UpdateOutcome<Participant>>;

    fn find_participants(&self, filter: &ParticipantFilter) -> StoreResult<Vec<Participant>>;

    /// Appends to the appointment's ledger, assigning id, timestamp and sequence.
    fn append_event(
        &self,
        appointment_id: &str,
        event: NewAttendanceEvent,
        at: DateTime<Utc>,
    ) -> StoreResult<AttendanceEvent>;

    /// Ledger entries for one appointment in insertion order.
    fn events_for_appointment(&self, appointment_id: &str) -> StoreResult<Vec<AttendanceEvent>>;
}

#[derive(Debug, Default)]
struct Ledger {
    next_seq: u64,
    events: HashMap<String, Vec<AttendanceEvent>>,
}

/// Thread-safe in-memory record store.
#[derive(Default)]
pub struct InMemoryStore {
    appointments: RwLock<HashMap<String, Appointment>>,
    participants: RwLock<HashMap<String, Participant>>,
    ledger: RwLock<Ledger>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        debug!("Creating in-memory record store");
        Self::default()
    }

    /// Number of stored appointments.
    pub fn appointment_count(&self) -> usize {
        self.appointments.read().map(|a| a.len()).unwrap_or(0)
    }

    /// Number of stored participants.
    pub fn participant_count(&self) -> usize {
        self.participants.read().map(|p| p.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("appointment_count", &self.appointment_count())
            .field("participant_count", &self.participant_count())
            .finish()
    }
}

fn apply<T: Clone>(doc: Option<&mut T>, mutate: Mutation<'_, T>) -> UpdateOutcome<T> {
    let Some(doc) = doc else {
        return UpdateOutcome::Missing;
    };

    // Mutate a scratch copy so a declining guard cannot leave partial edits.
    let mut draft = doc.clone();
    if mutate(&mut draft) {
        *doc = draft;
        UpdateOutcome::Applied(doc.clone())
    } else {
        UpdateOutcome::Skipped(doc.clone())
    }
}

impl RecordStore for InMemoryStore {
    fn insert_appointment(&self, appointment: Appointment) -> StoreResult<()> {
        let mut appointments = self.appointments.write().map_err(|_| StoreError::Poisoned)?;
        if appointments.contains_key(&appointment.id) {
            return Err(StoreError::conflict("appointment", appointment.id));
        }
        trace!(appointment_id = %appointment.id, "Inserting appointment");
        appointments.insert(appointment.id.clone(), appointment);
        Ok(())
    }

    fn get_appointment(&self, id: &str) -> StoreResult<Option<Appointment>> {
        let appointments = self.appointments.read().map_err(|_| StoreError::Poisoned)?;
        Ok(appointments.get(id).cloned())
    }

    fn update_appointment(
        &self,
        id: &str,
        mutate: Mutation<'_, Appointment>,
    ) -> StoreResult<UpdateOutcome<Appointment>> {
        let mut appointments = self.appointments.write().map_err(|_| StoreError::Poisoned)?;
        let outcome = apply(appointments.get_mut(id), mutate);
        trace!(appointment_id = %id, applied = outcome.is_applied(), "Appointment update");
        Ok(outcome)
    }

    fn find_appointments(&self, filter: &AppointmentFilter) -> StoreResult<Vec<Appointment>> {
        let appointments = self.appointments.read().map_err(|_| StoreError::Poisoned)?;
        let mut found: Vec<Appointment> = appointments
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    fn insert_participant(&self, participant: Participant) -> StoreResult<()> {
        let mut participants = self.participants.write().map_err(|_| StoreError::Poisoned)?;
        if participants.contains_key(&participant.id) {
            return Err(StoreError::conflict("participant", participant.id));
        }
        trace!(
            participant_id = %participant.id,
            appointment_id = %participant.appointment_id,
            "Inserting participant"
        );
        participants.insert(participant.id.clone(), participant);
        Ok(())
    }

    fn insert_participant_unless(
        &self,
        candidate: Participant,
        existing: &dyn Fn(&Participant) -> bool,
    ) -> StoreResult<Participant> {
        let mut participants = self.participants.write().map_err(|_| StoreError::Poisoned)?;

        let mut matching: Vec<&Participant> = participants
            .values()
            .filter(|p| p.appointment_id == candidate.appointment_id && existing(p))
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(found) = matching.first() {
            return Ok((*found).clone());
        }

        if participants.contains_key(&candidate.id) {
            return Err(StoreError::conflict("participant", candidate.id));
        }
        participants.insert(candidate.id.clone(), candidate.clone());
        Ok(candidate)
    }

    fn get_participant(&self, id: &str) -> StoreResult<Option<Participant>> {
        let participants = self.participants.read().map_err(|_| StoreError::Poisoned)?;
        Ok(participants.get(id).cloned())
    }

    fn update_participant(
        &self,
        id: &str,
        mutate: Mutation<'_, Participant>,
    ) -> StoreResult<UpdateOutcome<Participant>> {
        let mut participants = self.participants.write().map_err(|_| StoreError::Poisoned)?;
        let outcome = apply(participants.get_mut(id), mutate);
        trace!(participant_id = %id, applied = outcome.is_applied(), "Participant update");
        Ok(outcome)
    }

    fn find_participants(&self, filter: &ParticipantFilter) -> StoreResult<Vec<Participant>> {
        let participants = self.participants.read().map_err(|_| StoreError::Poisoned)?;
        let mut found: Vec<Participant> = participants
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    fn append_event(
        &self,
        appointment_id: &str,
        event: NewAttendanceEvent,
        at: DateTime<Utc>,
    ) -> StoreResult<AttendanceEvent> {
        let mut ledger = self.ledger.write().map_err(|_| StoreError::Poisoned)?;
        ledger.next_seq += 1;
        let stored = AttendanceEvent {
            id: Uuid::new_v4().to_string(),
            appointment_id: appointment_id.to_string(),
            action: event.action,
            participant_id: event.participant_id,
            user_id: event.user_id,
            coach_id: event.coach_id,
            start_mode: event.start_mode,
            order: event.order,
            present: event.present,
            absent: event.absent,
            total: event.total,
            created_at: at,
            seq: ledger.next_seq,
        };
        ledger
            .events
            .entry(appointment_id.to_string())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    fn events_for_appointment(&self, appointment_id: &str) -> StoreResult<Vec<AttendanceEvent>> {
        let ledger = self.ledger.read().map_err(|_| StoreError::Poisoned)?;
        Ok(ledger
            .events
            .get(appointment_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Record builders shared by the unit tests of several modules.

    use chrono::{DateTime, Utc};

    use crate::types::{
        Appointment, AttendanceStatus, GlobalStatus, InvitationStatus, Participant,
        ParticipantRole,
    };

    pub fn appointment(id: &str, scheduled_at: DateTime<Utc>) -> Appointment {
        Appointment {
            id: id.to_string(),
            created_by: "client-1".to_string(),
            created_by_email: Some("client1@example.com".to_string()),
            client_name: Some("Client One".to_string()),
            coach_id: "coach-1".to_string(),
            coach_ids: vec!["coach-1".to_string()],
            coach_email: Some("coach@example.com".to_string()),
            scheduled_at,
            duration_minutes: 60,
            global_status: GlobalStatus::Pending,
            start_mode: None,
            session_started_at: None,
            session_started_by: None,
            session_ended_at: None,
            session_ended_by: None,
            client_ids: vec!["client-1".to_string()],
            qr_token: None,
            qr_generated_at: None,
            qr_status: None,
            attendance_summary: None,
            finalize_due_at: None,
            created_at: scheduled_at - chrono::Duration::days(1),
        }
    }

    pub fn participant(
        id: &str,
        appointment_id: &str,
        user_id: Option<&str>,
        role: ParticipantRole,
        created_at: DateTime<Utc>,
    ) -> Participant {
        Participant {
            id: id.to_string(),
            appointment_id: appointment_id.to_string(),
            user_id: user_id.map(str::to_string),
            email: None,
            display_name: None,
            role,
            status: InvitationStatus::Accepted,
            attendance_status: AttendanceStatus::Pending,
            attendance_order: None,
            attendance_marked_at: None,
            qr_token: None,
            qr_generated_at: None,
            created_at,
        }
    }
}
