//! Attendance counts.
//!
//! Counts are derived from the current records on every call. The total
//! prefers the appointment's expected-client set; appointments that predate
//! it fall back to counting client records and flag the result as
//! approximate, since a client who never opened the app has no record yet.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::store::{ParticipantFilter, RecordStore};
use crate::types::{
    Appointment, AttendanceStatus, AttendanceSummary, InvitationStatus, Participant, ParticipantRole,
};

/// Present / absent / total for one appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceCounts {
    pub present: u32,
    pub absent: u32,
    pub total: u32,
    /// `true` when `total` came from counting records rather than the
    /// expected-client set.
    pub approximate: bool,
}

impl AttendanceCounts {
    /// Derives counts from an appointment and its client records. Declined
    /// invitees are left out entirely.
    #[must_use]
    pub fn compute(appointment: &Appointment, clients: &[Participant]) -> Self {
        let clients = clients.iter().filter(|p| {
            p.role == ParticipantRole::Client && p.status != InvitationStatus::Declined
        });
        let (mut present, mut absent, mut records) = (0u32, 0u32, 0u32);
        for participant in clients {
            records += 1;
            match participant.attendance_status {
                AttendanceStatus::Present => present += 1,
                AttendanceStatus::Absent => absent += 1,
                AttendanceStatus::Pending => {}
            }
        }

        let expected = u32::try_from(appointment.client_ids.len()).unwrap_or(u32::MAX);
        let (total, approximate) = if expected > 0 {
            (expected, false)
        } else {
            (records, true)
        };

        Self {
            present,
            absent,
            total,
            approximate,
        }
    }

    /// Every expected client is present, and there is at least one.
    #[must_use]
    pub fn all_present(&self) -> bool {
        self.total > 0 && self.present == self.total
    }

    /// Expected clients not yet resolved either way.
    #[must_use]
    pub fn pending(&self) -> u32 {
        self.total.saturating_sub(self.present + self.absent)
    }

    #[must_use]
    pub fn summary(&self) -> AttendanceSummary {
        AttendanceSummary {
            present: self.present,
            absent: self.absent,
            total: self.total,
        }
    }
}

/// Reads counts from the record store.
#[derive(Clone)]
pub struct AttendanceAggregator {
    store: Arc<dyn RecordStore>,
}

impl AttendanceAggregator {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Current counts, or `None` if the appointment does not exist.
    pub fn counts(&self, appointment_id: &str) -> StoreResult<Option<AttendanceCounts>> {
        let Some(appointment) = self.store.get_appointment(appointment_id)? else {
            return Ok(None);
        };
        let clients = self.store.find_participants(
            &ParticipantFilter::for_appointment(appointment_id).with_role(ParticipantRole::Client),
        )?;
        Ok(Some(AttendanceCounts::compute(&appointment, &clients)))
    }
}
