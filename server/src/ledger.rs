//! Append-only attendance ledger.
//!
//! Every attendance-affecting action leaves an [`AttendanceEvent`] behind.
//! Appends are fire-and-forget from the caller's side: by the time an entry is
//! written the state change it documents has already committed, so a failed
//! append is logged and swallowed rather than propagated.

use std::sync::Arc;

use tracing::{error, trace};

use crate::broadcast::EventBroadcaster;
use crate::clock::Clock;
use crate::error::StoreResult;
use crate::store::RecordStore;
use crate::types::{AttendanceEvent, NewAttendanceEvent};

/// Writer and reader for per-appointment ledger entries.
#[derive(Clone)]
pub struct AttendanceLedger {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    broadcaster: Option<EventBroadcaster>,
}

impl AttendanceLedger {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            broadcaster: None,
        }
    }

    /// Publishes every appended entry on `broadcaster` as well.
    #[must_use]
    pub fn with_broadcaster(mut self, broadcaster: EventBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Appends an entry. Failures are logged, never returned.
    pub fn append(&self, appointment_id: &str, event: NewAttendanceEvent) -> Option<AttendanceEvent> {
        let action = event.action;
        match self.store.append_event(appointment_id, event, self.clock.now()) {
            Ok(stored) => {
                trace!(
                    appointment_id = %appointment_id,
                    action = ?action,
                    seq = stored.seq,
                    "Ledger entry appended"
                );
                if let Some(ref broadcaster) = self.broadcaster {
                    broadcaster.broadcast(stored.clone());
                }
                Some(stored)
            }
            Err(err) => {
                error!(
                    appointment_id = %appointment_id,
                    action = ?action,
                    error = %err,
                    "Failed to append ledger entry"
                );
                None
            }
        }
    }

    /// Entries for an appointment, oldest first. Ties on timestamp fall back
    /// to the store-assigned sequence.
    pub fn history(&self, appointment_id: &str) -> StoreResult<Vec<AttendanceEvent>> {
        let mut events = self.store.events_for_appointment(appointment_id)?;
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));
        Ok(events)
    }
}

impl std::fmt::Debug for AttendanceLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttendanceLedger")
            .field("broadcasting", &self.broadcaster.is_some())
            .finish()
    }
}
