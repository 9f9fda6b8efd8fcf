//! Live attendance feed.
//!
//! Every ledger entry is published on a tokio broadcast channel so dashboards
//! can follow check-ins as they happen instead of polling. Subscribers narrow
//! the feed with a [`SubscriberFilter`].
//!
//! The feed is a convenience: a subscriber that lags or connects late must
//! re-read [`crate::ledger::AttendanceLedger::history`] for the full record.
//!
//! # Example
//!
//! ```rust
//! use rollcall_server::broadcast::{EventBroadcaster, SubscriberFilter};
//! use rollcall_server::types::AttendanceAction;
//!
//! let broadcaster = EventBroadcaster::new();
//! let _rx = broadcaster.subscribe();
//!
//! let filter = SubscriberFilter::new()
//!     .with_appointment("appt-1")
//!     .with_action(AttendanceAction::Present);
//! assert!(!filter.is_empty());
//! ```

use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::{debug, trace};

use crate::types::{AttendanceAction, AttendanceEvent};

/// Default channel capacity.
///
/// Subscribers that fall further behind than this receive
/// `RecvError::Lagged` and miss the oldest events.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Distribution hub for ledger events.
///
/// Cheap to clone; clones share the underlying channel.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: Sender<AttendanceEvent>,
}

impl EventBroadcaster {
    /// Creates a broadcaster with [`DEFAULT_CHANNEL_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a broadcaster with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        debug!(capacity, "Created event broadcaster");
        Self { sender }
    }

    /// Subscribes to events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<AttendanceEvent> {
        let rx = self.sender.subscribe();
        debug!(
            subscriber_count = self.subscriber_count(),
            "New subscriber added"
        );
        rx
    }

    /// Publishes an event, returning how many subscribers received it.
    ///
    /// Having no subscribers is normal and returns 0.
    pub fn broadcast(&self, event: AttendanceEvent) -> usize {
        trace!(
            event_id = %event.id,
            appointment_id = %event.appointment_id,
            action = ?event.action,
            "Broadcasting attendance event"
        );

        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!("No active subscribers for attendance event");
                0
            }
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Filter criteria for a feed subscriber. Unset fields match everything;
/// set fields are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberFilter {
    pub appointment_id: Option<String>,
    pub action: Option<AttendanceAction>,
}

impl SubscriberFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_appointment(mut self, appointment_id: impl Into<String>) -> Self {
        self.appointment_id = Some(appointment_id.into());
        self
    }

    #[must_use]
    pub fn with_action(mut self, action: AttendanceAction) -> Self {
        self.action = Some(action);
        self
    }

    #[must_use]
    pub fn matches(&self, event: &AttendanceEvent) -> bool {
        if let Some(ref appointment_id) = self.appointment_id {
            if &event.appointment_id != appointment_id {
                return false;
            }
        }

        if let Some(action) = self.action {
            if event.action != action {
                return false;
            }
        }

        true
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.appointment_id.is_none() && self.action.is_none()
    }
}
