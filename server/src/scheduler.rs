//! Periodic auto-finalize sweep.
//!
//! Starting a session persists `finalizeDueAt` on the appointment. The sweep
//! finalizes every started session whose due time has passed, so a restart
//! loses nothing: the next tick picks up whatever came due meanwhile.
//! Finalizing an already completed session is a no-op, so overlapping sweeps
//! on several instances are harmless.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::StoreResult;
use crate::lifecycle::SessionLifecycleManager;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub due: usize,
    pub finalized: usize,
    pub failed: usize,
}

/// Finalizes sessions whose scheduled end has passed.
#[derive(Debug, Clone)]
pub struct FinalizeSweeper {
    manager: Arc<SessionLifecycleManager>,
}

impl FinalizeSweeper {
    #[must_use]
    pub fn new(manager: Arc<SessionLifecycleManager>) -> Self {
        Self { manager }
    }

    /// Runs one sweep against the manager's clock.
    pub fn sweep_due(&self) -> StoreResult<SweepReport> {
        let due = self.manager.due_for_finalize()?;
        let mut report = SweepReport {
            due: due.len(),
            ..SweepReport::default()
        };

        for appointment in due {
            let result = self.manager.finalize_as_system(&appointment.id);
            if !result.success {
                warn!(
                    appointment_id = %appointment.id,
                    error_code = ?result.error_code,
                    "Auto-finalize failed"
                );
                report.failed += 1;
            } else if !result.is_already() {
                report.finalized += 1;
            }
        }

        Ok(report)
    }

    /// Spawns the sweep on a tokio interval.
    ///
    /// The first tick fires immediately, picking up sessions that came due
    /// while the server was down.
    pub fn spawn(self, every: Duration) -> tokio::task::JoinHandle<()> {
        info!(interval_secs = every.as_secs(), "Starting auto-finalize sweep");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                interval.tick().await;
                match self.sweep_due() {
                    Ok(report) if report.due > 0 => {
                        info!(
                            due = report.due,
                            finalized = report.finalized,
                            failed = report.failed,
                            "Auto-finalize sweep completed"
                        );
                    }
                    Ok(_) => debug!("Auto-finalize sweep found nothing due"),
                    Err(err) => error!(error = %err, "Auto-finalize sweep failed"),
                }
            }
        })
    }
}
