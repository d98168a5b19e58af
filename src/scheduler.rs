//! Local scheduler boundary — the OS capability that delivers a payload
//! at a future instant.
//!
//! The engine never assumes an indexed cancel-by-tag primitive: callers
//! that need to clear a whole dose event sweep `list_pending()` and
//! cancel matching identifiers one by one. Registration is keyed by a
//! stable identifier, and re-registering an identifier replaces the
//! prior entry — the sequencer relies on this instead of treating it as
//! an error.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════
// Payload — closed set of notification type tags
// ═══════════════════════════════════════════════════════════

/// Payload carried by every local-notification registration.
///
/// The `type` discriminator is the dispatch key for notification
/// response handling; every variant carries enough identity to
/// reconstruct its escalation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NotificationPayload {
    /// One reminder step of the escalation sequence.
    MedicationAlarm {
        patient_id: Uuid,
        schedule_id: Uuid,
        medication_name: String,
        scheduled_at: DateTime<Utc>,
        attempt: u8,
    },
    /// Fires after the final reminder; its handler decides whether the
    /// caregiver alert pipeline must run.
    CaregiverCheck {
        patient_id: Uuid,
        schedule_id: Uuid,
        medication_name: String,
        scheduled_at: DateTime<Utc>,
    },
    /// Generic "reminder delivered but unacknowledged" check, the
    /// second, independent escalation entry point.
    EscalationCheck {
        patient_id: Uuid,
        schedule_id: Uuid,
        medication_name: String,
        schedule_time: String,
    },
    /// Immediate local surfacing of a stored fallback alert on the
    /// caregiver's device.
    CaregiverAlertLocal {
        alert_id: Uuid,
        patient_id: Uuid,
        caregiver_id: Uuid,
        message: String,
    },
}

impl NotificationPayload {
    /// The medication-schedule id this payload belongs to, if any.
    /// Cancellation sweeps match on this.
    pub fn schedule_id(&self) -> Option<Uuid> {
        match self {
            Self::MedicationAlarm { schedule_id, .. }
            | Self::CaregiverCheck { schedule_id, .. }
            | Self::EscalationCheck { schedule_id, .. } => Some(*schedule_id),
            Self::CaregiverAlertLocal { .. } => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Urgency — priority and vibration step with the attempt
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Default,
    Elevated,
    Maximum,
}

impl Urgency {
    /// Urgency for a reminder attempt ordinal (1..=3).
    pub fn for_attempt(attempt: u8) -> Self {
        match attempt {
            0 | 1 => Self::Default,
            2 => Self::Elevated,
            _ => Self::Maximum,
        }
    }

    pub fn priority(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Elevated => "high",
            Self::Maximum => "max",
        }
    }

    /// Vibration pattern in milliseconds, longer and denser per step.
    pub fn vibration_pattern(&self) -> &'static [u32] {
        match self {
            Self::Default => &[0, 250, 250, 250],
            Self::Elevated => &[0, 500, 250, 500],
            Self::Maximum => &[0, 1000, 500, 1000, 500, 1000],
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Scheduler trait
// ═══════════════════════════════════════════════════════════

/// One registration request for a future local delivery.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    /// Stable identifier; re-registering it replaces the prior entry.
    pub id: String,
    pub title: String,
    pub body: String,
    /// Relative offset from now. The scheduling primitive is most
    /// reliable with relative offsets, so absolute instants are
    /// converted before they reach here.
    pub offset: Duration,
    pub urgency: Urgency,
    pub payload: NotificationPayload,
}

/// A registration currently pending delivery.
#[derive(Debug, Clone)]
pub struct PendingNotification {
    pub id: String,
    pub title: String,
    pub body: String,
    pub offset: Duration,
    pub urgency: Urgency,
    pub payload: NotificationPayload,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduling registration failed: {0}")]
    Registration(String),
}

/// OS-level local scheduling capability: register a future-timed
/// delivery, list pending ones, cancel by identifier. Fire timing is
/// best effort; nothing here may rely on delivery promptness.
pub trait LocalScheduler: Send + Sync {
    fn schedule(&self, request: ScheduleRequest) -> Result<(), SchedulerError>;
    fn list_pending(&self) -> Result<Vec<PendingNotification>, SchedulerError>;
    fn cancel(&self, id: &str) -> Result<(), SchedulerError>;
}

// ═══════════════════════════════════════════════════════════
// In-memory implementation
// ═══════════════════════════════════════════════════════════

/// Identifier-keyed in-memory scheduler. Used by tests and by headless
/// hosts that bridge deliveries to their own notification layer.
#[derive(Default)]
pub struct InMemoryScheduler {
    pending: Mutex<HashMap<String, PendingNotification>>,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    // Poisoning is recovered, never propagated: a panicked holder must
    // not wedge scheduling for every later caller.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, PendingNotification>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove and return one pending entry, simulating its delivery.
    pub fn take(&self, id: &str) -> Option<PendingNotification> {
        self.entries().remove(id)
    }
}

impl LocalScheduler for InMemoryScheduler {
    fn schedule(&self, request: ScheduleRequest) -> Result<(), SchedulerError> {
        let entry = PendingNotification {
            id: request.id.clone(),
            title: request.title,
            body: request.body,
            offset: request.offset,
            urgency: request.urgency,
            payload: request.payload,
        };
        self.entries().insert(request.id, entry);
        Ok(())
    }

    fn list_pending(&self) -> Result<Vec<PendingNotification>, SchedulerError> {
        Ok(self.entries().values().cloned().collect())
    }

    fn cancel(&self, id: &str) -> Result<(), SchedulerError> {
        self.entries().remove(id);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Cancellation sweep
// ═══════════════════════════════════════════════════════════

/// Cancel every pending registration for one medication-schedule id in
/// a single pass over the pending list. Returns the number cancelled.
/// Per-entry cancel failures are logged and do not stop the sweep.
pub fn cancel_for_schedule(scheduler: &dyn LocalScheduler, schedule_id: Uuid) -> usize {
    let pending = match scheduler.list_pending() {
        Ok(list) => list,
        Err(e) => {
            tracing::warn!(error = %e, "Could not list pending notifications for cancellation");
            return 0;
        }
    };

    let mut cancelled = 0;
    for entry in pending {
        if entry.payload.schedule_id() == Some(schedule_id) {
            match scheduler.cancel(&entry.id) {
                Ok(()) => cancelled += 1,
                Err(e) => {
                    tracing::warn!(id = %entry.id, error = %e, "Cancel failed during sweep");
                }
            }
        }
    }
    cancelled
}
