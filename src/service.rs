//! Alarm service — the composition root the host application holds.
//!
//! One explicitly constructed instance per running app, wired with the
//! store handle, the platform's local scheduler, and the push relay.
//! The host's lifecycle hooks call into it: notification-response
//! handlers feed `handle_notification_response`, the "mark taken"
//! action calls `mark_taken`, and caregiver sign-in starts the stored-
//! alert poller. No global state; teardown is `stop_caregiver_polling`
//! plus drop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::db::{DatabaseError, DbHandle};
use crate::escalation::{EscalationTrigger, PlatformTasks};
use crate::models::{DoseEvent, NotificationSettings};
use crate::pipeline::{fetch_notification_settings, upsert_notification_settings};
use crate::poller::{self, AlertPoller};
use crate::scheduler::{LocalScheduler, NotificationPayload};
use crate::sequencer::{self, AlarmTiming};
use crate::transport::PushTransport;

/// Role of the signed-in user on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    Patient,
    Caregiver,
}

pub struct AlarmService {
    db: DbHandle,
    scheduler: Arc<dyn LocalScheduler>,
    trigger: EscalationTrigger,
    poller: AlertPoller,
}

impl AlarmService {
    pub fn new(
        db: DbHandle,
        scheduler: Arc<dyn LocalScheduler>,
        transport: Arc<dyn PushTransport>,
    ) -> Self {
        let trigger = EscalationTrigger::new(db.clone(), scheduler.clone(), transport);
        let poller = AlertPoller::new(db.clone(), scheduler.clone());
        Self {
            db,
            scheduler,
            trigger,
            poller,
        }
    }

    /// Attach an optional platform task manager for redundant wakeups.
    pub fn with_platform(mut self, platform: Arc<dyn PlatformTasks>) -> Self {
        self.trigger = self.trigger.with_platform(platform);
        self
    }

    /// Shorten the poll interval (accelerated/test timing).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poller = self.poller.with_interval(interval);
        self
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    // ── Patient-side entry points ────────────────────────────

    /// Begin the escalation sequence for a dose whose first reminder
    /// just fired. Timing comes from the caller (accelerated mode), the
    /// patient's settings, or the defaults, in that order. Also arms
    /// the deferred re-check, since local delivery of the caregiver
    /// check is best effort.
    pub fn begin_escalation(&self, dose: &DoseEvent, timing: Option<AlarmTiming>) -> usize {
        let timing =
            timing.unwrap_or_else(|| AlarmTiming::for_patient(&self.db, dose.patient_id));
        let conn = match self.db.open() {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::warn!(error = %e, "Store unavailable, scheduling without attempt log");
                None
            }
        };
        let registered = sequencer::schedule_escalation(
            conn.as_ref(),
            self.scheduler.as_ref(),
            dose,
            &timing,
            dose.scheduled_at,
        );
        self.trigger
            .arm_deferred_check(dose.clone(), timing.caregiver_delay);
        registered
    }

    /// Record a dose as taken and clear its pending reminders.
    pub fn mark_taken(&self, dose: &DoseEvent) -> Result<usize, DatabaseError> {
        let conn = self.db.open()?;
        sequencer::mark_dose_taken(&conn, self.scheduler.as_ref(), dose, Utc::now())
    }

    /// Dispatch one delivered-notification payload to its handler.
    /// Returns true when the payload caused an escalation action.
    pub async fn handle_notification_response(&self, payload: NotificationPayload) -> bool {
        match payload {
            NotificationPayload::CaregiverCheck {
                patient_id,
                schedule_id,
                medication_name,
                scheduled_at,
            } => {
                let dose = DoseEvent::new(patient_id, schedule_id, medication_name, scheduled_at);
                self.trigger.on_caregiver_check(&dose).await
            }
            NotificationPayload::EscalationCheck {
                patient_id,
                schedule_id,
                medication_name,
                schedule_time,
            } => {
                let dose = DoseEvent::new(patient_id, schedule_id, medication_name, Utc::now());
                self.trigger
                    .on_reminder_delivered_keyed(&dose, &schedule_time)
                    .await
            }
            NotificationPayload::MedicationAlarm { attempt, .. } => {
                // Reminder steps are patient-facing; the sequencer has
                // already registered the rest of the timeline.
                tracing::debug!(attempt, "Medication alarm delivered");
                false
            }
            NotificationPayload::CaregiverAlertLocal { alert_id, .. } => {
                if let Ok(conn) = self.db.open() {
                    if let Err(e) = poller::mark_alert_acknowledged(&conn, alert_id, Utc::now()) {
                        tracing::warn!(alert_id = %alert_id, error = %e, "Acknowledge failed");
                    }
                }
                false
            }
        }
    }

    // ── Caregiver-side lifecycle ─────────────────────────────

    /// Start the stored-alert poller, caregivers only. Returns whether
    /// polling is running afterwards.
    pub fn start_caregiver_polling(&self, user_id: Uuid, role: UserRole) -> bool {
        if role != UserRole::Caregiver {
            tracing::debug!(user_id = %user_id, "Not a caregiver, poller not started");
            return false;
        }
        self.poller.start(user_id);
        true
    }

    pub fn stop_caregiver_polling(&self) {
        self.poller.stop();
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_active()
    }

    // ── Settings ─────────────────────────────────────────────

    /// Register (or refresh) a user's push address and default
    /// preferences. The only write path for notification settings.
    pub fn init_notification_settings(
        &self,
        user_id: Uuid,
        push_token: Option<String>,
    ) -> Result<(), DatabaseError> {
        let conn = self.db.open()?;
        let mut settings = fetch_notification_settings(&conn, user_id)?
            .unwrap_or_else(|| NotificationSettings::defaults(user_id));
        settings.push_token = push_token;
        settings.updated_at = Utc::now();
        upsert_notification_settings(&conn, &settings)
    }

}

// ═══════════════════════════════════════════════════════════
// Tests — end-to-end scenarios
// ═══════════════════════════════════════════════════════════
