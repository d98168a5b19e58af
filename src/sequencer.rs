//! Alarm sequencer — escalation timeline for one missed-dose event.
//!
//! Invoked when the first reminder for a dose fires. Computes the
//! instants for reminders 2 and 3 and the caregiver check, converts
//! each to a relative offset, and registers them with the local
//! scheduler under stable identifiers. Attempt rows are logged to
//! `alarm_attempts` as each step is registered, so ordinals are always
//! written in increasing order.
//!
//! Failure posture: a failed attempt-log write never blocks scheduling,
//! and a failed step registration never blocks the next step. Both are
//! surfaced through tracing only — forward progress of the sequence is
//! unconditional.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::config::{CAREGIVER_CHECK_DELAY, MIN_SCHEDULE_OFFSET, REMINDER_INTERVAL};
use crate::db::{DatabaseError, DbHandle};
use crate::models::{AlarmAttempt, DoseEvent, NotificationSettings};
use crate::scheduler::{
    cancel_for_schedule, LocalScheduler, NotificationPayload, ScheduleRequest, Urgency,
};

// ═══════════════════════════════════════════════════════════
// Timing
// ═══════════════════════════════════════════════════════════

/// Spacing configuration for one escalation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmTiming {
    /// Gap between consecutive reminder steps.
    pub reminder_interval: Duration,
    /// Delay from the anchor instant to the caregiver check.
    pub caregiver_delay: Duration,
}

impl AlarmTiming {
    /// Production timing: 5-minute steps, caregiver check at 15 minutes.
    pub fn normal() -> Self {
        Self {
            reminder_interval: REMINDER_INTERVAL,
            caregiver_delay: CAREGIVER_CHECK_DELAY,
        }
    }

    /// Accelerated timing for manual end-to-end verification: the whole
    /// sequence plays out within a minute.
    pub fn accelerated() -> Self {
        Self {
            reminder_interval: Duration::from_secs(15),
            caregiver_delay: Duration::from_secs(45),
        }
    }

    /// Timing from a patient's persisted notification settings.
    pub fn from_settings(settings: &NotificationSettings) -> Self {
        Self {
            reminder_interval: Duration::from_secs(u64::from(settings.reminder_interval_min) * 60),
            caregiver_delay: Duration::from_secs(u64::from(settings.caregiver_delay_min) * 60),
        }
    }

    /// Look up a patient's persisted timing, defaulting to normal when
    /// the store is unreachable or the patient has no settings row.
    pub fn for_patient(db: &DbHandle, patient_id: Uuid) -> Self {
        db.open()
            .ok()
            .and_then(|conn| {
                crate::pipeline::fetch_notification_settings(&conn, patient_id)
                    .ok()
                    .flatten()
            })
            .map(|settings| Self::from_settings(&settings))
            .unwrap_or_else(Self::normal)
    }

    /// Instant of reminder step `k` (k >= 1) relative to the anchor.
    pub fn step_instant(&self, anchor: DateTime<Utc>, step: u8) -> DateTime<Utc> {
        anchor
            + chrono::Duration::from_std(self.reminder_interval * u32::from(step - 1))
                .unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Instant of the caregiver check relative to the anchor.
    pub fn check_instant(&self, anchor: DateTime<Utc>) -> DateTime<Utc> {
        anchor
            + chrono::Duration::from_std(self.caregiver_delay)
                .unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// Convert an absolute instant to a "seconds from now" offset, floored
/// at one second — the scheduling primitive is most reliable with
/// relative offsets and rejects non-positive ones.
pub fn offset_from(now: DateTime<Utc>, target: DateTime<Utc>) -> Duration {
    match (target - now).to_std() {
        Ok(d) if d >= MIN_SCHEDULE_OFFSET => d,
        _ => MIN_SCHEDULE_OFFSET,
    }
}

/// Stable registration identifier for a reminder step.
pub fn step_identifier(schedule_id: Uuid, step: u8) -> String {
    format!("{schedule_id}-step{step}")
}

/// Stable registration identifier for the caregiver check.
pub fn check_identifier(schedule_id: Uuid) -> String {
    format!("{schedule_id}-cgcheck")
}

// ═══════════════════════════════════════════════════════════
// Sequencing
// ═══════════════════════════════════════════════════════════

/// Register the escalation timeline for one dose event.
///
/// Logs attempt 1 (the reminder that invoked us, already delivered),
/// then registers reminders 2 and 3 at `anchor + (k-1)·interval` and
/// the caregiver check at `anchor + caregiver_delay`. Calling this
/// twice without an intervening cancellation simply replaces the
/// per-identifier registrations. Returns the number of registrations
/// made.
///
/// `conn` is optional: when the store cannot be opened the attempt log
/// is skipped entirely, but every registration still happens — the
/// reminder ladder must never depend on the store being reachable.
pub fn schedule_escalation(
    conn: Option<&Connection>,
    scheduler: &dyn LocalScheduler,
    dose: &DoseEvent,
    timing: &AlarmTiming,
    anchor: DateTime<Utc>,
) -> usize {
    let now = Utc::now();
    let mut registered = 0;

    // Attempt 1 is the reminder already on screen when we are invoked.
    if let Some(conn) = conn {
        log_attempt(conn, dose, 1, anchor);
    }

    for step in 2..=3u8 {
        let fire_at = timing.step_instant(anchor, step);
        if let Some(conn) = conn {
            log_attempt(conn, dose, step, fire_at);
        }

        let urgency = Urgency::for_attempt(step);
        let request = ScheduleRequest {
            id: step_identifier(dose.schedule_id, step),
            title: reminder_title(step),
            body: format!(
                "You haven't confirmed your {} dose yet. Please take it now.",
                dose.medication_name
            ),
            offset: offset_from(now, fire_at),
            urgency,
            payload: NotificationPayload::MedicationAlarm {
                patient_id: dose.patient_id,
                schedule_id: dose.schedule_id,
                medication_name: dose.medication_name.clone(),
                scheduled_at: dose.scheduled_at,
                attempt: step,
            },
        };

        match scheduler.schedule(request) {
            Ok(()) => registered += 1,
            Err(e) => {
                tracing::warn!(step, error = %e, "Reminder step registration failed");
            }
        }
    }

    let check_at = timing.check_instant(anchor);
    let check = ScheduleRequest {
        id: check_identifier(dose.schedule_id),
        title: "Checking medication status".into(),
        body: format!("Verifying {} was taken", dose.medication_name),
        offset: offset_from(now, check_at),
        urgency: Urgency::Default,
        payload: NotificationPayload::CaregiverCheck {
            patient_id: dose.patient_id,
            schedule_id: dose.schedule_id,
            medication_name: dose.medication_name.clone(),
            scheduled_at: dose.scheduled_at,
        },
    };
    match scheduler.schedule(check) {
        Ok(()) => registered += 1,
        Err(e) => {
            tracing::warn!(error = %e, "Caregiver-check registration failed");
        }
    }

    tracing::debug!(
        schedule_id = %dose.schedule_id,
        medication = %dose.medication_name,
        registered,
        "Escalation timeline registered"
    );
    registered
}

fn reminder_title(step: u8) -> String {
    match step {
        2 => "Medication reminder (2nd alert)".into(),
        _ => "URGENT medication reminder (final alert)".into(),
    }
}

/// Record a dose as taken: write the administration record, flag the
/// dose event's attempts as responded, and cancel every pending
/// registration for the schedule id in one sweep. Returns the number of
/// registrations cancelled.
pub fn mark_dose_taken(
    conn: &Connection,
    scheduler: &dyn LocalScheduler,
    dose: &DoseEvent,
    taken_at: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    record_dose_taken(conn, dose, taken_at)?;
    mark_attempts_responded(conn, dose.schedule_id, dose.scheduled_at, taken_at)?;
    let cancelled = cancel_for_schedule(scheduler, dose.schedule_id);
    tracing::info!(
        schedule_id = %dose.schedule_id,
        cancelled,
        "Dose marked taken, pending reminders cleared"
    );
    Ok(cancelled)
}

// ═══════════════════════════════════════════════════════════
// Repository functions — alarm_attempts / dose_log
// ═══════════════════════════════════════════════════════════

/// Log one escalation step. Non-fatal by contract: a failed write is
/// warn-logged and scheduling proceeds regardless.
pub fn log_attempt(conn: &Connection, dose: &DoseEvent, attempt: u8, sent_at: DateTime<Utc>) {
    let result = conn.execute(
        "INSERT OR IGNORE INTO alarm_attempts
            (id, patient_id, schedule_id, medication_name, scheduled_at, attempt, sent_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            Uuid::new_v4().to_string(),
            dose.patient_id.to_string(),
            dose.schedule_id.to_string(),
            dose.medication_name,
            dose.scheduled_at.to_rfc3339(),
            attempt,
            sent_at.to_rfc3339(),
        ],
    );
    if let Err(e) = result {
        tracing::warn!(attempt, error = %e, "Alarm attempt log write failed");
    }
}

/// Fetch all attempts for one dose event, ordered by ordinal.
pub fn fetch_attempts_for_dose(
    conn: &Connection,
    schedule_id: Uuid,
    scheduled_at: DateTime<Utc>,
) -> Result<Vec<AlarmAttempt>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, patient_id, schedule_id, medication_name, scheduled_at, attempt,
                sent_at, patient_responded, responded_at, caregiver_alerted, caregiver_alerted_at
         FROM alarm_attempts
         WHERE schedule_id = ?1 AND scheduled_at = ?2
         ORDER BY attempt ASC",
    )?;
    let rows = stmt
        .query_map(
            params![schedule_id.to_string(), scheduled_at.to_rfc3339()],
            |row| {
                Ok(AlarmAttempt {
                    id: parse_uuid(row.get::<_, String>(0)?),
                    patient_id: parse_uuid(row.get::<_, String>(1)?),
                    schedule_id: parse_uuid(row.get::<_, String>(2)?),
                    medication_name: row.get(3)?,
                    scheduled_at: parse_instant(row.get::<_, String>(4)?),
                    attempt: row.get(5)?,
                    sent_at: parse_instant(row.get::<_, String>(6)?),
                    patient_responded: row.get::<_, i32>(7)? != 0,
                    responded_at: row.get::<_, Option<String>>(8)?.map(parse_instant),
                    caregiver_alerted: row.get::<_, i32>(9)? != 0,
                    caregiver_alerted_at: row.get::<_, Option<String>>(10)?.map(parse_instant),
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Whether any attempt for this dose event carries a patient response.
pub fn has_responded_attempt(
    conn: &Connection,
    schedule_id: Uuid,
    scheduled_at: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM alarm_attempts
         WHERE schedule_id = ?1 AND scheduled_at = ?2 AND patient_responded = 1",
        params![schedule_id.to_string(), scheduled_at.to_rfc3339()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Set patient_responded on every attempt of one dose event.
pub fn mark_attempts_responded(
    conn: &Connection,
    schedule_id: Uuid,
    scheduled_at: DateTime<Utc>,
    responded_at: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let updated = conn.execute(
        "UPDATE alarm_attempts
         SET patient_responded = 1, responded_at = ?3
         WHERE schedule_id = ?1 AND scheduled_at = ?2",
        params![
            schedule_id.to_string(),
            scheduled_at.to_rfc3339(),
            responded_at.to_rfc3339(),
        ],
    )?;
    Ok(updated)
}

/// Set caregiver_alerted on every attempt of one dose event. This row
/// tracks "alert pipeline ran", not "delivery confirmed".
pub fn mark_attempts_caregiver_alerted(
    conn: &Connection,
    schedule_id: Uuid,
    scheduled_at: DateTime<Utc>,
    alerted_at: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let updated = conn.execute(
        "UPDATE alarm_attempts
         SET caregiver_alerted = 1, caregiver_alerted_at = ?3
         WHERE schedule_id = ?1 AND scheduled_at = ?2",
        params![
            schedule_id.to_string(),
            scheduled_at.to_rfc3339(),
            alerted_at.to_rfc3339(),
        ],
    )?;
    Ok(updated)
}

/// Write the administration record for a taken dose.
pub fn record_dose_taken(
    conn: &Connection,
    dose: &DoseEvent,
    taken_at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO dose_log
            (id, patient_id, schedule_id, medication_name, scheduled_at, taken, taken_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
        params![
            Uuid::new_v4().to_string(),
            dose.patient_id.to_string(),
            dose.schedule_id.to_string(),
            dose.medication_name,
            dose.scheduled_at.to_rfc3339(),
            taken_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Whether a "taken" administration record exists for the medication
/// schedule inside the trailing window ending now.
pub fn has_taken_record_since(
    conn: &Connection,
    schedule_id: Uuid,
    since: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM dose_log
         WHERE schedule_id = ?1 AND taken = 1 AND taken_at >= ?2",
        params![schedule_id.to_string(), since.to_rfc3339()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn parse_uuid(s: String) -> Uuid {
    s.parse().unwrap_or_else(|_| Uuid::nil())
}

fn parse_instant(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
