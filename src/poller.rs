//! Alert poller — the caregiver-side pickup for stored fallback alerts.
//!
//! Runs only on devices whose user is a caregiver. Each tick queries the
//! unacknowledged stored alerts for that caregiver, surfaces each one as
//! an immediate local notification, and marks it acknowledged. If the
//! acknowledge write fails after the notification was shown, the row
//! will resurface on the next tick — at-least-once delivery, accepted
//! and warn-logged rather than swallowed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::config::{ALERT_POLL_INTERVAL, MIN_SCHEDULE_OFFSET};
use crate::db::{DatabaseError, DbHandle};
use crate::models::{AlertKind, StoredAlert};
use crate::scheduler::{LocalScheduler, NotificationPayload, ScheduleRequest, Urgency};

// ═══════════════════════════════════════════════════════════
// Poller service
// ═══════════════════════════════════════════════════════════

pub struct AlertPoller {
    db: DbHandle,
    scheduler: Arc<dyn LocalScheduler>,
    interval: Duration,
    active: Arc<AtomicBool>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AlertPoller {
    pub fn new(db: DbHandle, scheduler: Arc<dyn LocalScheduler>) -> Self {
        Self {
            db,
            scheduler,
            interval: ALERT_POLL_INTERVAL,
            active: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Override the poll interval (tests use millisecond intervals).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start polling for one caregiver. Idempotent: a second start while
    /// already running is a no-op.
    pub fn start(&self, caregiver_id: Uuid) {
        if self.active.swap(true, Ordering::SeqCst) {
            tracing::debug!("Alert poller already running");
            return;
        }

        let db = self.db.clone();
        let scheduler = self.scheduler.clone();
        let interval = self.interval;
        let active = self.active.clone();

        let task = tokio::spawn(async move {
            tracing::info!(caregiver_id = %caregiver_id, "Alert poller started");
            // Immediate first tick, then the fixed interval.
            loop {
                if !active.load(Ordering::SeqCst) {
                    break;
                }
                match db.open() {
                    Ok(conn) => {
                        if let Err(e) = run_tick(&conn, scheduler.as_ref(), caregiver_id, true) {
                            tracing::warn!(error = %e, "Alert poll tick failed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Alert poller could not open store");
                    }
                }
                tokio::time::sleep(interval).await;
            }
            tracing::info!("Alert poller stopped");
        });

        *self.handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);
    }

    /// Stop polling and clear the periodic task.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(task) = self
            .handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            task.abort();
        }
    }

    /// Whether the periodic loop is currently running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for AlertPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

// ═══════════════════════════════════════════════════════════
// Tick
// ═══════════════════════════════════════════════════════════

/// One poll pass: surface every pending stored alert for the caregiver
/// as an immediate local notification and retire it. Returns the number
/// surfaced. `quiet` suppresses the per-tick diagnostics that would be
/// noise on a 10-second timer; manual invocations pass false.
pub fn run_tick(
    conn: &Connection,
    scheduler: &dyn LocalScheduler,
    caregiver_id: Uuid,
    quiet: bool,
) -> Result<usize, DatabaseError> {
    let alerts = fetch_pending_alerts(conn, caregiver_id)?;
    if !quiet {
        tracing::info!(caregiver_id = %caregiver_id, pending = alerts.len(), "Alert poll tick");
    }
    if alerts.is_empty() {
        return Ok(0);
    }

    let mut surfaced = 0;
    for alert in alerts {
        let request = ScheduleRequest {
            id: format!("stored-alert-{}", alert.id),
            title: "Care alert".into(),
            body: alert.message.clone(),
            offset: MIN_SCHEDULE_OFFSET,
            urgency: Urgency::Maximum,
            payload: NotificationPayload::CaregiverAlertLocal {
                alert_id: alert.id,
                patient_id: alert.patient_id,
                caregiver_id: alert.caregiver_id,
                message: alert.message.clone(),
            },
        };
        if let Err(e) = scheduler.schedule(request) {
            // Not acknowledged: the row must resurface next tick.
            tracing::warn!(alert_id = %alert.id, error = %e, "Could not surface stored alert");
            continue;
        }
        surfaced += 1;

        if let Err(e) = mark_alert_acknowledged(conn, alert.id, Utc::now()) {
            // Shown but not retired; next tick may re-show it.
            // At-least-once is the accepted semantic here.
            tracing::warn!(alert_id = %alert.id, error = %e, "Acknowledge failed after showing alert");
        }
    }

    tracing::debug!(caregiver_id = %caregiver_id, surfaced, "Stored alerts surfaced");
    Ok(surfaced)
}

// ═══════════════════════════════════════════════════════════
// Repository functions
// ═══════════════════════════════════════════════════════════

/// Unacknowledged alerts for a caregiver, preferring rows of the
/// fallback kind or with no kind at all (older rows carry none). When
/// that filtered query is empty, broaden to any unacknowledged row
/// before concluding nothing is pending.
pub fn fetch_pending_alerts(
    conn: &Connection,
    caregiver_id: Uuid,
) -> Result<Vec<StoredAlert>, DatabaseError> {
    let preferred = query_alerts(
        conn,
        "SELECT id, patient_id, caregiver_id, schedule_id, kind, message,
                acknowledged, acknowledged_at, created_at
         FROM stored_alerts
         WHERE caregiver_id = ?1 AND acknowledged = 0
           AND (kind = ?2 OR kind IS NULL)
         ORDER BY created_at ASC",
        params![
            caregiver_id.to_string(),
            AlertKind::MissedDoseLocalFallback.as_str()
        ],
    )?;
    if !preferred.is_empty() {
        return Ok(preferred);
    }

    query_alerts(
        conn,
        "SELECT id, patient_id, caregiver_id, schedule_id, kind, message,
                acknowledged, acknowledged_at, created_at
         FROM stored_alerts
         WHERE caregiver_id = ?1 AND acknowledged = 0
         ORDER BY created_at ASC",
        params![caregiver_id.to_string()],
    )
}

fn query_alerts(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::types::ToSql],
) -> Result<Vec<StoredAlert>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(StoredAlert {
                id: parse_uuid(row.get::<_, String>(0)?),
                patient_id: parse_uuid(row.get::<_, String>(1)?),
                caregiver_id: parse_uuid(row.get::<_, String>(2)?),
                schedule_id: row
                    .get::<_, Option<String>>(3)?
                    .and_then(|s| s.parse().ok()),
                kind: row
                    .get::<_, Option<String>>(4)?
                    .as_deref()
                    .and_then(AlertKind::parse),
                message: row.get(5)?,
                acknowledged: row.get::<_, i32>(6)? != 0,
                acknowledged_at: row.get::<_, Option<String>>(7)?.map(parse_instant),
                created_at: parse_instant(row.get::<_, String>(8)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Retire a stored alert so it is never redelivered.
pub fn mark_alert_acknowledged(
    conn: &Connection,
    alert_id: Uuid,
    acknowledged_at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE stored_alerts
         SET acknowledged = 1, acknowledged_at = ?2
         WHERE id = ?1",
        params![alert_id.to_string(), acknowledged_at.to_rfc3339()],
    )?;
    Ok(())
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
