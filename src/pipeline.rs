//! Caregiver alert pipeline — fan-out for one escalated dose event.
//!
//! Resolves the patient's active caregivers, attempts push delivery to
//! each concurrently, and falls back to a durable stored alert whenever
//! delivery could not be confirmed (no address, placeholder handled
//! separately, relay error, non-confirming response). One caregiver's
//! failure never blocks the others, and the attempt log is marked
//! caregiver-alerted after the fan-out regardless of delivery outcomes.

use chrono::Utc;
use futures_util::future::join_all;
use rusqlite::{params, Connection};
use serde_json::json;
use uuid::Uuid;

use crate::db::{DatabaseError, DbHandle};
use crate::models::{
    AlertKind, CaregiverConnection, ConnectionStatus, DoseEvent, NotificationSettings, StoredAlert,
};
use crate::sequencer::mark_attempts_caregiver_alerted;
use crate::transport::{is_placeholder_address, Delivery, PushMessage, PushTransport};

/// Label used when the patient's display name cannot be resolved.
const FALLBACK_PATIENT_LABEL: &str = "Your patient";

/// How one caregiver's notification was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaregiverOutcome {
    /// The relay confirmed delivery.
    PushConfirmed,
    /// Placeholder address; treated as delivered without any relay call.
    PlaceholderDelivered,
    /// Delivery did not confirm; a fallback alert row was written.
    FallbackStored,
    /// Delivery did not confirm AND the fallback write failed.
    FallbackWriteFailed,
}

#[derive(Debug, Clone)]
pub struct AlertOutcome {
    pub caregiver_id: Uuid,
    pub outcome: CaregiverOutcome,
}

/// Notify every active caregiver of the patient about a missed dose.
///
/// A patient with no caregivers is a steady state, not an error: the
/// pipeline logs and returns an empty outcome list. Database open
/// failures do propagate — the escalation trigger fails open on them.
pub async fn run_for_dose(
    db: &DbHandle,
    transport: &dyn PushTransport,
    dose: &DoseEvent,
) -> Result<Vec<AlertOutcome>, DatabaseError> {
    // Phase 1: resolve recipients and addresses while the connection is
    // open; the fan-out itself touches no database state.
    let (caregivers, patient_name) = {
        let conn = db.open()?;
        let caregivers = fetch_active_caregivers(&conn, dose.patient_id)?;
        if caregivers.is_empty() {
            tracing::info!(
                patient_id = %dose.patient_id,
                "No active caregivers, skipping alert pipeline"
            );
            return Ok(Vec::new());
        }
        let name = fetch_patient_name(&conn, dose.patient_id)
            .unwrap_or_else(|| FALLBACK_PATIENT_LABEL.to_string());
        let with_tokens: Vec<(Uuid, Option<String>)> = caregivers
            .into_iter()
            .map(|connection| {
                let token = fetch_notification_settings(&conn, connection.caregiver_id)
                    .ok()
                    .flatten()
                    .and_then(|s| s.push_token);
                (connection.caregiver_id, token)
            })
            .collect();
        (with_tokens, name)
    };

    let message_body = format!(
        "{} may have missed their {} dose scheduled for {}.",
        patient_name,
        dose.medication_name,
        dose.scheduled_at.format("%H:%M")
    );

    // Phase 2: concurrent delivery attempts, one per caregiver.
    let attempts = caregivers.iter().map(|(caregiver_id, token)| {
        let body = message_body.clone();
        async move {
            let delivered = match token.as_deref() {
                Some(address) if is_placeholder_address(address) => {
                    tracing::info!(caregiver_id = %caregiver_id, "Placeholder push address, treating as delivered");
                    Some(CaregiverOutcome::PlaceholderDelivered)
                }
                Some(address) => {
                    let message = PushMessage {
                        to: address.to_string(),
                        title: "Missed medication alert".into(),
                        body,
                        priority: "high".into(),
                        data: json!({
                            "type": "missed-dose",
                            "patientId": dose.patient_id,
                            "scheduleId": dose.schedule_id,
                            "medicationName": dose.medication_name,
                            "scheduledAt": dose.scheduled_at.to_rfc3339(),
                        }),
                    };
                    match transport.send(&message).await {
                        Ok(Delivery::Confirmed) => Some(CaregiverOutcome::PushConfirmed),
                        Ok(Delivery::NotConfirmed) => None,
                        Err(e) => {
                            tracing::warn!(caregiver_id = %caregiver_id, error = %e, "Push send failed");
                            None
                        }
                    }
                }
                None => None,
            };
            (*caregiver_id, delivered)
        }
    });
    let results = join_all(attempts).await;

    // Phase 3: fallback storage for every unconfirmed caregiver, then
    // attempt bookkeeping. Write failures here are warn-only.
    let mut outcomes = Vec::with_capacity(results.len());
    {
        let conn = db.open()?;
        for (caregiver_id, delivered) in results {
            let outcome = match delivered {
                Some(outcome) => outcome,
                None => {
                    let alert = StoredAlert {
                        id: Uuid::new_v4(),
                        patient_id: dose.patient_id,
                        caregiver_id,
                        schedule_id: None,
                        kind: Some(AlertKind::MissedDoseLocalFallback),
                        message: message_body.clone(),
                        acknowledged: false,
                        acknowledged_at: None,
                        created_at: Utc::now(),
                    };
                    match insert_stored_alert(&conn, &alert) {
                        Ok(()) => CaregiverOutcome::FallbackStored,
                        Err(e) => {
                            tracing::warn!(
                                caregiver_id = %caregiver_id,
                                error = %e,
                                "Fallback alert write failed"
                            );
                            CaregiverOutcome::FallbackWriteFailed
                        }
                    }
                }
            };
            outcomes.push(AlertOutcome {
                caregiver_id,
                outcome,
            });
        }

        if let Err(e) =
            mark_attempts_caregiver_alerted(&conn, dose.schedule_id, dose.scheduled_at, Utc::now())
        {
            tracing::warn!(error = %e, "Could not mark attempts caregiver-alerted");
        }
    }

    tracing::info!(
        patient_id = %dose.patient_id,
        medication = %dose.medication_name,
        caregivers = outcomes.len(),
        "Caregiver alert pipeline completed"
    );
    Ok(outcomes)
}

// ═══════════════════════════════════════════════════════════
// Repository functions
// ═══════════════════════════════════════════════════════════

/// Connections actively linking a caregiver to the patient.
pub fn fetch_active_caregivers(
    conn: &Connection,
    patient_id: Uuid,
) -> Result<Vec<CaregiverConnection>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, patient_id, caregiver_id, status, created_at
         FROM caregiver_connections
         WHERE patient_id = ?1 AND status = ?2",
    )?;
    let rows = stmt
        .query_map(
            params![patient_id.to_string(), ConnectionStatus::Active.as_str()],
            |row| {
                Ok(CaregiverConnection {
                    id: parse_uuid(row.get::<_, String>(0)?),
                    patient_id: parse_uuid(row.get::<_, String>(1)?),
                    caregiver_id: parse_uuid(row.get::<_, String>(2)?),
                    status: ConnectionStatus::parse(&row.get::<_, String>(3)?),
                    created_at: row
                        .get::<_, String>(4)?
                        .parse::<chrono::DateTime<chrono::Utc>>()
                        .unwrap_or_else(|_| Utc::now()),
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn parse_uuid(s: String) -> Uuid {
    s.parse().unwrap_or_else(|_| Uuid::nil())
}

/// Patient display name for message composition. Best effort.
pub fn fetch_patient_name(conn: &Connection, patient_id: Uuid) -> Option<String> {
    conn.query_row(
        "SELECT display_name FROM patients WHERE id = ?1",
        params![patient_id.to_string()],
        |row| row.get(0),
    )
    .ok()
}

/// Read a user's push address and preferences.
pub fn fetch_notification_settings(
    conn: &Connection,
    user_id: Uuid,
) -> Result<Option<NotificationSettings>, DatabaseError> {
    let result = conn.query_row(
        "SELECT user_id, push_token, sound_enabled, vibration_enabled,
                reminder_interval_min, caregiver_delay_min, updated_at
         FROM notification_settings WHERE user_id = ?1",
        params![user_id.to_string()],
        |row| {
            Ok(NotificationSettings {
                user_id: row
                    .get::<_, String>(0)?
                    .parse()
                    .unwrap_or_else(|_| Uuid::nil()),
                push_token: row.get(1)?,
                sound_enabled: row.get::<_, i32>(2)? != 0,
                vibration_enabled: row.get::<_, i32>(3)? != 0,
                reminder_interval_min: row.get(4)?,
                caregiver_delay_min: row.get(5)?,
                updated_at: row
                    .get::<_, String>(6)?
                    .parse::<chrono::DateTime<chrono::Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
            })
        },
    );
    match result {
        Ok(settings) => Ok(Some(settings)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(DatabaseError::from(e)),
    }
}

/// Write a user's push address and preferences (initialization path).
pub fn upsert_notification_settings(
    conn: &Connection,
    settings: &NotificationSettings,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO notification_settings
            (user_id, push_token, sound_enabled, vibration_enabled,
             reminder_interval_min, caregiver_delay_min, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(user_id) DO UPDATE SET
            push_token = excluded.push_token,
            sound_enabled = excluded.sound_enabled,
            vibration_enabled = excluded.vibration_enabled,
            reminder_interval_min = excluded.reminder_interval_min,
            caregiver_delay_min = excluded.caregiver_delay_min,
            updated_at = excluded.updated_at",
        params![
            settings.user_id.to_string(),
            settings.push_token,
            settings.sound_enabled as i32,
            settings.vibration_enabled as i32,
            settings.reminder_interval_min,
            settings.caregiver_delay_min,
            settings.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Persist a fallback alert for poller pickup.
pub fn insert_stored_alert(conn: &Connection, alert: &StoredAlert) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO stored_alerts
            (id, patient_id, caregiver_id, schedule_id, kind, message,
             acknowledged, acknowledged_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            alert.id.to_string(),
            alert.patient_id.to_string(),
            alert.caregiver_id.to_string(),
            alert.schedule_id.map(|id| id.to_string()),
            alert.kind.map(|k| k.as_str()),
            alert.message,
            alert.acknowledged as i32,
            alert.acknowledged_at.map(|t| t.to_rfc3339()),
            alert.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::transport::TransportError;

    /// Scripted fake relay: maps destination address to an outcome.
    #[derive(Default)]
    struct FakeTransport {
        outcomes: HashMap<String, Delivery>,
        fail_addresses: Vec<String>,
        calls: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PushTransport for FakeTransport {
        async fn send(&self, message: &PushMessage) -> Result<Delivery, TransportError> {
            self.calls.lock().unwrap().push(message.to.clone());
            if self.fail_addresses.contains(&message.to) {
                return Err(TransportError::Status(500));
            }
            Ok(self
                .outcomes
                .get(&message.to)
                .copied()
                .unwrap_or(Delivery::NotConfirmed))
        }
    }

    struct Fixture {
        _dir: TempDir,
        db: DbHandle,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = DbHandle::new(dir.path().join("alarms.db"));
        db.open().unwrap();
        Fixture { _dir: dir, db }
    }

    fn insert_patient(conn: &Connection, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO patients (id, display_name) VALUES (?1, ?2)",
            params![id.to_string(), name],
        )
        .unwrap();
        id
    }

    fn connect_caregiver(conn: &Connection, patient_id: Uuid, status: &str) -> Uuid {
        let caregiver_id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO caregiver_connections (id, patient_id, caregiver_id, status)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                Uuid::new_v4().to_string(),
                patient_id.to_string(),
                caregiver_id.to_string(),
                status
            ],
        )
        .unwrap();
        caregiver_id
    }

    fn set_token(conn: &Connection, user_id: Uuid, token: Option<&str>) {
        let mut settings = NotificationSettings::defaults(user_id);
        settings.push_token = token.map(String::from);
        upsert_notification_settings(conn, &settings).unwrap();
    }

    fn stored_alert_count(conn: &Connection, caregiver_id: Uuid) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM stored_alerts WHERE caregiver_id = ?1",
            params![caregiver_id.to_string()],
            |row| row.get(0),
        )
        .unwrap()
    }

    fn dose_for(patient_id: Uuid) -> DoseEvent {
        DoseEvent::new(patient_id, Uuid::new_v4(), "Levodopa", Utc::now())
    }

    #[tokio::test]
    async fn no_caregivers_is_a_quiet_noop() {
        let fx = fixture();
        let conn = fx.db.open().unwrap();
        let patient_id = insert_patient(&conn, "Marie");
        drop(conn);

        let transport = FakeTransport::default();
        let outcomes = run_for_dose(&fx.db, &transport, &dose_for(patient_id))
            .await
            .unwrap();
        assert!(outcomes.is_empty());
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn inactive_connections_are_not_alerted() {
        let fx = fixture();
        let conn = fx.db.open().unwrap();
        let patient_id = insert_patient(&conn, "Marie");
        connect_caregiver(&conn, patient_id, "inactive");
        drop(conn);

        let transport = FakeTransport::default();
        let outcomes = run_for_dose(&fx.db, &transport, &dose_for(patient_id))
            .await
            .unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn confirmed_push_writes_no_fallback() {
        let fx = fixture();
        let conn = fx.db.open().unwrap();
        let patient_id = insert_patient(&conn, "Marie");
        let caregiver = connect_caregiver(&conn, patient_id, "active");
        set_token(&conn, caregiver, Some("ExponentPushToken[real-device-1]"));
        drop(conn);

        let mut transport = FakeTransport::default();
        transport.outcomes.insert(
            "ExponentPushToken[real-device-1]".into(),
            Delivery::Confirmed,
        );

        let outcomes = run_for_dose(&fx.db, &transport, &dose_for(patient_id))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].outcome, CaregiverOutcome::PushConfirmed);

        let conn = fx.db.open().unwrap();
        assert_eq!(stored_alert_count(&conn, caregiver), 0);
    }

    #[tokio::test]
    async fn unconfirmed_push_falls_back_to_store() {
        let fx = fixture();
        let conn = fx.db.open().unwrap();
        let patient_id = insert_patient(&conn, "Marie");
        let caregiver = connect_caregiver(&conn, patient_id, "active");
        set_token(&conn, caregiver, Some("ExponentPushToken[dead-device]"));
        drop(conn);

        // FakeTransport defaults to NotConfirmed for unknown addresses.
        let transport = FakeTransport::default();
        let outcomes = run_for_dose(&fx.db, &transport, &dose_for(patient_id))
            .await
            .unwrap();
        assert_eq!(outcomes[0].outcome, CaregiverOutcome::FallbackStored);

        let conn = fx.db.open().unwrap();
        assert_eq!(stored_alert_count(&conn, caregiver), 1);
        let (kind, message): (Option<String>, String) = conn
            .query_row(
                "SELECT kind, message FROM stored_alerts WHERE caregiver_id = ?1",
                params![caregiver.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(kind.as_deref(), Some("missed_dose_local_fallback"));
        assert!(message.contains("Levodopa"));
        assert!(message.contains("Marie"));
    }

    #[tokio::test]
    async fn transport_error_falls_back_to_store() {
        let fx = fixture();
        let conn = fx.db.open().unwrap();
        let patient_id = insert_patient(&conn, "Marie");
        let caregiver = connect_caregiver(&conn, patient_id, "active");
        set_token(&conn, caregiver, Some("ExponentPushToken[erroring]"));
        drop(conn);

        let mut transport = FakeTransport::default();
        transport
            .fail_addresses
            .push("ExponentPushToken[erroring]".into());

        let outcomes = run_for_dose(&fx.db, &transport, &dose_for(patient_id))
            .await
            .unwrap();
        assert_eq!(outcomes[0].outcome, CaregiverOutcome::FallbackStored);

        let conn = fx.db.open().unwrap();
        assert_eq!(stored_alert_count(&conn, caregiver), 1);
    }

    #[tokio::test]
    async fn missing_address_falls_back_without_relay_call() {
        let fx = fixture();
        let conn = fx.db.open().unwrap();
        let patient_id = insert_patient(&conn, "Marie");
        let caregiver = connect_caregiver(&conn, patient_id, "active");
        set_token(&conn, caregiver, None);
        drop(conn);

        let transport = FakeTransport::default();
        let outcomes = run_for_dose(&fx.db, &transport, &dose_for(patient_id))
            .await
            .unwrap();
        assert_eq!(outcomes[0].outcome, CaregiverOutcome::FallbackStored);
        assert!(transport.calls.lock().unwrap().is_empty());

        let conn = fx.db.open().unwrap();
        assert_eq!(stored_alert_count(&conn, caregiver), 1);
    }

    #[tokio::test]
    async fn placeholder_address_counts_as_delivered() {
        let fx = fixture();
        let conn = fx.db.open().unwrap();
        let patient_id = insert_patient(&conn, "Marie");
        let caregiver = connect_caregiver(&conn, patient_id, "active");
        set_token(&conn, caregiver, Some("mock-push-token"));
        drop(conn);

        let transport = FakeTransport::default();
        let outcomes = run_for_dose(&fx.db, &transport, &dose_for(patient_id))
            .await
            .unwrap();
        assert_eq!(outcomes[0].outcome, CaregiverOutcome::PlaceholderDelivered);
        assert!(transport.calls.lock().unwrap().is_empty());

        let conn = fx.db.open().unwrap();
        assert_eq!(stored_alert_count(&conn, caregiver), 0);
    }

    #[tokio::test]
    async fn mixed_caregivers_processed_independently() {
        let fx = fixture();
        let conn = fx.db.open().unwrap();
        let patient_id = insert_patient(&conn, "Marie");
        let ok_caregiver = connect_caregiver(&conn, patient_id, "active");
        let dead_caregiver = connect_caregiver(&conn, patient_id, "active");
        let bare_caregiver = connect_caregiver(&conn, patient_id, "active");
        set_token(&conn, ok_caregiver, Some("ExponentPushToken[alive]"));
        set_token(&conn, dead_caregiver, Some("ExponentPushToken[dead]"));
        set_token(&conn, bare_caregiver, None);
        drop(conn);

        let mut transport = FakeTransport::default();
        transport
            .outcomes
            .insert("ExponentPushToken[alive]".into(), Delivery::Confirmed);

        let outcomes = run_for_dose(&fx.db, &transport, &dose_for(patient_id))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 3);

        let conn = fx.db.open().unwrap();
        assert_eq!(stored_alert_count(&conn, ok_caregiver), 0);
        assert_eq!(stored_alert_count(&conn, dead_caregiver), 1);
        assert_eq!(stored_alert_count(&conn, bare_caregiver), 1);
    }

    #[tokio::test]
    async fn attempts_marked_alerted_even_when_nothing_delivered() {
        let fx = fixture();
        let conn = fx.db.open().unwrap();
        let patient_id = insert_patient(&conn, "Marie");
        let caregiver = connect_caregiver(&conn, patient_id, "active");
        set_token(&conn, caregiver, None);
        let dose = dose_for(patient_id);
        crate::sequencer::log_attempt(&conn, &dose, 1, Utc::now());
        drop(conn);

        let transport = FakeTransport::default();
        run_for_dose(&fx.db, &transport, &dose).await.unwrap();

        let conn = fx.db.open().unwrap();
        let attempts =
            crate::sequencer::fetch_attempts_for_dose(&conn, dose.schedule_id, dose.scheduled_at)
                .unwrap();
        assert!(attempts.iter().all(|a| a.caregiver_alerted));
    }

    #[tokio::test]
    async fn unknown_patient_uses_fallback_label() {
        let fx = fixture();
        let conn = fx.db.open().unwrap();
        let patient_id = Uuid::new_v4(); // no patients row
        let caregiver = connect_caregiver(&conn, patient_id, "active");
        set_token(&conn, caregiver, None);
        drop(conn);

        let transport = FakeTransport::default();
        run_for_dose(&fx.db, &transport, &dose_for(patient_id))
            .await
            .unwrap();

        let conn = fx.db.open().unwrap();
        let message: String = conn
            .query_row(
                "SELECT message FROM stored_alerts WHERE caregiver_id = ?1",
                params![caregiver.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert!(message.starts_with(FALLBACK_PATIENT_LABEL));
    }

    #[test]
    fn settings_upsert_round_trip() {
        let conn = crate::db::open_memory_database().unwrap();
        let user_id = Uuid::new_v4();
        let mut settings = NotificationSettings::defaults(user_id);
        settings.push_token = Some("ExponentPushToken[abc]".into());
        settings.reminder_interval_min = 3;
        upsert_notification_settings(&conn, &settings).unwrap();

        let loaded = fetch_notification_settings(&conn, user_id).unwrap().unwrap();
        assert_eq!(loaded.push_token.as_deref(), Some("ExponentPushToken[abc]"));
        assert_eq!(loaded.reminder_interval_min, 3);

        settings.push_token = None;
        upsert_notification_settings(&conn, &settings).unwrap();
        let reloaded = fetch_notification_settings(&conn, user_id).unwrap().unwrap();
        assert!(reloaded.push_token.is_none());
    }

    #[test]
    fn settings_absent_returns_none() {
        let conn = crate::db::open_memory_database().unwrap();
        assert!(fetch_notification_settings(&conn, Uuid::new_v4())
            .unwrap()
            .is_none());
    }
}
