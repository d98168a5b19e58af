//! Escalation trigger — decides, at the caregiver-check instant,
//! whether the caregiver alert pipeline must run.
//!
//! Two independent entry paths exist:
//! - `on_caregiver_check`: the caregiver-check registration fired; the
//!   attempt log decides. The sequence this path belongs to was
//!   anchored at the dose's original scheduled instant.
//! - `on_reminder_delivered`: a generic reminder was delivered but
//!   never acknowledged; the dose log decides, and a fresh 3-step
//!   sequence is started anchored at the *current* instant. The
//!   different anchoring between the two paths is deliberate product
//!   behavior and is kept distinct here.
//!
//! Both paths share one dedup lock keyed per logical missed-dose event,
//! and both fail open: if the "was it taken" query errors, escalation
//! proceeds — a redundant alert beats a missed one for a medical
//! reminder.
//!
//! Local-notification delivery is best effort and can be delayed while
//! the host app is backgrounded, so callers also arm a deferred tokio
//! re-check (`arm_deferred_check`) as a redundant trigger. An optional
//! platform task manager can add a third wakeup, but it is pure
//! enhancement behind `PlatformTasks`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::config::TAKEN_WINDOW;
use crate::db::DbHandle;
use crate::models::DoseEvent;
use crate::pipeline;
use crate::scheduler::LocalScheduler;
use crate::sequencer::{self, AlarmTiming};
use crate::transport::PushTransport;
use crate::ttl_set::TtlSet;

// ═══════════════════════════════════════════════════════════
// Escalation key
// ═══════════════════════════════════════════════════════════

/// Derived identifier for one logical missed-dose escalation, used only
/// for deduplication. The two trigger paths compose their keys from
/// different identity parts; the prefix keeps them from colliding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EscalationKey(String);

impl EscalationKey {
    /// Caregiver-check path: patient + medication + scheduled instant.
    pub fn for_dose(dose: &DoseEvent) -> Self {
        Self(format!(
            "dose:{}|{}|{}",
            dose.patient_id,
            dose.medication_name,
            dose.scheduled_at.to_rfc3339()
        ))
    }

    /// Generic reminder path: schedule id + schedule-time string.
    pub fn for_schedule(schedule_id: Uuid, schedule_time: &str) -> Self {
        Self(format!("sched:{schedule_id}|{schedule_time}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ═══════════════════════════════════════════════════════════
// Optional platform task manager
// ═══════════════════════════════════════════════════════════

/// Optional host capability to wake the process for a later escalation
/// check. The tokio deferred path is the only required mechanism; this
/// is enhancement when the platform offers background task scheduling.
pub trait PlatformTasks: Send + Sync {
    /// Request a wakeup after `delay`. Returns false when the
    /// capability is unavailable or the registration was refused.
    fn register_wakeup(&self, key: &EscalationKey, delay: Duration) -> bool;
}

/// No-op implementation for hosts without a background task manager.
pub struct NoopPlatformTasks;

impl PlatformTasks for NoopPlatformTasks {
    fn register_wakeup(&self, _key: &EscalationKey, _delay: Duration) -> bool {
        false
    }
}

// ═══════════════════════════════════════════════════════════
// Trigger
// ═══════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct EscalationTrigger {
    db: DbHandle,
    scheduler: Arc<dyn LocalScheduler>,
    transport: Arc<dyn PushTransport>,
    platform: Arc<dyn PlatformTasks>,
    locks: Arc<Mutex<TtlSet>>,
}

impl EscalationTrigger {
    pub fn new(
        db: DbHandle,
        scheduler: Arc<dyn LocalScheduler>,
        transport: Arc<dyn PushTransport>,
    ) -> Self {
        Self {
            db,
            scheduler,
            transport,
            platform: Arc::new(NoopPlatformTasks),
            locks: Arc::new(Mutex::new(TtlSet::new())),
        }
    }

    /// Attach a platform task manager.
    pub fn with_platform(mut self, platform: Arc<dyn PlatformTasks>) -> Self {
        self.platform = platform;
        self
    }

    /// Override the dedup-lock TTL (tests use millisecond TTLs).
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.locks = Arc::new(Mutex::new(TtlSet::with_ttl(ttl)));
        self
    }

    fn locks(&self) -> MutexGuard<'_, TtlSet> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Caregiver-check path. Returns true if the alert pipeline ran.
    pub async fn on_caregiver_check(&self, dose: &DoseEvent) -> bool {
        let key = EscalationKey::for_dose(dose);
        if !self.locks().try_insert(key.as_str()) {
            tracing::debug!(key = key.as_str(), "Escalation already in flight, skipping");
            return false;
        }

        let taken = self.dose_was_responded(dose);
        let ran = if taken {
            tracing::debug!(
                schedule_id = %dose.schedule_id,
                "Dose already responded, no escalation"
            );
            false
        } else {
            self.run_pipeline(dose).await;
            true
        };

        self.locks().remove(key.as_str());
        ran
    }

    /// Generic reminder path: no acknowledgement within the trailing
    /// window starts a fresh 3-step sequence anchored at now. Returns
    /// true if a new sequence was started.
    pub async fn on_reminder_delivered(&self, dose: &DoseEvent) -> bool {
        let schedule_time = dose.scheduled_at.format("%H:%M").to_string();
        self.on_reminder_delivered_keyed(dose, &schedule_time).await
    }

    /// Same path with an explicit schedule-time string, for callers
    /// that dispatch from a payload carrying the original key parts.
    pub async fn on_reminder_delivered_keyed(&self, dose: &DoseEvent, schedule_time: &str) -> bool {
        let key = EscalationKey::for_schedule(dose.schedule_id, schedule_time);
        if !self.locks().try_insert(key.as_str()) {
            tracing::debug!(key = key.as_str(), "Escalation already in flight, skipping");
            return false;
        }

        let taken = self.dose_was_taken_recently(dose);
        let started = if taken {
            tracing::debug!(
                schedule_id = %dose.schedule_id,
                "Taken record found in window, no escalation"
            );
            false
        } else {
            // Late-caught miss: restart the whole cycle from the
            // current instant, not the original scheduled one.
            let now = Utc::now();
            let timing = AlarmTiming::for_patient(&self.db, dose.patient_id);
            let conn = match self.db.open() {
                Ok(conn) => Some(conn),
                Err(e) => {
                    tracing::warn!(error = %e, "Store unavailable, restarting sequence without attempt log");
                    None
                }
            };
            sequencer::schedule_escalation(conn.as_ref(), self.scheduler.as_ref(), dose, &timing, now);
            self.arm_deferred_check(dose.clone(), timing.caregiver_delay);
            true
        };

        self.locks().remove(key.as_str());
        started
    }

    /// Redundant trigger for the caregiver check, driven by wall-clock
    /// delay instead of notification delivery. Honors the same dedup
    /// lock as the delivery-driven path.
    pub fn arm_deferred_check(&self, dose: DoseEvent, delay: Duration) {
        let key = EscalationKey::for_dose(&dose);
        if self.platform.register_wakeup(&key, delay) {
            tracing::debug!(key = key.as_str(), "Platform wakeup registered");
        }

        let trigger = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.on_caregiver_check(&dose).await;
        });
    }

    /// Whether any attempt for the dose carries a patient response.
    /// Query errors fail open (false): silence is the unsafe default.
    fn dose_was_responded(&self, dose: &DoseEvent) -> bool {
        let check = self.db.open().and_then(|conn| {
            sequencer::has_responded_attempt(&conn, dose.schedule_id, dose.scheduled_at)
        });
        match check {
            Ok(responded) => responded,
            Err(e) => {
                tracing::warn!(error = %e, "Response check failed, escalating anyway");
                false
            }
        }
    }

    /// Whether a taken record exists inside the trailing window.
    /// Query errors fail open (false).
    fn dose_was_taken_recently(&self, dose: &DoseEvent) -> bool {
        let since = Utc::now()
            - chrono::Duration::from_std(TAKEN_WINDOW).unwrap_or_else(|_| chrono::Duration::zero());
        let check = self
            .db
            .open()
            .and_then(|conn| sequencer::has_taken_record_since(&conn, dose.schedule_id, since));
        match check {
            Ok(taken) => taken,
            Err(e) => {
                tracing::warn!(error = %e, "Taken check failed, escalating anyway");
                false
            }
        }
    }

    async fn run_pipeline(&self, dose: &DoseEvent) {
        if let Err(e) = pipeline::run_for_dose(&self.db, self.transport.as_ref(), dose).await {
            tracing::error!(
                schedule_id = %dose.schedule_id,
                error = %e,
                "Caregiver alert pipeline failed"
            );
        }
    }

    #[cfg(test)]
    fn insert_lock_key(&self, key: &EscalationKey) {
        self.locks().try_insert(key.as_str());
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use rusqlite::params;
    use tempfile::TempDir;

    use crate::scheduler::InMemoryScheduler;
    use crate::transport::{Delivery, PushMessage, TransportError};

    /// Relay fake that counts sends and can hold each send open long
    /// enough for concurrent triggers to overlap.
    struct SlowTransport {
        sends: AtomicUsize,
        hold: Duration,
    }

    impl SlowTransport {
        fn new(hold: Duration) -> Self {
            Self {
                sends: AtomicUsize::new(0),
                hold,
            }
        }
    }

    #[async_trait]
    impl PushTransport for SlowTransport {
        async fn send(&self, _message: &PushMessage) -> Result<Delivery, TransportError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            Ok(Delivery::NotConfirmed)
        }
    }

    struct Fixture {
        _dir: TempDir,
        db: DbHandle,
        scheduler: Arc<InMemoryScheduler>,
        transport: Arc<SlowTransport>,
    }

    fn fixture(hold: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = DbHandle::new(dir.path().join("alarms.db"));
        db.open().unwrap();
        Fixture {
            _dir: dir,
            db,
            scheduler: Arc::new(InMemoryScheduler::new()),
            transport: Arc::new(SlowTransport::new(hold)),
        }
    }

    fn trigger(fx: &Fixture) -> EscalationTrigger {
        EscalationTrigger::new(
            fx.db.clone(),
            fx.scheduler.clone(),
            fx.transport.clone(),
        )
    }

    fn dose_with_caregiver(fx: &Fixture, token: Option<&str>) -> DoseEvent {
        let conn = fx.db.open().unwrap();
        let patient_id = Uuid::new_v4();
        let caregiver_id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO patients (id, display_name) VALUES (?1, 'Marie')",
            params![patient_id.to_string()],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO caregiver_connections (id, patient_id, caregiver_id, status)
             VALUES (?1, ?2, ?3, 'active')",
            params![
                Uuid::new_v4().to_string(),
                patient_id.to_string(),
                caregiver_id.to_string()
            ],
        )
        .unwrap();
        if let Some(token) = token {
            let mut settings = crate::models::NotificationSettings::defaults(caregiver_id);
            settings.push_token = Some(token.into());
            pipeline::upsert_notification_settings(&conn, &settings).unwrap();
        }
        DoseEvent::new(patient_id, Uuid::new_v4(), "Levodopa", Utc::now())
    }

    fn stored_alert_total(db: &DbHandle) -> i64 {
        db.open()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM stored_alerts", [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn unresponded_dose_escalates() {
        let fx = fixture(Duration::ZERO);
        let dose = dose_with_caregiver(&fx, None);

        let ran = trigger(&fx).on_caregiver_check(&dose).await;
        assert!(ran);
        assert_eq!(stored_alert_total(&fx.db), 1);
    }

    #[tokio::test]
    async fn responded_dose_does_not_escalate() {
        let fx = fixture(Duration::ZERO);
        let dose = dose_with_caregiver(&fx, None);
        {
            let conn = fx.db.open().unwrap();
            sequencer::log_attempt(&conn, &dose, 1, Utc::now());
            sequencer::mark_attempts_responded(&conn, dose.schedule_id, dose.scheduled_at, Utc::now())
                .unwrap();
        }

        let ran = trigger(&fx).on_caregiver_check(&dose).await;
        assert!(!ran);
        assert_eq!(stored_alert_total(&fx.db), 0);
    }

    #[tokio::test]
    async fn concurrent_checks_run_the_pipeline_once() {
        let fx = fixture(Duration::from_millis(100));
        let dose = dose_with_caregiver(&fx, Some("ExponentPushToken[real]"));
        let t = trigger(&fx);

        let (a, b) = tokio::join!(t.on_caregiver_check(&dose), t.on_caregiver_check(&dose));
        assert!(a ^ b, "Exactly one invocation must run the pipeline");
        assert_eq!(fx.transport.sends.load(Ordering::SeqCst), 1);
        assert_eq!(stored_alert_total(&fx.db), 1);
    }

    #[tokio::test]
    async fn held_key_blocks_both_paths() {
        let fx = fixture(Duration::ZERO);
        let dose = dose_with_caregiver(&fx, None);
        let t = trigger(&fx);

        t.insert_lock_key(&EscalationKey::for_dose(&dose));
        assert!(!t.on_caregiver_check(&dose).await);

        let time = dose.scheduled_at.format("%H:%M").to_string();
        t.insert_lock_key(&EscalationKey::for_schedule(dose.schedule_id, &time));
        assert!(!t.on_reminder_delivered(&dose).await);

        assert_eq!(stored_alert_total(&fx.db), 0);
    }

    #[tokio::test]
    async fn lock_expires_even_when_holder_hangs() {
        let fx = fixture(Duration::ZERO);
        let dose = dose_with_caregiver(&fx, None);
        let t = trigger(&fx).with_lock_ttl(Duration::from_millis(50));

        // Simulate a hung invocation that never cleans up its key.
        t.insert_lock_key(&EscalationKey::for_dose(&dose));
        assert!(!t.on_caregiver_check(&dose).await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(t.on_caregiver_check(&dose).await, "Expired key must admit");
        assert_eq!(stored_alert_total(&fx.db), 1);
    }

    #[tokio::test]
    async fn response_query_error_fails_open() {
        let fx = fixture(Duration::ZERO);
        let dose = dose_with_caregiver(&fx, None);
        fx.db
            .open()
            .unwrap()
            .execute_batch("DROP TABLE alarm_attempts")
            .unwrap();

        let ran = trigger(&fx).on_caregiver_check(&dose).await;
        assert!(ran, "Query failure must escalate, not suppress");
        assert_eq!(stored_alert_total(&fx.db), 1);
    }

    #[tokio::test]
    async fn reminder_path_restarts_sequence_anchored_at_now() {
        let fx = fixture(Duration::ZERO);
        let mut dose = dose_with_caregiver(&fx, None);
        dose.scheduled_at = Utc::now() - chrono::Duration::hours(2);

        let started = trigger(&fx).on_reminder_delivered(&dose).await;
        assert!(started);

        // Anchored at now, step 2 sits a full interval out; anchored at
        // the stale scheduled instant it would have been floored to 1s.
        let step2 = fx
            .scheduler
            .take(&sequencer::step_identifier(dose.schedule_id, 2))
            .expect("restarted sequence must register step 2");
        assert!(step2.offset >= Duration::from_secs(290));
        assert!(step2.offset <= Duration::from_secs(310));
    }

    #[tokio::test]
    async fn reminder_path_registers_even_when_store_unavailable() {
        let scheduler = Arc::new(InMemoryScheduler::new());
        let t = EscalationTrigger::new(
            DbHandle::new("/nonexistent-alarm-store/alarms.db"),
            scheduler.clone(),
            Arc::new(SlowTransport::new(Duration::ZERO)),
        );
        let dose = DoseEvent::new(Uuid::new_v4(), Uuid::new_v4(), "Levodopa", Utc::now());

        // Taken check fails open and the restarted ladder must still be
        // registered; only the attempt log is skipped.
        let started = t.on_reminder_delivered(&dose).await;
        assert!(started);
        assert!(scheduler
            .take(&sequencer::step_identifier(dose.schedule_id, 2))
            .is_some());
        assert!(scheduler
            .take(&sequencer::step_identifier(dose.schedule_id, 3))
            .is_some());
        assert!(scheduler
            .take(&sequencer::check_identifier(dose.schedule_id))
            .is_some());
    }

    #[tokio::test]
    async fn recent_taken_record_suppresses_reminder_path() {
        let fx = fixture(Duration::ZERO);
        let dose = dose_with_caregiver(&fx, None);
        {
            let conn = fx.db.open().unwrap();
            sequencer::record_dose_taken(&conn, &dose, Utc::now() - chrono::Duration::minutes(2))
                .unwrap();
        }

        let started = trigger(&fx).on_reminder_delivered(&dose).await;
        assert!(!started);
        assert!(fx.scheduler.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_taken_record_does_not_suppress() {
        let fx = fixture(Duration::ZERO);
        let dose = dose_with_caregiver(&fx, None);
        {
            let conn = fx.db.open().unwrap();
            sequencer::record_dose_taken(&conn, &dose, Utc::now() - chrono::Duration::minutes(30))
                .unwrap();
        }

        let started = trigger(&fx).on_reminder_delivered(&dose).await;
        assert!(started);
        assert!(!fx.scheduler.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deferred_check_fires_after_delay() {
        let fx = fixture(Duration::ZERO);
        let dose = dose_with_caregiver(&fx, None);
        let t = trigger(&fx);

        t.arm_deferred_check(dose.clone(), Duration::from_millis(30));
        assert_eq!(stored_alert_total(&fx.db), 0, "Must not fire early");

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(stored_alert_total(&fx.db), 1);
    }

    #[tokio::test]
    async fn platform_wakeup_is_requested_when_available() {
        struct Recorder(AtomicUsize);
        impl PlatformTasks for Recorder {
            fn register_wakeup(&self, _key: &EscalationKey, _delay: Duration) -> bool {
                self.0.fetch_add(1, Ordering::SeqCst);
                true
            }
        }

        let fx = fixture(Duration::ZERO);
        let dose = dose_with_caregiver(&fx, None);
        let recorder = Arc::new(Recorder(AtomicUsize::new(0)));
        let t = trigger(&fx).with_platform(recorder.clone());

        t.arm_deferred_check(dose, Duration::from_secs(600));
        assert_eq!(recorder.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn key_paths_do_not_collide() {
        let dose = DoseEvent::new(Uuid::new_v4(), Uuid::new_v4(), "Levodopa", Utc::now());
        let a = EscalationKey::for_dose(&dose);
        let b = EscalationKey::for_schedule(
            dose.schedule_id,
            &dose.scheduled_at.format("%H:%M").to_string(),
        );
        assert_ne!(a, b);
    }
}
