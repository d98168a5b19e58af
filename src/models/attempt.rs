use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A logged escalation step for one dose event.
///
/// Ordinals for the same dose event are strictly increasing (1, 2, 3)
/// and each is logged at most once — enforced by a UNIQUE constraint on
/// `(schedule_id, scheduled_at, attempt)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmAttempt {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub schedule_id: Uuid,
    pub medication_name: String,
    pub scheduled_at: DateTime<Utc>,
    pub attempt: u8,
    pub sent_at: DateTime<Utc>,
    pub patient_responded: bool,
    pub responded_at: Option<DateTime<Utc>>,
    pub caregiver_alerted: bool,
    pub caregiver_alerted_at: Option<DateTime<Utc>>,
}
