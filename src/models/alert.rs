use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A durable fallback alert, written when push delivery could not be
/// confirmed and picked up by the caregiver's poller.
///
/// Never redelivered once `acknowledged` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAlert {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub caregiver_id: Uuid,
    /// Intentionally None on fallback rows to sidestep any cross-table
    /// reference constraint on the schedule.
    pub schedule_id: Option<Uuid>,
    /// Nullable in storage: rows written by older app versions carry no
    /// kind at all, and the poller must still pick them up.
    pub kind: Option<AlertKind>,
    pub message: String,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Missed-dose escalation delivered via the local fallback store.
    MissedDoseLocalFallback,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissedDoseLocalFallback => "missed_dose_local_fallback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "missed_dose_local_fallback" => Some(Self::MissedDoseLocalFallback),
            _ => None,
        }
    }
}
