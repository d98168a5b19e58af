use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One scheduled administration instance of a medication.
///
/// Created implicitly each time a dose becomes due; superseded by the
/// next scheduled instance rather than deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoseEvent {
    pub patient_id: Uuid,
    pub schedule_id: Uuid,
    pub medication_name: String,
    pub scheduled_at: DateTime<Utc>,
    pub taken: bool,
    pub responded_at: Option<DateTime<Utc>>,
}

impl DoseEvent {
    pub fn new(
        patient_id: Uuid,
        schedule_id: Uuid,
        medication_name: impl Into<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            patient_id,
            schedule_id,
            medication_name: medication_name.into(),
            scheduled_at,
            taken: false,
            responded_at: None,
        }
    }
}
