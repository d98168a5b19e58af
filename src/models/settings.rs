use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user's push delivery target plus alert preferences.
///
/// The push token may be absent (device never registered) or a
/// development placeholder — both are handled by the alert pipeline,
/// not treated as errors. The alert pipeline only reads this; the one
/// write path is the initialization helper on `AlarmService`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub user_id: Uuid,
    pub push_token: Option<String>,
    pub sound_enabled: bool,
    pub vibration_enabled: bool,
    pub reminder_interval_min: u32,
    pub caregiver_delay_min: u32,
    pub updated_at: DateTime<Utc>,
}

impl NotificationSettings {
    /// Defaults for a user who has never configured anything.
    pub fn defaults(user_id: Uuid) -> Self {
        Self {
            user_id,
            push_token: None,
            sound_enabled: true,
            vibration_enabled: true,
            reminder_interval_min: 5,
            caregiver_delay_min: 15,
            updated_at: Utc::now(),
        }
    }
}
