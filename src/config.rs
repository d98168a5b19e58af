use std::path::PathBuf;
use std::time::Duration;

/// Application-level constants
pub const APP_NAME: &str = "Dosewatch";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Spacing between reminder steps in a normal escalation sequence.
pub const REMINDER_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Delay from the dose's anchor instant to the caregiver check.
pub const CAREGIVER_CHECK_DELAY: Duration = Duration::from_secs(15 * 60);

/// Trailing window in which a "taken" record suppresses escalation.
pub const TAKEN_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Safety expiry for escalation dedup keys. An escalation key is dropped
/// after this long even if the holder never cleaned up.
pub const ESCALATION_LOCK_TTL: Duration = Duration::from_secs(2 * 60);

/// Interval between stored-alert poll ticks on a caregiver device.
pub const ALERT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Minimum relative offset handed to the local scheduler. The underlying
/// primitive rejects non-positive offsets.
pub const MIN_SCHEDULE_OFFSET: Duration = Duration::from_secs(1);

/// Default log filter when RUST_LOG is unset.
pub fn default_log_filter() -> String {
    format!("{}=info", env!("CARGO_PKG_NAME"))
}

/// Get the application data directory (~/Dosewatch/ on all platforms).
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join("Dosewatch")
}

/// Default path for the alarm store database.
pub fn default_db_path() -> PathBuf {
    app_data_dir().join("alarms.db")
}
