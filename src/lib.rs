//! Dosewatch — medication alarm escalation engine.
//!
//! When a scheduled dose goes unacknowledged, the engine walks a fixed
//! three-step reminder ladder on the patient's device, then decides
//! whether the connected caregivers must be alerted. Caregiver alerts
//! go out over push when a relay confirms delivery, and land in a
//! store-backed fallback queue otherwise; a poller on the caregiver's
//! device drains that queue into immediate local notifications.
//!
//! Entry point is [`service::AlarmService`], wired with a store handle,
//! a platform [`scheduler::LocalScheduler`], and a
//! [`transport::PushTransport`].

pub mod config; // Timing constants, paths, log filter defaults
pub mod db; // SQLite store handle and migrations
pub mod escalation; // Escalation trigger, dedup lock, deferred checks
pub mod models; // Domain records shared across modules
pub mod pipeline; // Caregiver alert pipeline (push + fallback)
pub mod poller; // Caregiver-side stored-alert poller
pub mod scheduler; // Local notification scheduler boundary
pub mod sequencer; // Three-step alarm sequencer and attempt log
pub mod service; // Composition root the host application holds
pub mod transport; // Push relay client and delivery confirmation
pub mod ttl_set; // Expiring key set backing the escalation lock

use tracing_subscriber::EnvFilter;

/// Initialize tracing for binaries and integration harnesses.
/// `RUST_LOG` overrides the crate-level default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
