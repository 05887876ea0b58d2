//! Staleness measurement for active workflows.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Idle time after which a running workflow is considered stale.
pub const WORKFLOW_STALE_THRESHOLD: Duration = Duration::from_secs(10 * 60);

/// Idle time after which a running batch workflow is considered stale.
pub const BATCH_STALE_THRESHOLD: Duration = Duration::from_secs(15 * 60);

/// Time elapsed since `last_activity`, clamped at zero for clock skew.
pub fn stale_for(now: DateTime<Utc>, last_activity: DateTime<Utc>) -> Duration {
    (now - last_activity).to_std().unwrap_or(Duration::ZERO)
}

/// True when the idle time is strictly beyond `threshold`.
pub fn is_stale(now: DateTime<Utc>, last_activity: DateTime<Utc>, threshold: Duration) -> bool {
    stale_for(now, last_activity) > threshold
}
