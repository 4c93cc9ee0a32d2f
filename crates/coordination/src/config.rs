//! Coordinator tuning

use std::time::Duration;

use huddle_shared::HuddleError;

/// Default sweep cadence (5 minutes)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
/// Default presence idle timeout (30 minutes)
pub const DEFAULT_PRESENCE_STALENESS: Duration = Duration::from_secs(30 * 60);
/// Default lease TTL (5 minutes)
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);
/// Upper bound on a requested lease TTL (1 hour)
pub const DEFAULT_MAX_LOCK_TTL: Duration = Duration::from_secs(3600);
/// Ceiling for every configured duration and lease TTL (30 days). Larger
/// values are clamped where they are used, so deadline arithmetic stays in
/// range of the clock.
pub const MAX_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Timeouts and cadences for the coordination core. Each value is capped at
/// [`MAX_DURATION`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// How often the sweeper runs
    pub sweep_interval: Duration,
    /// Idle time after which a presence entry (or orphan cursor) is evicted
    pub presence_staleness: Duration,
    /// TTL used when an acquire names none
    pub default_lock_ttl: Duration,
    /// Requested TTLs above this are clamped
    pub max_lock_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            presence_staleness: DEFAULT_PRESENCE_STALENESS,
            default_lock_ttl: DEFAULT_LOCK_TTL,
            max_lock_ttl: DEFAULT_MAX_LOCK_TTL,
        }
    }
}

impl CoordinatorConfig {
    /// Resolve the TTL for an acquire request
    pub fn lock_ttl(&self, requested_secs: Option<u64>) -> Result<Duration, HuddleError> {
        match requested_secs {
            None => Ok(self.default_lock_ttl.min(MAX_DURATION)),
            Some(0) => Err(HuddleError::InvalidTtl(
                "ttl_seconds must be greater than zero".to_string(),
            )),
            Some(secs) => Ok(Duration::from_secs(secs).min(self.max_lock_ttl).min(MAX_DURATION)),
        }
    }
}
