use std::time::Duration as StdDuration;

use chrono::Duration;

/// The configuration of the queue scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Spacing between consecutive sort keys, leaving room to insert entries
    /// between neighbors without renumbering
    pub sort_key_gap: f64,
    /// How long an entry may stay playing before self-healing assumes the
    /// display client vanished and force-completes it
    pub stale_playback_in_seconds: u64,
    /// How long a quiet room keeps its slot in the lock registry
    pub lock_idle_in_seconds: u64,
}

impl SchedulerConfig {
    /// The stale playback bound as a chrono duration
    pub fn stale_playback(&self) -> Duration {
        Duration::seconds(self.stale_playback_in_seconds as i64)
    }

    /// The lock eviction bound as a std duration
    pub fn lock_idle(&self) -> StdDuration {
        StdDuration::from_secs(self.lock_idle_in_seconds)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sort_key_gap: 1000.0,
            // No performance runs this long, the display client is gone
            stale_playback_in_seconds: 60 * 60 * 2,
            lock_idle_in_seconds: 60 * 60,
        }
    }
}
