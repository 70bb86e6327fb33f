use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::StoreError;

/// External persistence for named next-run slots.
///
/// A job scheduled with [`NextRun::Stored`](crate::job::NextRun) keeps its
/// next run time in a named slot here instead of in memory, so the schedule
/// survives process restarts. The scheduler reads the slot at the top of
/// every cycle, corrects it forward past any downtime, and writes the
/// corrected value back before sleeping.
#[async_trait]
pub trait StateStore: Send + Sync {
  async fn load(&self, slot: &str) -> Result<DateTime<Utc>, StoreError>;
  async fn save(&self, slot: &str, time: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Align a persisted run time onto the first schedule boundary strictly
/// after `now`, keeping its phase.
///
/// A value left in the past by downtime is advanced by whole multiples of
/// `every`; the runs that were missed are skipped, never replayed. A value
/// somehow dated more than one interval into the future is pulled back to
/// the nearest future boundary with the same phase.
///
/// Returns the corrected time and the number of whole intervals skipped.
pub fn align_to_future(
  time: DateTime<Utc>,
  every: Duration,
  now: DateTime<Utc>,
) -> (DateTime<Utc>, u32) {
  let every_ms = every.num_milliseconds();
  if every_ms <= 0 {
    return (time, 0);
  }
  let behind_ms = (now - time).num_milliseconds();
  // Steps to the first boundary > now; zero or negative when `time` is
  // already in the future, which pulls it back into phase.
  let steps = behind_ms.div_euclid(every_ms) + 1;
  let corrected = time + Duration::milliseconds(steps * every_ms);
  let skipped = (steps - 1).max(0) as u32;
  (corrected, skipped)
}
