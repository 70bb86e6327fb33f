//! tests/schedule.rs
//! Persisted-schedule catch-up arithmetic and slot write-back.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use common::{setup_tracing, work_counter, MemoryStateStore};
use scorekeeper::schedule::align_to_future;
use scorekeeper::{Frequency, JobSpec, Scheduler};

#[test]
fn catch_up_skips_missed_runs_without_replaying_them() {
  let now = Utc::now();
  let every = Duration::minutes(10);
  // Three and a half intervals behind: three boundaries were missed.
  let stale = now - Duration::minutes(35);

  let (corrected, skipped) = align_to_future(stale, every, now);
  assert_eq!(skipped, 3);
  assert_eq!(corrected, stale + Duration::minutes(40));
  assert!(corrected > now);
  assert!(corrected - now <= every, "first boundary strictly after now");
}

#[test]
fn in_phase_future_time_is_left_alone() {
  let now = Utc::now();
  let every = Duration::minutes(10);
  let upcoming = now + Duration::minutes(4);

  let (corrected, skipped) = align_to_future(upcoming, every, now);
  assert_eq!(corrected, upcoming);
  assert_eq!(skipped, 0);
}

#[test]
fn far_future_time_is_pulled_back_into_phase() {
  let now = Utc::now();
  let every = Duration::minutes(10);
  let overshot = now + Duration::minutes(27);

  let (corrected, skipped) = align_to_future(overshot, every, now);
  assert_eq!(corrected, now + Duration::minutes(7));
  assert_eq!(skipped, 0);
}

#[test]
fn boundary_exactly_now_moves_one_interval_forward() {
  let now = Utc::now();
  let every = Duration::minutes(10);

  let (corrected, skipped) = align_to_future(now, every, now);
  assert_eq!(corrected, now + every);
  assert_eq!(skipped, 0);
}

#[test]
fn zero_interval_is_a_no_op() {
  let now = Utc::now();
  let (corrected, skipped) = align_to_future(now - Duration::minutes(5), Duration::zero(), now);
  assert_eq!(corrected, now - Duration::minutes(5));
  assert_eq!(skipped, 0);
}

#[tokio::test]
async fn stored_slot_is_corrected_and_written_back_before_the_run() {
  setup_tracing();
  let store = Arc::new(MemoryStateStore::default());
  let scheduler = Scheduler::builder()
    .config(common::test_scheduler_config())
    .state_store(store.clone())
    .build();
  let counter = Arc::new(AtomicUsize::new(0));

  // Two whole intervals missed: the job must fire once at the next
  // boundary, not three times.
  let every = StdDuration::from_millis(300);
  let stale = Utc::now() - Duration::milliseconds(650);
  store.seed("report-next-run", stale);

  let mut spec = JobSpec::new(
    "report",
    Frequency::Every(every),
    work_counter(counter.clone(), StdDuration::ZERO, true),
  );
  spec.with_stored_schedule("report-next-run");
  scheduler.register(spec, true);

  // The corrected value lands in the store before the first fire.
  tokio::time::sleep(StdDuration::from_millis(150)).await;
  let written = store.get("report-next-run").expect("slot written back");
  assert!(written > stale, "slot advanced past the stale value");
  let phase = (written - stale).num_milliseconds() % 300;
  assert_eq!(phase, 0, "correction moved by whole intervals");
  assert_eq!(counter.load(Ordering::SeqCst), 0, "not yet due");

  tokio::time::sleep(StdDuration::from_millis(300)).await;
  assert_eq!(
    counter.load(Ordering::SeqCst),
    1,
    "missed runs are skipped, not replayed"
  );
  scheduler.shutdown(true).await.expect("forced shutdown");
}
