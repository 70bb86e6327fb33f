use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Internal counters shared between the scheduler, job loops, and the
/// gateway. Cloning only clones the `Arc`s.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
  /// Task runs that completed successfully.
  pub runs_succeeded: Arc<AtomicUsize>,
  /// Task runs that failed or panicked.
  pub runs_failed: Arc<AtomicUsize>,
  /// Loop-bookkeeping errors that triggered a retry with backoff.
  pub loop_retries: Arc<AtomicUsize>,
  /// Requests received by the gateway.
  pub http_requests: Arc<AtomicUsize>,
  /// Requests relayed to the canonical upstream server.
  pub http_forwards: Arc<AtomicUsize>,
  /// Requests that failed to parse or whose handler errored.
  pub http_errors: Arc<AtomicUsize>,
}

impl Metrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn inc(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  /// Point-in-time copy of all counters.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;
    MetricsSnapshot {
      runs_succeeded: self.runs_succeeded.load(order),
      runs_failed: self.runs_failed.load(order),
      loop_retries: self.loop_retries.load(order),
      http_requests: self.http_requests.load(order),
      http_forwards: self.http_forwards.load(order),
      http_errors: self.http_errors.load(order),
    }
  }
}

/// A snapshot of the counters at a specific point in time. Plain data,
/// cheap to clone and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
  pub runs_succeeded: usize,
  pub runs_failed: usize,
  pub loop_retries: usize,
  pub http_requests: usize,
  pub http_forwards: usize,
  pub http_errors: usize,
}
