use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{error, info};

/// The function type a task executes on every run.
///
/// The closure is called once per scheduled run and must produce a fresh
/// future each time. Returning `Err` marks the run as failed; the error is
/// logged and absorbed, never reaching the job loop. Panics are caught and
/// treated the same way.
pub type BoxedWorkFn = Box<
  dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>
    + Send
    + Sync
    + 'static,
>;

/// A shared external resource (typically a pooled database handle) that a
/// task must hold for the duration of a run.
///
/// `acquire` and `release` are always called in balanced pairs by
/// [`Task::run`], including when the work closure fails or panics, so a
/// misbehaving task can never leak a pool slot.
#[async_trait]
pub trait ResourcePool: Send + Sync {
  async fn acquire(&self);
  async fn release(&self);
}

/// The result of a single task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  Success,
  Failure,
}

impl Outcome {
  pub fn is_success(&self) -> bool {
    matches!(self, Outcome::Success)
  }
}

/// A named, retryable unit of work, created once per job and reused across
/// all of that job's runs.
///
/// The `active` flag is true strictly while the work closure is executing:
/// false at creation, false again after every run, success or failure.
pub struct Task {
  name: String,
  requires_resource: bool,
  blocks_shutdown: bool,
  log_lifecycle: bool,
  work: BoxedWorkFn,
  pool: Option<Arc<dyn ResourcePool>>,
  active: AtomicBool,
  last_outcome: Mutex<Option<Outcome>>,
}

impl Task {
  pub(crate) fn new(
    name: String,
    requires_resource: bool,
    blocks_shutdown: bool,
    log_lifecycle: bool,
    work: BoxedWorkFn,
    pool: Option<Arc<dyn ResourcePool>>,
  ) -> Self {
    Self {
      name,
      requires_resource,
      blocks_shutdown,
      log_lifecycle,
      work,
      pool,
      active: AtomicBool::new(false),
      last_outcome: Mutex::new(None),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// True while the work closure is executing.
  pub fn is_active(&self) -> bool {
    self.active.load(Ordering::SeqCst)
  }

  /// Whether a graceful shutdown must wait for this task to finish a run
  /// already in flight.
  pub fn blocks_shutdown(&self) -> bool {
    self.blocks_shutdown
  }

  /// The outcome of the most recent run, if any run has completed.
  pub fn last_outcome(&self) -> Option<Outcome> {
    *self.last_outcome.lock()
  }

  // A killed loop cannot clear the flag itself; the kill path does it.
  pub(crate) fn force_idle(&self) {
    self.active.store(false, Ordering::SeqCst);
  }

  // An empty name suppresses lifecycle logging regardless of the flag.
  fn should_log(&self) -> bool {
    self.log_lifecycle && !self.name.is_empty()
  }

  /// Execute the work closure exactly once.
  ///
  /// Acquires the resource pool (if configured), marks the task active,
  /// runs the closure, converts any error or panic into a
  /// [`Outcome::Failure`], marks the task inactive, and releases the pool
  /// unconditionally, on every exit path.
  pub async fn run(&self) -> Outcome {
    let pool = if self.requires_resource {
      self.pool.as_deref()
    } else {
      None
    };
    if let Some(pool) = pool {
      pool.acquire().await;
    }
    self.active.store(true, Ordering::SeqCst);
    if self.should_log() {
      info!(task = %self.name, "task starting");
    }

    let result = AssertUnwindSafe((self.work)()).catch_unwind().await;

    let outcome = match result {
      Ok(Ok(())) => {
        if self.should_log() {
          info!(task = %self.name, "task finished");
        }
        Outcome::Success
      }
      Ok(Err(e)) => {
        error!(task = %self.name, error = %e, "task failed");
        Outcome::Failure
      }
      Err(panic) => {
        error!(task = %self.name, "task panicked: {}", panic_message(panic.as_ref()));
        Outcome::Failure
      }
    };

    self.active.store(false, Ordering::SeqCst);
    if let Some(pool) = pool {
      pool.release().await;
    }
    *self.last_outcome.lock() = Some(outcome);
    outcome
  }
}

impl std::fmt::Debug for Task {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Task")
      .field("name", &self.name)
      .field("requires_resource", &self.requires_resource)
      .field("blocks_shutdown", &self.blocks_shutdown)
      .field("log_lifecycle", &self.log_lifecycle)
      .field("work", &format_args!("BoxedWorkFn"))
      .field("active", &self.is_active())
      .field("last_outcome", &self.last_outcome())
      .finish()
  }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s
  } else {
    "non-string panic payload"
  }
}
