use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::error::StoreError;
use crate::events::Event;
use crate::metrics::Metrics;
use crate::schedule::align_to_future;
use crate::scheduler::Shared;
use crate::task::{BoxedWorkFn, ResourcePool, Task};

/// Unique handle for a registered job. UUID v4.
pub type JobId = Uuid;

/// How often a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
  /// Run back-to-back with no inter-run delay.
  Continuous,
  /// Run exactly once, then leave the job unscheduled.
  Once,
  /// Run the given duration after the previous run *completes* (not
  /// start-to-start).
  Every(StdDuration),
}

/// Where the next run time comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextRun {
  /// A live clock value, used as-is.
  At(DateTime<Utc>),
  /// A named slot in the external [`StateStore`](crate::schedule::StateStore).
  /// The slot is re-read and corrected past downtime on every cycle, so the
  /// schedule survives process restarts.
  Stored(String),
}

/// Derived lifecycle state of a job. Exactly four states, no others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
  /// Exists, but has no schedule.
  Created,
  /// Scheduled, loop not yet started.
  Ready,
  /// Loop running, sleeping until the next run.
  Scheduled,
  /// Loop running, task currently executing.
  Running,
}

impl JobState {
  /// Sort rank for the operator status table: running first.
  pub(crate) fn priority(self) -> u8 {
    match self {
      JobState::Running => 0,
      JobState::Scheduled => 1,
      JobState::Ready => 2,
      JobState::Created => 3,
    }
  }
}

/// Configuration for a job, passed to
/// [`Scheduler::register`](crate::scheduler::Scheduler::register).
pub struct JobSpec {
  pub(crate) name: String,
  pub(crate) frequency: Frequency,
  pub(crate) next_run: Option<NextRun>,
  pub(crate) requires_resource: bool,
  pub(crate) blocks_shutdown: bool,
  pub(crate) log_lifecycle: bool,
  pub(crate) work: BoxedWorkFn,
}

impl JobSpec {
  /// Create a job spec with the given name, frequency, and work closure.
  ///
  /// Defaults: no initial run time (interval jobs first run one interval
  /// from start), no resource acquisition, does not block shutdown,
  /// lifecycle logging on. An empty name suppresses lifecycle logging.
  pub fn new<F>(name: &str, frequency: Frequency, work: F) -> Self
  where
    F: Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>
      + Send
      + Sync
      + 'static,
  {
    Self {
      name: name.to_string(),
      frequency,
      next_run: None,
      requires_resource: false,
      blocks_shutdown: false,
      log_lifecycle: true,
      work: Box::new(work),
    }
  }

  /// Pin the first run to a specific clock time.
  pub fn with_initial_run_time(&mut self, time: DateTime<Utc>) {
    self.next_run = Some(NextRun::At(time));
  }

  /// Drive the schedule from a named slot in the external state store, so
  /// it survives restarts.
  pub fn with_stored_schedule(&mut self, slot: &str) {
    self.next_run = Some(NextRun::Stored(slot.to_string()));
  }

  /// Acquire the shared resource pool around every run.
  pub fn requires_resource(&mut self, yes: bool) {
    self.requires_resource = yes;
  }

  /// Make graceful shutdown wait for an in-flight run of this job.
  pub fn blocks_shutdown(&mut self, yes: bool) {
    self.blocks_shutdown = yes;
  }

  /// Toggle the per-run start/finish log lines.
  pub fn log_lifecycle(&mut self, yes: bool) {
    self.log_lifecycle = yes;
  }
}

impl fmt::Debug for JobSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobSpec")
      .field("name", &self.name)
      .field("frequency", &self.frequency)
      .field("next_run", &self.next_run)
      .field("requires_resource", &self.requires_resource)
      .field("blocks_shutdown", &self.blocks_shutdown)
      .field("log_lifecycle", &self.log_lifecycle)
      .field("work", &format_args!("BoxedWorkFn"))
      .finish()
  }
}

#[derive(Debug, Clone, Default)]
struct SchedParams {
  frequency: Option<Frequency>,
  next_run: Option<NextRun>,
}

/// A scheduled job: one [`Task`] plus the loop that repeatedly sleeps,
/// runs it, and reschedules.
///
/// The loop runs on its own tokio task. It is unique per job: a second
/// [`Job::start`] while the loop is alive reports an error instead of
/// spawning a second loop.
#[derive(Debug)]
pub struct Job {
  id: JobId,
  task: Task,
  sched: Mutex<SchedParams>,
  run_count: AtomicU64,
  last_success: Mutex<Option<DateTime<Utc>>>,
  /// The concrete time the loop last resolved to sleep until, for the
  /// diagnostics table. Cleared while the task executes.
  resolved_next: Mutex<Option<DateTime<Utc>>>,
  stop_requested: AtomicBool,
  loop_alive: AtomicBool,
  handle: Mutex<Option<JoinHandle<()>>>,
}

impl Job {
  pub(crate) fn new(spec: JobSpec, pool: Option<Arc<dyn ResourcePool>>) -> Self {
    let task = Task::new(
      spec.name,
      spec.requires_resource,
      spec.blocks_shutdown,
      spec.log_lifecycle,
      spec.work,
      pool,
    );
    Self {
      id: Uuid::new_v4(),
      task,
      sched: Mutex::new(SchedParams {
        frequency: Some(spec.frequency),
        next_run: spec.next_run,
      }),
      run_count: AtomicU64::new(0),
      last_success: Mutex::new(None),
      resolved_next: Mutex::new(None),
      stop_requested: AtomicBool::new(false),
      loop_alive: AtomicBool::new(false),
      handle: Mutex::new(None),
    }
  }

  pub fn id(&self) -> JobId {
    self.id
  }

  pub fn task(&self) -> &Task {
    &self.task
  }

  /// Number of successful runs so far.
  pub fn run_count(&self) -> u64 {
    self.run_count.load(Ordering::SeqCst)
  }

  /// Completion time of the most recent successful run.
  pub fn last_success(&self) -> Option<DateTime<Utc>> {
    *self.last_success.lock()
  }

  /// The next resolved run time, when known. Stored schedules only report a
  /// time once the loop has read and corrected the slot.
  pub fn next_run_time(&self) -> Option<DateTime<Utc>> {
    if let Some(t) = *self.resolved_next.lock() {
      return Some(t);
    }
    match self.sched.lock().next_run {
      Some(NextRun::At(t)) => Some(t),
      _ => None,
    }
  }

  pub fn state(&self) -> JobState {
    if self.task.is_active() {
      return JobState::Running;
    }
    if self.loop_alive.load(Ordering::SeqCst) {
      return JobState::Scheduled;
    }
    if self.sched.lock().frequency.is_some() {
      JobState::Ready
    } else {
      JobState::Created
    }
  }

  /// Replace the scheduling parameters. A running loop is untouched; it
  /// picks the new parameters up at its next cycle.
  pub fn reschedule(&self, frequency: Frequency, next_run: Option<NextRun>) {
    let mut sched = self.sched.lock();
    sched.frequency = Some(frequency);
    sched.next_run = next_run;
  }

  /// Clear the scheduling parameters. A loop mid-run is not interrupted; it
  /// exits before starting another cycle.
  pub fn cancel(&self) {
    let mut sched = self.sched.lock();
    sched.frequency = None;
    sched.next_run = None;
    *self.resolved_next.lock() = None;
  }

  /// Spawn the execution loop. Returns `false` (and logs an error) when the
  /// job has no schedule or the loop is already running; there is never a
  /// second loop for the same job. Public entry point:
  /// [`Scheduler::start`](crate::scheduler::Scheduler::start).
  pub(crate) fn start(self: &Arc<Self>, shared: &Arc<Shared>) -> bool {
    if self.sched.lock().frequency.is_none() {
      error!(job = %self.task.name(), "cannot start: job has no schedule");
      return false;
    }
    let mut handle = self.handle.lock();
    if self.loop_alive.swap(true, Ordering::SeqCst) {
      error!(job = %self.task.name(), "cannot start: job loop already running");
      return false;
    }
    self.stop_requested.store(false, Ordering::SeqCst);
    let job = Arc::clone(self);
    let shared = Arc::clone(shared);
    let span = tracing::info_span!("job_loop", job = %self.task.name());
    *handle = Some(tokio::spawn(Job::run_loop(job, shared).instrument(span)));
    true
  }

  /// Cooperative stop. A task mid-run that blocks shutdown is allowed to
  /// finish (the loop exits after the current run); in every other state
  /// this is equivalent to [`Job::kill`].
  pub fn stop(&self) {
    if self.task.is_active() && self.task.blocks_shutdown() {
      info!(job = %self.task.name(), "stop requested; letting the in-flight run finish");
      self.stop_requested.store(true, Ordering::SeqCst);
      return;
    }
    self.kill();
  }

  /// Terminate the loop immediately, even mid-run. Only used for forced
  /// shutdown; an interrupted run may leave its resource slot unreleased.
  pub fn kill(&self) {
    let mut handle = self.handle.lock();
    if let Some(handle) = handle.take() {
      handle.abort();
      debug!(job = %self.task.name(), "job loop killed");
    }
    self.task.force_idle();
    self.loop_alive.store(false, Ordering::SeqCst);
  }

  async fn run_loop(job: Arc<Job>, shared: Arc<Shared>) {
    let spacing = StdDuration::from_millis(shared.config.spacing_ms);
    let floor = StdDuration::from_millis(shared.config.retry_backoff_ms.max(1));
    let ceiling = StdDuration::from_millis(shared.config.retry_backoff_max_ms.max(1));
    let mut backoff = floor;
    loop {
      // Spacing pause: keeps a schedule that resolves to "now" from
      // spinning the loop.
      tokio::time::sleep(spacing).await;
      match Job::iteration(&job, &shared).await {
        Ok(ControlFlow::Continue(())) => backoff = floor,
        Ok(ControlFlow::Break(())) => break,
        Err(e) => {
          // A bookkeeping failure must not silently end the job's
          // schedule: log, back off, retry the iteration.
          Metrics::inc(&shared.metrics.loop_retries);
          error!(job = %job.task.name(), error = %e, "scheduling error; retrying loop");
          tokio::time::sleep(backoff).await;
          backoff = (backoff * 2).min(ceiling);
        }
      }
    }
    // A consumed one-shot schedule leaves the job unscheduled.
    if matches!(job.sched.lock().frequency, Some(Frequency::Once)) {
      job.cancel();
    }
    job.loop_alive.store(false, Ordering::SeqCst);
    debug!(job = %job.task.name(), "job loop finished");
  }

  /// One scheduling cycle: resolve the run time, sleep, run the task, and
  /// reschedule or terminate.
  async fn iteration(job: &Arc<Job>, shared: &Arc<Shared>) -> Result<ControlFlow<()>, StoreError> {
    let params = job.sched.lock().clone();
    let Some(frequency) = params.frequency else {
      // Cancelled while the loop was alive.
      return Ok(ControlFlow::Break(()));
    };

    match params.next_run {
      Some(NextRun::At(time)) => {
        *job.resolved_next.lock() = Some(time);
        sleep_until(time).await;
      }
      Some(NextRun::Stored(slot)) => {
        let store = shared.store.as_ref().ok_or_else(|| {
          StoreError::Backend(anyhow::anyhow!(
            "no state store configured for stored schedule `{slot}`"
          ))
        })?;
        let stored = store.load(&slot).await?;
        let target = match frequency {
          Frequency::Every(every) => {
            let (target, skipped) = align_to_future(stored, chrono_interval(every), Utc::now());
            if skipped > shared.config.missed_runs_warn {
              warn!(job = %job.task.name(), skipped, "schedule far behind; skipping missed runs");
            } else if skipped > 0 {
              debug!(job = %job.task.name(), skipped, "skipping missed runs");
            }
            target
          }
          _ => stored,
        };
        store.save(&slot, target).await?;
        *job.resolved_next.lock() = Some(target);
        sleep_until(target).await;
      }
      None => {
        // No explicit first run: interval jobs wait one interval, one-shot
        // and continuous jobs run immediately.
        if let Frequency::Every(every) = frequency {
          *job.resolved_next.lock() = Some(Utc::now() + chrono_interval(every));
          tokio::time::sleep(every).await;
        }
      }
    }

    // Execute. The guard keeps the active-blocking count correct even when
    // the loop is aborted mid-run.
    *job.resolved_next.lock() = None;
    let guard = job
      .task
      .blocks_shutdown()
      .then(|| ActiveGuard::new(Arc::clone(shared)));
    let outcome = job.task.run().await;
    drop(guard);

    if outcome.is_success() {
      job.run_count.fetch_add(1, Ordering::SeqCst);
      *job.last_success.lock() = Some(Utc::now());
      Metrics::inc(&shared.metrics.runs_succeeded);
    } else {
      Metrics::inc(&shared.metrics.runs_failed);
    }
    // Every completed run wakes shutdown waiters; the bus derives Drained
    // once the active-blocking count reaches zero.
    shared.trigger(Event::JobFinished);

    if job.stop_requested.load(Ordering::SeqCst) || frequency == Frequency::Once {
      return Ok(ControlFlow::Break(()));
    }
    {
      let mut sched = job.sched.lock();
      match frequency {
        // The next run is one interval after this run *completed*. Stored
        // slots instead re-resolve from the store at the top of the next
        // cycle.
        Frequency::Every(every) => {
          if !matches!(sched.next_run, Some(NextRun::Stored(_))) {
            sched.next_run = Some(NextRun::At(Utc::now() + chrono_interval(every)));
          }
        }
        Frequency::Continuous => sched.next_run = None,
        Frequency::Once => {}
      }
    }
    Ok(ControlFlow::Continue(()))
  }
}

/// RAII increment of the scheduler-wide active-blocking count. Dropping the
/// guard (including via loop abort) restores the count.
struct ActiveGuard {
  shared: Arc<Shared>,
}

impl ActiveGuard {
  fn new(shared: Arc<Shared>) -> Self {
    shared
      .active_blocking
      .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    Self { shared }
  }
}

impl Drop for ActiveGuard {
  fn drop(&mut self) {
    self
      .shared
      .active_blocking
      .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
  }
}

async fn sleep_until(target: DateTime<Utc>) {
  let delay = (target - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
  if delay > StdDuration::ZERO {
    tokio::time::sleep(delay).await;
  }
}

fn chrono_interval(every: StdDuration) -> ChronoDuration {
  ChronoDuration::from_std(every).unwrap_or(ChronoDuration::MAX)
}
