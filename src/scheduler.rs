use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info};

use crate::config::SchedulerConfig;
use crate::error::ShutdownError;
use crate::events::{Event, EventBus};
use crate::job::{Job, JobId, JobSpec, JobState};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::schedule::StateStore;
use crate::task::ResourcePool;

/// State shared between the scheduler handle and every job loop.
pub(crate) struct Shared {
  pub(crate) events: EventBus,
  /// Number of shutdown-blocking tasks currently executing.
  pub(crate) active_blocking: AtomicUsize,
  pub(crate) config: SchedulerConfig,
  pub(crate) store: Option<Arc<dyn StateStore>>,
  pub(crate) metrics: Metrics,
}

impl Shared {
  /// Semantic event entry point used by job loops: broadcast the raw event
  /// and derive secondary ones. `JobFinished` with no blocking task left
  /// running additionally broadcasts `Drained`, so a shutdown sequence can
  /// wait for the last blocking job without polling.
  pub(crate) fn trigger(&self, event: Event) {
    self.events.broadcast(event);
    if event == Event::JobFinished && self.active_blocking.load(Ordering::SeqCst) == 0 {
      self.events.broadcast(Event::Drained);
    }
  }
}

/// Builder for configuring and creating a [`Scheduler`].
///
/// All parts are optional: the resource pool is only consulted by tasks
/// registered with `requires_resource`, and the state store only by jobs
/// using a stored schedule.
#[derive(Default)]
pub struct SchedulerBuilder {
  config: SchedulerConfig,
  pool: Option<Arc<dyn ResourcePool>>,
  store: Option<Arc<dyn StateStore>>,
}

impl SchedulerBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn config(mut self, config: SchedulerConfig) -> Self {
    self.config = config;
    self
  }

  /// Shared external resource (e.g. a database pool) acquired around runs
  /// of tasks that require it.
  pub fn resource_pool(mut self, pool: Arc<dyn ResourcePool>) -> Self {
    self.pool = Some(pool);
    self
  }

  /// External persistence for stored schedules.
  pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
    self.store = Some(store);
    self
  }

  pub fn build(self) -> Scheduler {
    let metrics = Metrics::new();
    Scheduler {
      shared: Arc::new(Shared {
        events: EventBus::new(),
        active_blocking: AtomicUsize::new(0),
        config: self.config,
        store: self.store,
        metrics: metrics.clone(),
      }),
      pool: self.pool,
      jobs: Mutex::new(Vec::new()),
      admin_lock: tokio::sync::Mutex::new(()),
      metrics,
    }
  }
}

/// Process-wide registry of jobs.
///
/// Constructed once at process start and injected into whatever needs it
/// (the gateway, the shutdown sequence); there is no ambient global
/// instance. Owns the admin lock serializing protocol write critical
/// sections against administrative shutdown, and the event bus used to wake
/// waiters on scheduler-wide state changes.
pub struct Scheduler {
  shared: Arc<Shared>,
  pool: Option<Arc<dyn ResourcePool>>,
  jobs: Mutex<Vec<Arc<Job>>>,
  admin_lock: tokio::sync::Mutex<()>,
  metrics: Metrics,
}

impl Scheduler {
  /// Returns a builder to configure and create a `Scheduler`.
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  /// Construct the job for `spec`, store it, and optionally start its loop.
  /// Returns a handle usable for later queries.
  pub fn register(&self, spec: JobSpec, start: bool) -> JobId {
    let job = Arc::new(Job::new(spec, self.pool.clone()));
    let id = job.id();
    info!(job = %job.task().name(), %id, "job registered");
    self.jobs.lock().push(Arc::clone(&job));
    if start {
      job.start(&self.shared);
    }
    id
  }

  /// Start a registered job's loop. `false` when the id is unknown, the job
  /// has no schedule, or the loop is already running.
  pub fn start(&self, id: JobId) -> bool {
    match self.job(id) {
      Some(job) => job.start(&self.shared),
      None => {
        error!(%id, "cannot start: no such job");
        false
      }
    }
  }

  pub fn job(&self, id: JobId) -> Option<Arc<Job>> {
    self.jobs.lock().iter().find(|j| j.id() == id).cloned()
  }

  /// All registered jobs, in registration order.
  pub fn jobs(&self) -> Vec<Arc<Job>> {
    self.jobs.lock().clone()
  }

  pub fn jobs_in_state(&self, state: JobState) -> Vec<Arc<Job>> {
    self
      .jobs
      .lock()
      .iter()
      .filter(|j| j.state() == state)
      .cloned()
      .collect()
  }

  /// Jobs whose loop is sleeping until its next run.
  pub fn scheduled_count(&self) -> usize {
    self.jobs_in_state(JobState::Scheduled).len()
  }

  /// Jobs whose task is executing right now.
  pub fn running_count(&self) -> usize {
    self.jobs_in_state(JobState::Running).len()
  }

  /// Shutdown-blocking tasks executing right now. Graceful shutdown waits
  /// for this to reach zero.
  pub fn active_count(&self) -> usize {
    self.shared.active_blocking.load(Ordering::SeqCst)
  }

  /// Cooperatively stop every job. Returns without waiting; callers that
  /// need the drain should use [`Scheduler::shutdown`] or block on the
  /// event bus until [`Scheduler::active_count`] reaches zero.
  pub fn stop_all(&self) {
    for job in self.jobs() {
      job.stop();
    }
  }

  /// Kill every job loop unconditionally, even mid-run. For forced
  /// shutdown only.
  pub fn kill_all(&self) {
    for job in self.jobs() {
      job.kill();
    }
  }

  /// Run `critical` while holding the process-wide admin lock, returning
  /// its output. Concurrent callers block until the lock is free.
  ///
  /// This is the primitive that serializes protocol write critical sections
  /// (score submissions) against an administrative shutdown or restart
  /// sequence. Keep critical sections short: local persistence and
  /// validation only, never unbounded network I/O. There is no timeout and
  /// no fairness guarantee; standard mutex semantics apply.
  pub async fn with_lock<F, Fut, T>(&self, critical: F) -> T
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
  {
    let _guard = self.admin_lock.lock().await;
    critical().await
  }

  /// Subscribe to `event`. Subscribe before checking the state you are
  /// waiting on, then await the receiver.
  pub fn listen(&self, event: Event) -> broadcast::Receiver<()> {
    self.shared.events.listen(event)
  }

  /// Wake all current listeners of `event`.
  pub fn broadcast(&self, event: Event) {
    self.shared.events.broadcast(event);
  }

  /// Broadcast `event` and any derived events (see [`Event::Drained`]).
  pub fn trigger(&self, event: Event) {
    self.shared.trigger(event);
  }

  /// Shut the scheduler down.
  ///
  /// Graceful (`force == false`): logs the names of currently-active
  /// blocking jobs, stops every job cooperatively, then blocks on the event
  /// bus until no blocking task remains in flight. Forced: kills every loop
  /// and returns immediately, regardless of in-flight tasks.
  pub async fn shutdown(&self, force: bool) -> Result<(), ShutdownError> {
    if force {
      info!("forced shutdown: killing all job loops");
      self.kill_all();
      return Ok(());
    }
    let blocking: Vec<String> = self
      .jobs()
      .iter()
      .filter(|j| j.task().is_active() && j.task().blocks_shutdown())
      .map(|j| j.task().name().to_string())
      .collect();
    if blocking.is_empty() {
      info!("graceful shutdown: no blocking job active");
    } else {
      info!(jobs = ?blocking, "graceful shutdown: waiting for active jobs to finish");
    }
    self.stop_all();
    loop {
      let mut drained = self.shared.events.listen(Event::Drained);
      if self.active_count() == 0 {
        break;
      }
      match drained.recv().await {
        Ok(()) | Err(RecvError::Lagged(_)) => continue,
        Err(RecvError::Closed) => return Err(ShutdownError::DrainSignalLost),
      }
    }
    info!("graceful shutdown complete");
    Ok(())
  }

  /// Rows for the operator status table, ordered by state priority
  /// (running first), then next run time, then run count, then name.
  pub fn diagnostics(&self) -> Vec<JobDiagnostics> {
    let mut rows: Vec<JobDiagnostics> = self
      .jobs()
      .iter()
      .map(|job| JobDiagnostics {
        name: job.task().name().to_string(),
        state: job.state(),
        run_count: job.run_count(),
        last_run: job.last_success(),
        next_run: job.next_run_time(),
      })
      .collect();
    rows.sort_by(|a, b| {
      (a.state.priority(), a.next_run.is_none(), a.next_run, a.run_count, &a.name).cmp(&(
        b.state.priority(),
        b.next_run.is_none(),
        b.next_run,
        b.run_count,
        &b.name,
      ))
    });
    rows
  }

  /// Point-in-time counters for scheduler and gateway activity.
  pub fn metrics(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }

  pub(crate) fn metrics_handle(&self) -> Metrics {
    self.metrics.clone()
  }
}

impl std::fmt::Debug for Scheduler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Scheduler")
      .field("jobs", &self.jobs.lock().len())
      .field("active_blocking", &self.active_count())
      .finish()
  }
}

/// One row of the operator-facing status table. Rendering is the caller's
/// concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDiagnostics {
  pub name: String,
  pub state: JobState,
  pub run_count: u64,
  pub last_run: Option<DateTime<Utc>>,
  pub next_run: Option<DateTime<Utc>>,
}
