//! scorekeeper: a background job scheduler and leaderboard protocol gateway.
//!
//! Two coupled subsystems share one process:
//!
//! - A [`Scheduler`] running any number of independent background jobs
//!   (interval, one-shot, or continuous), each on its own tokio task, with
//!   graceful and forced shutdown that never loses track of work that must
//!   not be interrupted mid-flight.
//! - A [`Gateway`](gateway::Gateway) serving a legacy leaderboard protocol:
//!   requests for locally-hosted packs are validated and persisted here,
//!   everything else is relayed byte-for-byte to the canonical upstream
//!   server. Score submissions are serialized against administrative
//!   shutdown through the scheduler's admin lock.
//!
//! # Features
//!
//! - Schedule jobs to run:
//!   - Every N seconds after the previous run *completes* ([`Frequency::Every`]).
//!   - Exactly once ([`Frequency::Once`]).
//!   - Continuously, back to back ([`Frequency::Continuous`]).
//! - Schedules that survive restarts: a job can keep its next run time in a
//!   named [`StateStore`](schedule::StateStore) slot; after downtime the
//!   slot is advanced to the next future boundary, skipping (not replaying)
//!   missed runs.
//! - Per-run resource acquisition: tasks that need a shared handle (e.g. a
//!   pooled database connection) acquire and release it around every run,
//!   on every exit path.
//! - Work-closure errors and panics are absorbed per run; a scheduling-loop
//!   error is logged and retried with backoff rather than ending the job.
//! - Graceful shutdown drains in-flight blocking tasks by listening on the
//!   scheduler's event bus; forced shutdown kills every loop immediately.
//! - Queryable state: per-job lifecycle ([`JobState`]), operator
//!   diagnostics rows, and process-wide counters ([`MetricsSnapshot`]).
//!
//! # Usage
//!
//! ```no_run
//! use scorekeeper::{Frequency, JobSpec, Scheduler};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let scheduler = Arc::new(Scheduler::builder().build());
//!
//!     // Recompute rankings every five minutes; let an in-flight run
//!     // finish before a graceful shutdown proceeds.
//!     let mut spec = JobSpec::new(
//!         "update-rankings",
//!         Frequency::Every(Duration::from_secs(300)),
//!         || Box::pin(async {
//!             // ... recompute and persist rankings ...
//!             Ok(())
//!         }),
//!     );
//!     spec.blocks_shutdown(true);
//!     let id = scheduler.register(spec, true);
//!
//!     // ... run until an operator asks for a restart ...
//!     println!("{:?}", scheduler.job(id).map(|j| j.state()));
//!     scheduler.shutdown(false).await?;
//!     Ok(())
//! }
//! ```
//!
//! Serving the protocol additionally needs a
//! [`PackRegistry`](gateway::PackRegistry) and a
//! [`LeaderboardStore`](gateway::LeaderboardStore) implementation; hand them
//! to [`Gateway::new`](gateway::Gateway::new) together with the scheduler
//! and a [`GatewayConfig`](config::GatewayConfig), then
//! [`serve`](gateway::Gateway::serve) on a [`tokio::net::TcpListener`].
//!
//! # Observability
//!
//! All components log through the `tracing` crate. Counters for runs,
//! retries, requests, forwards, and errors are available via
//! [`Scheduler::metrics`].

// Declare modules within the crate
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod job;
mod macros;
pub mod metrics;
pub mod schedule;
pub mod scheduler;
pub mod task;

// --- Public Re-exports ---

// Core scheduler components
pub use scheduler::{JobDiagnostics, Scheduler, SchedulerBuilder};

// Error types
pub use error::{ConfigError, ShutdownError, StoreError};

// Job related types
pub use job::{Frequency, Job, JobId, JobSpec, JobState, NextRun};

// Task related types
pub use task::{BoxedWorkFn, Outcome, ResourcePool, Task};

// Event bus
pub use events::{Event, EventBus};

// Configuration
pub use config::Config;

// Metrics related types
pub use metrics::{Metrics, MetricsSnapshot};
