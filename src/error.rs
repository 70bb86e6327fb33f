use thiserror::Error;

/// Errors raised while loading or validating the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("failed to read configuration: {0}")]
  Read(#[from] figment::Error),
  #[error("invalid bind address `{0}`")]
  InvalidBind(String),
}

/// Errors surfaced by a [`StateStore`](crate::schedule::StateStore) backend.
///
/// The scheduler never propagates these to callers; a failing store is a
/// loop-bookkeeping error, logged and retried with backoff by the job loop.
#[derive(Error, Debug)]
pub enum StoreError {
  #[error("state store backend error: {0}")]
  Backend(#[from] anyhow::Error),
  #[error("no persisted value under slot `{0}`")]
  MissingSlot(String),
}

/// Errors related to the scheduler shutdown sequence.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("event bus closed while waiting for active jobs to drain")]
  DrainSignalLost,
}
