use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Scheduler-wide events.
///
/// Events carry no payload; the bus provides point-in-time wake-up semantics
/// only, with no persistent queue. A subscriber that was not listening when
/// an event fired does not see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
  /// A job's task finished a run.
  JobFinished,
  /// The count of active shutdown-blocking tasks reached zero.
  Drained,
}

/// Broadcast bus used to wake tasks waiting on scheduler-wide state changes.
///
/// Subscribe with [`EventBus::listen`] *before* checking the state you are
/// waiting on, then await the receiver; this ordering closes the window in
/// which a broadcast could be missed.
#[derive(Debug, Default)]
pub struct EventBus {
  channels: Mutex<HashMap<Event, broadcast::Sender<()>>>,
}

impl EventBus {
  pub fn new() -> Self {
    Self::default()
  }

  fn sender(&self, event: Event) -> broadcast::Sender<()> {
    self
      .channels
      .lock()
      .entry(event)
      .or_insert_with(|| broadcast::channel(16).0)
      .clone()
  }

  /// Register interest in `event`. The returned receiver resolves once per
  /// subsequent broadcast of that event.
  pub fn listen(&self, event: Event) -> broadcast::Receiver<()> {
    self.sender(event).subscribe()
  }

  /// Wake every current listener of `event`. A broadcast with no listeners
  /// is a no-op, not an error.
  pub fn broadcast(&self, event: Event) {
    let _ = self.sender(event).send(());
  }
}
