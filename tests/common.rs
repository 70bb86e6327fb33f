//! tests/common.rs
//! Shared helper functions and in-memory collaborator fakes.

#![allow(dead_code)] // not every test file uses every helper

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use axum::body::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing_subscriber::fmt::TestWriter;

use scorekeeper::config::{GatewayConfig, SchedulerConfig};
use scorekeeper::error::StoreError;
use scorekeeper::gateway::{Gateway, LeaderboardStore, PackInfo, PackRegistry, QueryMap};
use scorekeeper::schedule::StateStore;
use scorekeeper::task::{BoxedWorkFn, ResourcePool};
use scorekeeper::Scheduler;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// Scheduler config tightened for tests: short spacing and backoff so loops
// react within milliseconds instead of the production defaults.
pub fn test_scheduler_config() -> SchedulerConfig {
  SchedulerConfig {
    spacing_ms: 10,
    retry_backoff_ms: 30,
    retry_backoff_max_ms: 200,
    missed_runs_warn: 24,
  }
}

pub fn build_scheduler() -> Scheduler {
  Scheduler::builder().config(test_scheduler_config()).build()
}

// Creates a work closure that increments a counter, optionally delays, and
// returns a specific success/failure result.
pub fn work_counter(
  counter: Arc<AtomicUsize>,
  delay: StdDuration,
  succeeds: bool,
) -> BoxedWorkFn {
  Box::new(move || {
    let ctr = counter.clone();
    Box::pin(async move {
      let count = ctr.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!("counter work executing (count: {count}, will succeed: {succeeds})");
      if delay > StdDuration::ZERO {
        tokio::time::sleep(delay).await;
      }
      if succeeds {
        Ok(())
      } else {
        Err(anyhow::anyhow!("forced failure"))
      }
    })
  })
}

// Creates a work closure that sets a flag when it completes.
pub fn work_flag(flag: Arc<AtomicBool>, delay: StdDuration) -> BoxedWorkFn {
  Box::new(move || {
    let flg = flag.clone();
    Box::pin(async move {
      if delay > StdDuration::ZERO {
        tokio::time::sleep(delay).await;
      }
      flg.store(true, Ordering::SeqCst);
      Ok(())
    })
  })
}

// Creates a work closure that panics.
pub fn work_panic() -> BoxedWorkFn {
  Box::new(move || {
    Box::pin(async move {
      tokio::task::yield_now().await;
      panic!("work forced panic!");
      #[allow(unreachable_code)]
      Ok(())
    })
  })
}

/// Resource pool fake counting acquire/release pairs.
#[derive(Debug, Default)]
pub struct CountingPool {
  pub acquires: AtomicUsize,
  pub releases: AtomicUsize,
}

#[async_trait]
impl ResourcePool for CountingPool {
  async fn acquire(&self) {
    self.acquires.fetch_add(1, Ordering::SeqCst);
  }
  async fn release(&self) {
    self.releases.fetch_add(1, Ordering::SeqCst);
  }
}

impl CountingPool {
  pub fn held(&self) -> usize {
    self.acquires.load(Ordering::SeqCst) - self.releases.load(Ordering::SeqCst)
  }
}

/// In-memory state store with a failure switch for loop-retry tests.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
  slots: Mutex<HashMap<String, DateTime<Utc>>>,
  fail: AtomicBool,
}

impl MemoryStateStore {
  pub fn seed(&self, slot: &str, time: DateTime<Utc>) {
    self.slots.lock().insert(slot.to_string(), time);
  }

  pub fn get(&self, slot: &str) -> Option<DateTime<Utc>> {
    self.slots.lock().get(slot).copied()
  }

  pub fn set_failing(&self, failing: bool) {
    self.fail.store(failing, Ordering::SeqCst);
  }
}

#[async_trait]
impl StateStore for MemoryStateStore {
  async fn load(&self, slot: &str) -> Result<DateTime<Utc>, StoreError> {
    if self.fail.load(Ordering::SeqCst) {
      return Err(StoreError::Backend(anyhow::anyhow!("store offline")));
    }
    self
      .slots
      .lock()
      .get(slot)
      .copied()
      .ok_or_else(|| StoreError::MissingSlot(slot.to_string()))
  }

  async fn save(&self, slot: &str, time: DateTime<Utc>) -> Result<(), StoreError> {
    if self.fail.load(Ordering::SeqCst) {
      return Err(StoreError::Backend(anyhow::anyhow!("store offline")));
    }
    self.slots.lock().insert(slot.to_string(), time);
    Ok(())
  }
}

/// Pack registry fake, togglable at runtime.
#[derive(Debug, Default)]
pub struct MemoryPacks {
  packs: Mutex<HashMap<String, PackInfo>>,
}

impl MemoryPacks {
  pub fn set(&self, code: &str, enabled: bool, local: bool) {
    self
      .packs
      .lock()
      .insert(code.to_string(), PackInfo { enabled, local });
  }
}

impl PackRegistry for MemoryPacks {
  fn resolve(&self, code: &str) -> Option<PackInfo> {
    self.packs.lock().get(code).copied()
  }
}

/// Leaderboard store fake: canned responses, call recording, and a
/// configurable submit delay for concurrency tests.
#[derive(Debug, Default)]
pub struct MemoryBoards {
  pub calls: Mutex<Vec<String>>,
  pub submit_delay: Mutex<StdDuration>,
  pub submissions: AtomicUsize,
  /// When set, every handler reports "no body".
  pub empty: AtomicBool,
  /// When set, every handler errors.
  pub broken: AtomicBool,
}

impl MemoryBoards {
  fn record(&self, call: String) -> anyhow::Result<()> {
    self.calls.lock().push(call);
    if self.broken.load(Ordering::SeqCst) {
      return Err(anyhow::anyhow!("backing store exploded"));
    }
    Ok(())
  }

  fn canned(&self, body: String) -> Option<Bytes> {
    if self.empty.load(Ordering::SeqCst) {
      None
    } else {
      Some(Bytes::from(body))
    }
  }
}

#[async_trait]
impl LeaderboardStore for MemoryBoards {
  async fn scores(&self, pack: &str, _query: &QueryMap) -> anyhow::Result<Option<Bytes>> {
    self.record(format!("scores:{pack}"))?;
    Ok(self.canned(format!("scores for {pack}")))
  }

  async fn replay(&self, pack: &str, query: &QueryMap) -> anyhow::Result<Option<Bytes>> {
    let replay_id = query.get("replay_id").cloned().unwrap_or_default();
    self.record(format!("replay:{pack}:{replay_id}"))?;
    Ok(self.canned(format!("replay {replay_id}")))
  }

  async fn search(&self, pack: &str, _query: &QueryMap) -> anyhow::Result<Option<Bytes>> {
    self.record(format!("search:{pack}"))?;
    Ok(self.canned(format!("search results for {pack}")))
  }

  async fn submit_score(
    &self,
    pack: &str,
    _query: &QueryMap,
    body: &Bytes,
  ) -> anyhow::Result<Option<Bytes>> {
    self.record(format!("submit:{pack}:{}", body.len()))?;
    let delay = *self.submit_delay.lock();
    if delay > StdDuration::ZERO {
      tokio::time::sleep(delay).await;
    }
    self.submissions.fetch_add(1, Ordering::SeqCst);
    Ok(self.canned(format!("submitted to {pack}")))
  }

  async fn login(
    &self,
    pack: &str,
    _query: &QueryMap,
    body: &Bytes,
  ) -> anyhow::Result<Option<Bytes>> {
    self.record(format!("login:{pack}:{}", body.len()))?;
    Ok(self.canned(format!("session for {pack}")))
  }
}

/// A recorded request seen by the fake upstream server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
  pub method: String,
  pub path: String,
  pub query: String,
  pub body: Vec<u8>,
}

/// Loopback stand-in for the canonical upstream server. Records every
/// request and answers 200 `upstream-body`.
pub struct FakeUpstream {
  pub addr: SocketAddr,
  pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl FakeUpstream {
  pub async fn spawn() -> Self {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
      .await
      .expect("bind fake upstream");
    let addr = listener.local_addr().expect("local addr");
    let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();
    let app = axum::Router::new().fallback(move |req: axum::extract::Request| {
      let recorded = recorded.clone();
      async move {
        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
        recorded.lock().push(RecordedRequest {
          method: parts.method.to_string(),
          path: parts.uri.path().to_string(),
          query: parts.uri.query().unwrap_or("").to_string(),
          body: body.to_vec(),
        });
        Bytes::from_static(b"upstream-body")
      }
    });
    tokio::spawn(async move {
      let _ = axum::serve(listener, app).await;
    });
    Self { addr, requests }
  }

  pub fn base_url(&self) -> String {
    format!("http://{}", self.addr)
  }
}

/// A full gateway wired to in-memory fakes and (optionally) a fake
/// upstream base URL.
pub struct TestGateway {
  pub scheduler: Arc<Scheduler>,
  pub packs: Arc<MemoryPacks>,
  pub boards: Arc<MemoryBoards>,
  pub router: axum::Router,
}

pub fn build_gateway(upstream: Option<String>, forward: bool) -> TestGateway {
  let scheduler = Arc::new(build_scheduler());
  let packs = Arc::new(MemoryPacks::default());
  let boards = Arc::new(MemoryBoards::default());
  let config = GatewayConfig {
    upstream: upstream.unwrap_or_else(|| "http://127.0.0.1:9".to_string()),
    forward,
    ..GatewayConfig::default()
  };
  let gateway = Arc::new(Gateway::new(
    config,
    scheduler.clone(),
    packs.clone(),
    boards.clone(),
  ));
  TestGateway {
    scheduler,
    packs,
    boards,
    router: gateway.router(),
  }
}
