//! Leaderboard protocol gateway.
//!
//! A stateless router over the scheduler and external data store: each
//! request is classified by pack and operation, served locally when the
//! pack is enabled and hosted here, and otherwise relayed byte-for-byte to
//! the canonical upstream server. Score submissions run inside the
//! scheduler's admin lock so a shutdown sequence never interleaves with a
//! half-applied write.
//!
//! `Expect: 100-continue` uploads are safe: the HTTP layer acknowledges the
//! handshake when the handler starts consuming the body, and the handler
//! always drains the body before making any routing decision.

mod forward;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Bytes};
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::scheduler::Scheduler;
use forward::Upstream;

// Operation strings as they appear on the wire.
pub const OP_GET_SCORES: &str = "get_scores";
pub const OP_GET_REPLAY: &str = "get_replay";
pub const OP_GET_SEARCH: &str = "search/levels";
pub const OP_POST_SCORE: &str = "submit_score";
pub const OP_POST_LOGIN: &str = "login";

/// Decoded query-string parameters.
pub type QueryMap = HashMap<String, String>;

/// Status of a pack in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackInfo {
  /// Administratively enabled.
  pub enabled: bool,
  /// Served by this gateway rather than the upstream.
  pub local: bool,
}

/// Registry mapping pack codes to their status. Consulted on every request,
/// so toggling a pack takes effect for the next request without affecting
/// handlers already in flight.
pub trait PackRegistry: Send + Sync {
  fn resolve(&self, code: &str) -> Option<PackInfo>;
}

/// Local persistence and validation for the operations the gateway serves
/// itself. Payloads are opaque to the gateway: `Some(body)` becomes a 200
/// with the body verbatim, `None` the protocol's fixed empty 400, and `Err`
/// is logged and treated as `None`.
#[async_trait]
pub trait LeaderboardStore: Send + Sync {
  async fn scores(&self, pack: &str, query: &QueryMap) -> anyhow::Result<Option<Bytes>>;
  async fn replay(&self, pack: &str, query: &QueryMap) -> anyhow::Result<Option<Bytes>>;
  async fn search(&self, pack: &str, query: &QueryMap) -> anyhow::Result<Option<Bytes>>;
  async fn submit_score(
    &self,
    pack: &str,
    query: &QueryMap,
    body: &Bytes,
  ) -> anyhow::Result<Option<Bytes>>;
  /// Identity tracking is global: called for every login, including packs
  /// the registry does not know.
  async fn login(&self, pack: &str, query: &QueryMap, body: &Bytes)
    -> anyhow::Result<Option<Bytes>>;
}

/// The protocol gateway. Stateless across requests; all shared state lives
/// in the injected scheduler, registry, and store.
pub struct Gateway {
  config: GatewayConfig,
  scheduler: Arc<Scheduler>,
  packs: Arc<dyn PackRegistry>,
  store: Arc<dyn LeaderboardStore>,
  upstream: Upstream,
  metrics: Metrics,
}

impl Gateway {
  pub fn new(
    config: GatewayConfig,
    scheduler: Arc<Scheduler>,
    packs: Arc<dyn PackRegistry>,
    store: Arc<dyn LeaderboardStore>,
  ) -> Self {
    let upstream = Upstream::new(&config);
    let metrics = scheduler.metrics_handle();
    Self {
      config,
      scheduler,
      packs,
      store,
      upstream,
      metrics,
    }
  }

  /// Assemble the router. Paths are positional (`/<pack>/.../<operation>`),
  /// so everything goes through one fallback handler.
  pub fn router(self: Arc<Self>) -> Router {
    Router::new()
      .fallback(handle)
      .with_state(self)
      .layer(TraceLayer::new_for_http())
  }

  /// Serve the gateway on `listener` until the server future is dropped.
  pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
      info!(%addr, "gateway listening");
    }
    axum::serve(listener, self.router()).await
  }

  async fn dispatch(&self, req: Request) -> anyhow::Result<Response> {
    let (parts, body) = req.into_parts();
    let method = parts.method;

    // Empty requests get the protocol's fixed failure reply.
    let Some(target) = RequestTarget::parse(parts.uri.path(), &self.config.canonical_prefix)
    else {
      return Ok(reply(None));
    };

    // Drain the body before any routing decision; this is also what
    // acknowledges an Expect: 100-continue handshake.
    let body = to_bytes(body, self.config.max_body_bytes)
      .await
      .map_err(|e| anyhow::anyhow!("failed to read request body: {e}"))?;
    let query = parse_query(&parts.uri)?;
    let raw_query = parts.uri.query().unwrap_or("").to_string();

    debug!(
      method = %method,
      pack = %target.pack,
      operation = %target.operation,
      bytes = body.len(),
      "gateway request"
    );

    // Logins are handled locally for every pack, known or not: client
    // identity tracking is global.
    if method == Method::POST && target.operation == OP_POST_LOGIN {
      let outcome = self.local(self.store.login(&target.pack, &query, &body)).await;
      return Ok(reply(outcome));
    }

    if !self.serves_locally(&target.pack) {
      return Ok(
        self
          .forward(&method, parts.uri.path(), &raw_query, &parts.headers, body)
          .await,
      );
    }

    let local = match (method.as_str(), target.operation.as_str()) {
      ("GET", OP_GET_SCORES) => {
        Some(self.local(self.store.scores(&target.pack, &query)).await)
      }
      ("GET", OP_GET_REPLAY) => {
        Some(self.local(self.store.replay(&target.pack, &query)).await)
      }
      ("GET", OP_GET_SEARCH) => {
        Some(self.local(self.store.search(&target.pack, &query)).await)
      }
      ("POST", OP_POST_SCORE) => {
        // Serialized against administrative shutdown: no score write is
        // ever observed half-applied, and no shutdown starts while a
        // submission is in flight.
        let submitted = self
          .scheduler
          .with_lock(|| self.store.submit_score(&target.pack, &query, &body));
        Some(self.local(submitted).await)
      }
      _ => None,
    };

    match local {
      Some(outcome) => Ok(reply(outcome)),
      // Anything not explicitly recognized is forwarded, never rejected.
      None => Ok(
        self
          .forward(&method, parts.uri.path(), &raw_query, &parts.headers, body)
          .await,
      ),
    }
  }

  fn serves_locally(&self, pack: &str) -> bool {
    matches!(
      self.packs.resolve(pack),
      Some(info) if info.enabled && info.local
    )
  }

  /// Run a local handler future, logging and absorbing its error: one bad
  /// request must never take down the handling task.
  async fn local<F>(&self, handler: F) -> Option<Bytes>
  where
    F: std::future::Future<Output = anyhow::Result<Option<Bytes>>>,
  {
    match handler.await {
      Ok(body) => body,
      Err(e) => {
        Metrics::inc(&self.metrics.http_errors);
        warn!(error = %e, "local handler failed");
        None
      }
    }
  }

  async fn forward(
    &self,
    method: &Method,
    path: &str,
    raw_query: &str,
    headers: &axum::http::HeaderMap,
    body: Bytes,
  ) -> Response {
    if !self.config.forward {
      return reply(None);
    }
    Metrics::inc(&self.metrics.http_forwards);
    reply(self.upstream.relay(method, path, raw_query, headers, body).await)
  }
}

/// Top-level handler: classify and dispatch, converting any internal error
/// into the protocol's fixed failure reply.
async fn handle(State(gateway): State<Arc<Gateway>>, req: Request) -> Response {
  Metrics::inc(&gateway.metrics.http_requests);
  match gateway.dispatch(req).await {
    Ok(response) => response,
    Err(e) => {
      Metrics::inc(&gateway.metrics.http_errors);
      warn!(error = %e, "failed to handle request");
      reply(None)
    }
  }
}

/// Body-present ⇒ 200 with the body as-is; body-absent ⇒ 400 with an empty
/// body. No internal detail ever leaks into a response.
fn reply(body: Option<Bytes>) -> Response {
  match body {
    Some(bytes) => (StatusCode::OK, bytes).into_response(),
    None => StatusCode::BAD_REQUEST.into_response(),
  }
}

fn parse_query(uri: &Uri) -> anyhow::Result<QueryMap> {
  if uri.query().is_none() {
    return Ok(QueryMap::new());
  }
  let axum::extract::Query(map) = axum::extract::Query::<QueryMap>::try_from_uri(uri)
    .map_err(|e| anyhow::anyhow!("malformed query string: {e}"))?;
  Ok(map)
}

/// Pack and operation extracted from a request path of the form
/// `/<pack>/<canonical prefix...>/<operation...>`.
#[derive(Debug, PartialEq, Eq)]
struct RequestTarget {
  pack: String,
  operation: String,
}

impl RequestTarget {
  fn parse(path: &str, canonical_prefix: &str) -> Option<Self> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    let pack = segments.next()?.to_string();
    let rest: Vec<&str> = segments.collect();
    let prefix: Vec<&str> = canonical_prefix.split('/').filter(|s| !s.is_empty()).collect();
    let rest = if rest.len() >= prefix.len() && rest[..prefix.len()] == prefix[..] {
      &rest[prefix.len()..]
    } else {
      &rest[..]
    };
    Some(Self {
      pack,
      operation: rest.join("/"),
    })
  }
}
