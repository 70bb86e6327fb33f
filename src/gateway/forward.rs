use std::time::Duration;

use axum::body::Bytes;
use axum::http::{header, HeaderMap, Method};
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::{GatewayConfig, UPSTREAM_READ_TIMEOUT_SECS};

/// Relay to the canonical upstream server.
///
/// Forwarded requests are byte-identical to the original except for
/// addressing: same method, path (minus the local pack segment), query
/// string, headers, and body. A 2xx upstream response is passed back
/// verbatim; anything else, including transport errors, becomes the
/// protocol's "no body" failure.
pub(crate) struct Upstream {
  client: Client,
  base: String,
  /// First segment of the canonical path prefix; paths already rooted
  /// there are relayed unchanged.
  canonical_head: String,
}

impl Upstream {
  pub(crate) fn new(config: &GatewayConfig) -> Self {
    let client = Client::builder()
      .read_timeout(Duration::from_secs(UPSTREAM_READ_TIMEOUT_SECS))
      .build()
      .unwrap_or_else(|e| {
        warn!(error = %e, "upstream client options rejected; using defaults");
        Client::new()
      });
    let canonical_head = config
      .canonical_prefix
      .split('/')
      .find(|s| !s.is_empty())
      .unwrap_or_default()
      .to_string();
    Self {
      client,
      base: config.upstream.trim_end_matches('/').to_string(),
      canonical_head,
    }
  }

  pub(crate) async fn relay(
    &self,
    method: &Method,
    path: &str,
    raw_query: &str,
    headers: &HeaderMap,
    body: Bytes,
  ) -> Option<Bytes> {
    let path = self.strip_pack_segment(path);
    let url = if raw_query.is_empty() {
      format!("{}{}", self.base, path)
    } else {
      format!("{}{}?{}", self.base, path, raw_query)
    };

    let mut headers = headers.clone();
    headers.remove(header::HOST);

    let response = match self
      .client
      .request(method.clone(), &url)
      .headers(headers)
      .body(body)
      .send()
      .await
    {
      Ok(response) => response,
      Err(e) => {
        warn!(error = %e, %url, "failed to forward request to upstream");
        return None;
      }
    };

    let status = response.status();
    if !status.is_success() {
      debug!(%status, %url, "upstream returned non-success");
      return None;
    }
    response.bytes().await.ok()
  }

  // The upstream roots its tree at the canonical prefix; the local pack
  // segment is dropped unless the path is already rooted there.
  fn strip_pack_segment(&self, path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    let (first, rest) = trimmed.split_once('/').unwrap_or((trimmed, ""));
    if first == self.canonical_head {
      path.to_string()
    } else if rest.is_empty() {
      String::new()
    } else {
      format!("/{rest}")
    }
  }
}
