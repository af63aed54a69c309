//! Forwarding of unmatched requests to the page server.

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics::PROXY_REQUESTS_TOTAL;
use crate::server::AppState;

/// Headers that describe one hop and are never copied across.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "host"
            | "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "upgrade"
            | "transfer-encoding"
            | "content-length"
    )
}

/// Why a request could not be forwarded.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The incoming body could not be read.
    #[error("failed to read request body: {0}")]
    Body(#[from] axum::Error),
    /// The page server was unreachable or returned garbage.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    /// The upstream response could not be rebuilt.
    #[error("failed to build response: {0}")]
    Response(#[from] axum::http::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Body(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) | Self::Response(_) => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}

/// Reverse proxy to a single upstream base URL.
#[derive(Clone, Debug)]
pub struct PageProxy {
    client: reqwest::Client,
    base: String,
}

impl PageProxy {
    /// Create a proxy for `base` (e.g. `http://127.0.0.1:3000`).
    pub fn new(base: impl Into<String>) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let base = base.into().trim_end_matches('/').to_string();
        Ok(Self { client, base })
    }

    /// The upstream base URL without a trailing slash.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Target URL for a request path and optional query.
    pub fn target_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base, path_and_query)
    }

    /// Replay `req` against the upstream and relay its response.
    pub async fn forward(&self, req: Request) -> Result<Response, ProxyError> {
        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        let url = self.target_url(path_and_query);
        let body = to_bytes(body, usize::MAX).await?;

        let upstream = self
            .client
            .request(parts.method.clone(), &url)
            .headers(forwarded_headers(&parts.headers))
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let headers = forwarded_headers(upstream.headers());
        let bytes = upstream.bytes().await?;
        debug!(method = %parts.method, url = %url, status = status.as_u16(), "proxied request");

        let mut builder = axum::http::Response::builder().status(status);
        if let Some(h) = builder.headers_mut() {
            h.extend(headers);
        }
        Ok(builder.body(Body::from(bytes))?)
    }
}

fn forwarded_headers(src: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(src.len());
    for (name, value) in src {
        if !is_hop_by_hop(name) {
            let _ = out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Fallback handler: forward to the page server, or 404 if none is set.
pub async fn forward_handler(State(state): State<AppState>, req: Request) -> Response {
    let Some(proxy) = state.proxy.as_ref() else {
        counter!(PROXY_REQUESTS_TOTAL, "outcome" => "no_upstream").increment(1);
        return StatusCode::NOT_FOUND.into_response();
    };
    let method = req.method().clone();
    let uri = req.uri().clone();
    match proxy.forward(req).await {
        Ok(resp) => {
            counter!(PROXY_REQUESTS_TOTAL, "outcome" => "ok").increment(1);
            resp
        }
        Err(e) => {
            counter!(PROXY_REQUESTS_TOTAL, "outcome" => "error").increment(1);
            warn!(%method, %uri, error = %e, "proxy request failed");
            e.into_response()
        }
    }
}
