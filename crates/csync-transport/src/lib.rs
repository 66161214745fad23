//! Shared HTTP plumbing for the remote directory, registry and run reporter bindings.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::{RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "csync-transport";

/// Coarse status buckets. Nothing here is retried; callers decide which buckets are fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Redirect,
    ClientError,
    ServerError,
    Other,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Success
    } else if status.is_redirection() {
        StatusClass::Redirect
    } else if status.is_client_error() {
        StatusClass::ClientError
    } else if status.is_server_error() {
        StatusClass::ServerError
    } else {
        StatusClass::Other
    }
}

/// Burst size and refill interval for outgoing requests on one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    pub burst: u32,
    pub refill_every: Duration,
}

/// Request pacer: `burst` permits up front, one more every `refill_every`.
///
/// Partial intervals carry over between calls, so a steady caller settles at exactly one
/// request per interval.
#[derive(Debug)]
pub struct RequestPacer {
    config: PacingConfig,
    permits: Mutex<Permits>,
}

#[derive(Debug)]
struct Permits {
    available: u32,
    refilled_at: Instant,
}

impl Permits {
    fn refill(&mut self, config: PacingConfig, now: Instant) {
        if config.refill_every.is_zero() {
            self.available = config.burst;
            self.refilled_at = now;
            return;
        }
        let intervals = now.duration_since(self.refilled_at).as_nanos()
            / config.refill_every.as_nanos();
        if intervals == 0 {
            return;
        }
        let earned = u32::try_from(intervals).unwrap_or(u32::MAX);
        self.available = self.available.saturating_add(earned).min(config.burst);
        self.refilled_at = if self.available == config.burst {
            now
        } else {
            self.refilled_at + config.refill_every * earned
        };
    }
}

impl RequestPacer {
    pub fn new(config: PacingConfig) -> Self {
        let config = PacingConfig {
            burst: config.burst.max(1),
            ..config
        };
        Self {
            permits: Mutex::new(Permits {
                available: config.burst,
                refilled_at: Instant::now(),
            }),
            config,
        }
    }

    /// Wait until a request may go out.
    pub async fn acquire(&self) {
        loop {
            let next_refill = {
                let mut permits = self.permits.lock().await;
                permits.refill(self.config, Instant::now());
                if permits.available > 0 {
                    permits.available -= 1;
                    return;
                }
                permits.refilled_at + self.config.refill_every
            };
            tokio::time::sleep_until(next_refill).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub default_headers: HeaderMap,
    pub pacing: Option<PacingConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            default_headers: HeaderMap::new(),
            pacing: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{stage}: request failed: {source}")]
    Request {
        stage: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{stage}: reading response body failed: {source}")]
    Body {
        stage: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

/// Status line and body of a response that fell outside a capability's contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub reason: String,
    pub body: String,
}

impl ResponseSnapshot {
    pub async fn capture(stage: &'static str, resp: Response) -> Result<Self, TransportError> {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|source| TransportError::Body { stage, source })?;
        Ok(Self {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            body,
        })
    }
}

/// Location header of a redirect, if it carried a readable one.
pub fn redirect_target(resp: &Response) -> Option<String> {
    resp.headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// reqwest client with redirects disabled and optional request pacing.
///
/// Redirects are left to the caller: the registry reports lookup results as 302s.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    pacer: Option<RequestPacer>,
    name: &'static str,
}

impl HttpTransport {
    pub fn new(name: &'static str, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout)
            .default_headers(config.default_headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .with_context(|| format!("building {name} http client"))?;

        Ok(Self {
            client,
            pacer: config.pacing.map(RequestPacer::new),
            name,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send one request exactly once. Any response, whatever its status, is handed back.
    pub async fn send(
        &self,
        stage: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, TransportError> {
        if let Some(pacer) = &self.pacer {
            pacer.acquire().await;
        }

        let span = info_span!("http_call", transport = self.name, stage);
        async move {
            let resp = request
                .send()
                .await
                .map_err(|source| TransportError::Request { stage, source })?;
            debug!(status = resp.status().as_u16(), url = %resp.url(), "response received");
            Ok(resp)
        }
        .instrument(span)
        .await
    }
}
