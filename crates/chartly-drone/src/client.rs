// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP client for the control plane and for source fetches.
//!
//! Policy: 30 s per-request timeout, up to 3 attempts with 1s/2s/4s
//! backoff on transport errors and 5xx, bounded body reads, and SSRF
//! checks before every source fetch. Every call observes the shutdown
//! token, including backoff sleeps.

use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::wire::{
    HeartbeatRequest, ProfileEnvelope, RegisterRequest, RegisterResponse, ResultsRequest, Run,
    WorkResponse,
};
use crate::{DroneError, Shutdown, check_url, expand_placeholders};

/// Backoff schedule between attempts, in seconds.
const BACKOFF_SECS: [u64; 2] = [1, 2];
/// Final backoff step applied if more attempts are ever configured.
const BACKOFF_CAP_SECS: u64 = 4;

/// Series requested from the BLS timeseries endpoint, which only answers
/// POSTs with an explicit series list.
const BLS_SERIES: &[&str] = &["LNS14000000", "CUUR0000SA0"];

/// Knobs for the control-plane client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Control-plane base URL (no trailing slash).
    pub base_url: String,
    /// User-Agent header value.
    pub user_agent: String,
    /// `X-API-Key` attached to registry writes.
    pub api_key: Option<String>,
    /// Per-request deadline.
    pub timeout: Duration,
    /// Total attempts per request (first try included).
    pub max_attempts: u32,
    /// Cap on success-response bodies.
    pub max_body_bytes: usize,
    /// Cap on error-response bodies read for diagnostics.
    pub max_error_body_bytes: usize,
    /// Permit loopback source hosts. Only for tests driving local
    /// fixtures; production drones keep the SSRF guard engaged.
    pub allow_loopback_sources: bool,
}

impl ClientOptions {
    /// Defaults per the drone HTTP policy.
    #[must_use]
    pub fn new(base_url: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            user_agent: user_agent.into(),
            api_key: None,
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            max_body_bytes: 8 << 20,
            max_error_body_bytes: 1 << 20,
            allow_loopback_sources: false,
        }
    }
}

/// HTTP client for control-plane endpoints and hardened source fetches.
#[derive(Debug)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    opts: ClientOptions,
}

impl ControlPlaneClient {
    /// Build the client.
    ///
    /// # Errors
    ///
    /// [`DroneError::Transport`] if the underlying client cannot be built.
    pub fn new(opts: ClientOptions) -> Result<Self, DroneError> {
        let http = reqwest::Client::builder()
            .timeout(opts.timeout)
            .user_agent(opts.user_agent.clone())
            .build()
            .map_err(|e| DroneError::Transport {
                detail: e.to_string(),
            })?;
        Ok(Self { http, opts })
    }

    /// `POST /api/drones/register`.
    ///
    /// # Errors
    ///
    /// Transport and HTTP failures.
    pub async fn register(
        &self,
        shutdown: &Shutdown,
        drone_id: &str,
    ) -> Result<RegisterResponse, DroneError> {
        let body = serde_json::to_value(RegisterRequest {
            id: drone_id.to_string(),
        })?;
        let bytes = self
            .send(
                shutdown,
                Method::POST,
                format!("{}/api/drones/register", self.opts.base_url),
                Some(body),
                false,
            )
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// `GET /api/drones/<id>/work`. A 404 reads as an empty queue.
    ///
    /// # Errors
    ///
    /// Transport and non-404 HTTP failures.
    pub async fn work(
        &self,
        shutdown: &Shutdown,
        drone_id: &str,
    ) -> Result<Vec<String>, DroneError> {
        let result = self
            .send(
                shutdown,
                Method::GET,
                format!("{}/api/drones/{drone_id}/work", self.opts.base_url),
                None,
                false,
            )
            .await;
        match result {
            Ok(bytes) => {
                let response: WorkResponse = serde_json::from_slice(&bytes)?;
                Ok(response.profiles)
            }
            Err(DroneError::Http { status: 404, .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// `GET /api/profiles/<id>` with strict JSON decoding.
    ///
    /// # Errors
    ///
    /// Transport, HTTP, and decode failures.
    pub async fn profile(
        &self,
        shutdown: &Shutdown,
        profile_id: &str,
    ) -> Result<ProfileEnvelope, DroneError> {
        let bytes = self
            .send(
                shutdown,
                Method::GET,
                format!("{}/api/profiles/{profile_id}", self.opts.base_url),
                None,
                false,
            )
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// `POST /api/results`. The response is opaque to the drone.
    ///
    /// # Errors
    ///
    /// Transport and HTTP failures.
    pub async fn post_results(
        &self,
        shutdown: &Shutdown,
        results: &ResultsRequest,
    ) -> Result<(), DroneError> {
        self.send(
            shutdown,
            Method::POST,
            format!("{}/api/results", self.opts.base_url),
            Some(serde_json::to_value(results)?),
            false,
        )
        .await
        .map(|_| ())
    }

    /// `POST /api/runs`. The response is opaque to the drone.
    ///
    /// # Errors
    ///
    /// Transport and HTTP failures.
    pub async fn post_run(&self, shutdown: &Shutdown, run: &Run) -> Result<(), DroneError> {
        self.send(
            shutdown,
            Method::POST,
            format!("{}/api/runs", self.opts.base_url),
            Some(serde_json::to_value(run)?),
            false,
        )
        .await
        .map(|_| ())
    }

    /// `POST /api/drones/heartbeat`.
    ///
    /// # Errors
    ///
    /// Transport and HTTP failures.
    pub async fn heartbeat(&self, shutdown: &Shutdown, drone_id: &str) -> Result<(), DroneError> {
        self.send(
            shutdown,
            Method::POST,
            format!("{}/api/drones/heartbeat", self.opts.base_url),
            Some(serde_json::to_value(HeartbeatRequest {
                id: drone_id.to_string(),
            })?),
            false,
        )
        .await
        .map(|_| ())
    }

    /// `POST /api/profiles`: publish a generated profile (registry write,
    /// authenticated with `X-API-Key`).
    ///
    /// # Errors
    ///
    /// Transport and HTTP failures.
    pub async fn publish_profile(
        &self,
        shutdown: &Shutdown,
        profile: &ProfileEnvelope,
    ) -> Result<(), DroneError> {
        self.send(
            shutdown,
            Method::POST,
            format!("{}/api/profiles", self.opts.base_url),
            Some(serde_json::to_value(profile)?),
            true,
        )
        .await
        .map(|_| ())
    }

    /// Fetch source JSON through the SSRF guard.
    ///
    /// `${VAR}` placeholders expand from the process environment (missing
    /// variables fail closed). The BLS timeseries endpoint switches to a
    /// POST with its predefined series body.
    ///
    /// # Errors
    ///
    /// Placeholder, SSRF, transport, HTTP, and decode failures.
    pub async fn fetch_source(
        &self,
        shutdown: &Shutdown,
        raw_url: &str,
    ) -> Result<Value, DroneError> {
        let expanded = expand_placeholders(raw_url, |name| std::env::var(name).ok())?;
        let url = if self.opts.allow_loopback_sources {
            url::Url::parse(&expanded).map_err(|e| DroneError::InvalidUrl {
                url: expanded.clone(),
                reason: e.to_string(),
            })?
        } else {
            check_url(&expanded)?
        };

        let is_bls = url.host_str().is_some_and(|h| h.ends_with("api.bls.gov"))
            && url.path().contains("timeseries");
        let bytes = if is_bls {
            let body = serde_json::json!({ "seriesid": BLS_SERIES });
            self.send(shutdown, Method::POST, url.to_string(), Some(body), false)
                .await?
        } else {
            self.send(shutdown, Method::GET, url.to_string(), None, false)
                .await?
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Send with retry/backoff and bounded body reads.
    async fn send(
        &self,
        shutdown: &Shutdown,
        method: Method,
        url: String,
        body: Option<Value>,
        registry_write: bool,
    ) -> Result<Vec<u8>, DroneError> {
        let mut last_failure = String::new();

        for attempt in 0..self.opts.max_attempts {
            if attempt > 0 {
                let secs = BACKOFF_SECS
                    .get(attempt as usize - 1)
                    .copied()
                    .unwrap_or(BACKOFF_CAP_SECS);
                debug!(%url, attempt, backoff_secs = secs, "retrying request");
                let mut waiter = shutdown.clone();
                tokio::select! {
                    () = waiter.cancelled() => return Err(DroneError::Cancelled),
                    () = tokio::time::sleep(Duration::from_secs(secs)) => {}
                }
            }
            if shutdown.is_cancelled() {
                return Err(DroneError::Cancelled);
            }

            let mut request = self.http.request(method.clone(), &url);
            if let Some(body) = &body {
                request = request.json(body);
            }
            if registry_write && let Some(key) = &self.opts.api_key {
                request = request.header("X-API-Key", key);
            }

            let mut waiter = shutdown.clone();
            let outcome = tokio::select! {
                () = waiter.cancelled() => return Err(DroneError::Cancelled),
                outcome = request.send() => outcome,
            };

            let response = match outcome {
                Ok(response) => response,
                Err(e) => {
                    last_failure = e.to_string();
                    warn!(%url, attempt, error = %last_failure, "transport failure");
                    continue;
                }
            };

            let status = response.status();
            if status.is_server_error() {
                let snippet = self.error_snippet(response).await;
                last_failure = format!("status={} body={snippet}", status.as_u16());
                warn!(%url, attempt, %status, "server error");
                continue;
            }
            if !status.is_success() {
                let snippet = self.error_snippet(response).await;
                return Err(DroneError::Http {
                    status: status.as_u16(),
                    snippet,
                });
            }
            return self.read_bounded(response).await;
        }

        Err(DroneError::Transport {
            detail: last_failure,
        })
    }

    async fn read_bounded(&self, response: reqwest::Response) -> Result<Vec<u8>, DroneError> {
        if let Some(length) = response.content_length()
            && length > self.opts.max_body_bytes as u64
        {
            return Err(DroneError::TooBig {
                what: "response body",
                limit: self.opts.max_body_bytes,
            });
        }
        let bytes = response.bytes().await.map_err(|e| DroneError::Transport {
            detail: e.to_string(),
        })?;
        if bytes.len() > self.opts.max_body_bytes {
            return Err(DroneError::TooBig {
                what: "response body",
                limit: self.opts.max_body_bytes,
            });
        }
        Ok(bytes.to_vec())
    }

    async fn error_snippet(&self, response: reqwest::Response) -> String {
        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(_) => return String::new(),
        };
        let bounded = &bytes[..bytes.len().min(self.opts.max_error_body_bytes)];
        let text = String::from_utf8_lossy(bounded);
        let snippet: String = text.chars().take(256).collect();
        if snippet.is_empty() {
            status.canonical_reason().unwrap_or_default().to_string()
        } else {
            snippet
        }
    }
}
